use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use calldk_contracts::content::ContentBlock;
use calldk_engine::adapter::{ToolAdapter, TOOL_DESCRIPTION, TOOL_NAME};
use calldk_engine::background::{BackgroundTasks, DEFAULT_SHUTDOWN_GRACE};
use serde_json::{json, Value};

const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// Reads one request. Accepts `Content-Length` framed messages as well as one
/// JSON document per line; blank lines between messages are skipped.
pub fn read_message(reader: &mut impl BufRead) -> io::Result<Option<Value>> {
    let mut first_line = String::new();
    loop {
        first_line.clear();
        if reader.read_line(&mut first_line)? == 0 {
            return Ok(None);
        }
        if !first_line.trim().is_empty() {
            break;
        }
    }

    if first_line.to_ascii_lowercase().starts_with("content-length:") {
        let mut content_length = header_length(&first_line).unwrap_or(0);
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 || line.trim().is_empty() {
                break;
            }
            if line.to_ascii_lowercase().starts_with("content-length:") {
                content_length = header_length(&line).unwrap_or(content_length);
            }
        }
        if content_length == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing or zero Content-Length",
            ));
        }
        let mut buffer = vec![0u8; content_length];
        reader.read_exact(&mut buffer)?;
        serde_json::from_slice(&buffer)
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("invalid json: {err}")))
    } else {
        serde_json::from_str(first_line.trim())
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("invalid json: {err}")))
    }
}

fn header_length(line: &str) -> Option<usize> {
    line.split(':').nth(1)?.trim().parse::<usize>().ok()
}

/// Newline-delimited writer shared by the read loop and tool workers.
#[derive(Clone)]
pub struct ResponseWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ResponseWriter {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn send(&self, value: &Value) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        let mut writer = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("response writer lock poisoned"))?;
        writer.write_all(payload.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

pub fn tool_definitions() -> Value {
    json!([{
        "name": TOOL_NAME,
        "description": TOOL_DESCRIPTION,
        "inputSchema": {
            "type": "object",
            "properties": {},
            "additionalProperties": false
        }
    }])
}

pub fn content_json(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text(text) => json!({ "type": "text", "text": text }),
        ContentBlock::Image { bytes, format } => json!({
            "type": "image",
            "data": BASE64.encode(bytes),
            "mimeType": format!("image/{}", format.as_str()),
        }),
    }
}

pub fn tool_result(outcome: Result<Vec<ContentBlock>, String>) -> Value {
    match outcome {
        Ok(blocks) => json!({
            "content": blocks.iter().map(content_json).collect::<Vec<_>>(),
            "isError": false
        }),
        Err(message) => json!({
            "content": [{ "type": "text", "text": message }],
            "isError": true
        }),
    }
}

fn success(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn failure(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

/// What the read loop should do with one incoming message.
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    Reply(Value),
    CallTool(Value),
    Ignore,
    Shutdown(Value),
}

pub fn dispatch(message: &Value) -> Dispatch {
    let id = message.get("id").cloned().filter(|id| !id.is_null());
    let method = message.get("method").and_then(Value::as_str).unwrap_or("");
    let params = message.get("params").cloned().unwrap_or_else(|| json!({}));

    let Some(id) = id else {
        if method != "notifications/initialized" {
            tracing::debug!(method, "ignoring notification");
        }
        return Dispatch::Ignore;
    };

    match method {
        "initialize" => {
            let protocol = params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_PROTOCOL_VERSION);
            Dispatch::Reply(success(
                &id,
                json!({
                    "protocolVersion": protocol,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "calldk",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            ))
        }
        "ping" => Dispatch::Reply(success(&id, json!({}))),
        "tools/list" => Dispatch::Reply(success(&id, json!({ "tools": tool_definitions() }))),
        "tools/call" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            if name == TOOL_NAME {
                Dispatch::CallTool(id)
            } else {
                Dispatch::Reply(failure(&id, INVALID_PARAMS, &format!("unknown tool: {name}")))
            }
        }
        "shutdown" => Dispatch::Shutdown(success(&id, Value::Null)),
        _ => Dispatch::Reply(failure(&id, METHOD_NOT_FOUND, "method not found")),
    }
}

pub fn serve(adapter: ToolAdapter) -> Result<()> {
    let mut reader = BufReader::new(io::stdin());
    serve_on(&mut reader, ResponseWriter::new(io::stdout()), adapter)
}

/// Serves `call_dk` until the input ends or `shutdown` arrives. Dialogs still
/// open at that point are closed, and their calls are answered before this
/// returns.
pub fn serve_on(reader: &mut impl BufRead, writer: ResponseWriter, adapter: ToolAdapter) -> Result<()> {
    let adapter = Arc::new(adapter);
    let mut calls: BackgroundTasks<()> = BackgroundTasks::new();
    tracing::info!(tool = TOOL_NAME, "mcp server listening on stdio");

    let served = serve_with(reader, &writer, |id, writer| {
        let adapter = Arc::clone(&adapter);
        let writer = writer.clone();
        calls.spawn("tool-call", move |cancel| {
            let outcome = adapter.invoke_cancellable(cancel).map_err(|err| {
                tracing::warn!(error = %err, "call_dk failed");
                err.to_string()
            });
            if let Err(err) = writer.send(&success(&id, tool_result(outcome))) {
                tracing::error!(error = %err, "failed to write tool result");
            }
            None
        })?;
        Ok(())
    });

    let open = calls.pending();
    if open > 0 {
        tracing::info!(open, "closing dialogs still open at shutdown");
    }
    let report = calls.shutdown(DEFAULT_SHUTDOWN_GRACE);
    if !report.detached.is_empty() {
        tracing::warn!(calls = report.detached.len(), "tool calls did not finish before exit");
    }
    served
}

/// Runs the request loop until end of input or `shutdown`. `call_tool` is
/// handed each `tools/call` id and must arrange for the reply itself.
pub fn serve_with<F>(reader: &mut impl BufRead, writer: &ResponseWriter, mut call_tool: F) -> Result<()>
where
    F: FnMut(Value, &ResponseWriter) -> Result<()>,
{
    loop {
        let message = match read_message(reader) {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(error = %err, "skipping unreadable message");
                continue;
            }
            Err(err) => return Err(err).context("failed to read from stdin"),
        };
        match dispatch(&message) {
            Dispatch::Reply(response) => writer.send(&response)?,
            Dispatch::CallTool(id) => call_tool(id, writer)?,
            Dispatch::Ignore => {}
            Dispatch::Shutdown(response) => {
                writer.send(&response)?;
                break;
            }
        }
    }
    tracing::info!("mcp server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor, Write};
    use std::sync::{Arc, Mutex};

    use calldk_contracts::content::{ContentBlock, ImageFormat};
    use serde_json::{json, Value};

    use super::{content_json, dispatch, read_message, serve_with, tool_result, Dispatch, ResponseWriter};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn lines(&self) -> Vec<Value> {
            let raw = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
            raw.lines().map(|line| serde_json::from_str(line).unwrap()).collect()
        }
    }

    #[test]
    fn reads_both_framings() -> anyhow::Result<()> {
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        let input = format!(
            "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n{body}\n\n{{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/list\"}}\n",
            body.len()
        );
        let mut reader = BufReader::new(Cursor::new(input.into_bytes()));
        let first = read_message(&mut reader)?.expect("framed message");
        assert_eq!(first["method"], "ping");
        let second = read_message(&mut reader)?.expect("line message");
        assert_eq!(second["id"], 2);
        assert!(read_message(&mut reader)?.is_none());
        Ok(())
    }

    #[test]
    fn initialize_echoes_protocol_version() {
        let reply = dispatch(&json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "initialize",
            "params": { "protocolVersion": "2025-03-26" }
        }));
        let Dispatch::Reply(reply) = reply else {
            panic!("expected reply");
        };
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"]["protocolVersion"], "2025-03-26");
        assert!(reply["result"]["capabilities"]["tools"].is_object());
    }

    #[test]
    fn lists_single_argumentless_tool() {
        let Dispatch::Reply(reply) = dispatch(&json!({ "id": 1, "method": "tools/list" })) else {
            panic!("expected reply");
        };
        let tools = reply["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "call_dk");
        assert_eq!(tools[0]["inputSchema"]["properties"], json!({}));
    }

    #[test]
    fn notifications_and_unknown_methods() {
        assert_eq!(
            dispatch(&json!({ "method": "notifications/initialized" })),
            Dispatch::Ignore
        );
        let Dispatch::Reply(reply) = dispatch(&json!({ "id": "a", "method": "resources/list" })) else {
            panic!("expected reply");
        };
        assert_eq!(reply["error"]["code"], -32601);

        let Dispatch::Reply(reply) =
            dispatch(&json!({ "id": 3, "method": "tools/call", "params": { "name": "other" } }))
        else {
            panic!("expected reply");
        };
        assert_eq!(reply["error"]["code"], -32602);
    }

    #[test]
    fn content_blocks_serialize_for_the_wire() {
        let text = content_json(&ContentBlock::text("hello"));
        assert_eq!(text, json!({ "type": "text", "text": "hello" }));

        let image = content_json(&ContentBlock::Image {
            bytes: vec![1, 2, 3],
            format: ImageFormat::Jpeg,
        });
        assert_eq!(image["type"], "image");
        assert_eq!(image["data"], "AQID");
        assert_eq!(image["mimeType"], "image/jpeg");
    }

    #[test]
    fn failed_call_is_an_error_result() {
        let result = tool_result(Err("dialog exited with status 1".to_string()));
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "dialog exited with status 1");

        let result = tool_result(Ok(vec![ContentBlock::text("ok")]));
        assert_eq!(result["isError"], false);
        assert_eq!(result["content"].as_array().unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn end_of_input_closes_open_dialog_and_answers_the_call() -> anyhow::Result<()> {
        use std::fs;
        use std::thread;
        use std::time::Duration;

        use calldk_engine::adapter::ToolAdapter;
        use calldk_engine::handoff::{DialogCommand, DialogLauncher};

        use super::serve_on;

        let temp = tempfile::tempdir()?;
        let work = temp.path().join("work");
        fs::create_dir_all(&work)?;
        let marker = temp.path().join("dialog-finished");
        let script = format!("sleep 3; touch '{}'", marker.display());
        let launcher = DialogLauncher::new(
            DialogCommand::new("sh").with_args(["-c", script.as_str(), "calldk-dialog"]),
        )
        .with_temp_dir(&work);

        let input = "{\"jsonrpc\":\"2.0\",\"id\":9,\"method\":\"tools/call\",\"params\":{\"name\":\"call_dk\"}}\n";
        let buffer = SharedBuffer::default();
        let mut reader = BufReader::new(Cursor::new(input.as_bytes().to_vec()));
        serve_on(&mut reader, ResponseWriter::new(buffer.clone()), ToolAdapter::new(launcher))?;

        let replies = buffer.lines();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["id"], 9);
        assert_eq!(replies[0]["result"]["isError"], true);
        assert_eq!(fs::read_dir(&work)?.count(), 0);

        thread::sleep(Duration::from_millis(3500));
        assert!(!marker.exists(), "dialog kept running after the server stopped");
        Ok(())
    }

    #[test]
    fn loop_routes_calls_and_stops_on_shutdown() -> anyhow::Result<()> {
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{}}\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n",
            "not json\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/call\",\"params\":{\"name\":\"call_dk\"}}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"shutdown\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":4,\"method\":\"ping\"}\n",
        );
        let buffer = SharedBuffer::default();
        let writer = ResponseWriter::new(buffer.clone());
        let mut reader = BufReader::new(Cursor::new(input.as_bytes().to_vec()));
        let mut called = Vec::new();
        serve_with(&mut reader, &writer, |id, writer| {
            called.push(id.clone());
            writer.send(&json!({ "jsonrpc": "2.0", "id": id, "result": tool_result(Ok(Vec::new())) }))
        })?;

        assert_eq!(called, vec![json!(2)]);
        let replies = buffer.lines();
        let ids: Vec<Value> = replies.iter().map(|reply| reply["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
        Ok(())
    }
}
