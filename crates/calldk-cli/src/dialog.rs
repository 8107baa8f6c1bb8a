use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, OnceLock};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use calldk_contracts::content::ImageFormat;
use calldk_engine::background::{BackgroundTasks, DEFAULT_SHUTDOWN_GRACE};
use calldk_engine::codec;
use calldk_engine::optimizer::{OptimizerError, TextOptimizer};
use calldk_engine::session::{
    CompletedOptimization, DialogSession, OptimizationOutcome, SessionOutcome,
};

pub const DEFAULT_PROMPT: &str = "I have implemented the changes you requested.";

const HELP: &str = "\
Type feedback lines; each line is appended to the draft.
  /image <path>...  attach image files
  /remove <n>       remove attached image n
  /clear            remove all attached images
  /list             list attached images
  /optimize         rewrite the draft with the prompt optimizer
  /undo             restore the draft from before the last optimize
  /show             print the current draft
  /status           optimizer and image support status
  /submit           send the feedback and close
  /quit             close without sending
  /help             show this help";

/// One line of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Text(String),
    Image(Vec<String>),
    Remove(usize),
    Clear,
    List,
    Optimize,
    Undo,
    Show,
    Status,
    Submit,
    Quit,
    Help,
    Invalid(String),
}

pub fn parse_input(line: &str) -> Input {
    let trimmed = line.trim();
    if !trimmed.starts_with('/') {
        return Input::Text(line.trim_end_matches(['\r', '\n']).to_string());
    }
    let (command, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (trimmed, ""),
    };
    match command {
        "/image" => match shell_words::split(rest) {
            Ok(paths) if !paths.is_empty() => Input::Image(paths),
            Ok(_) => Input::Invalid("usage: /image <path>...".to_string()),
            Err(err) => Input::Invalid(format!("cannot parse paths: {err}")),
        },
        "/remove" => match rest.parse::<usize>() {
            Ok(position) if position > 0 => Input::Remove(position),
            _ => Input::Invalid("usage: /remove <n> (n starts at 1)".to_string()),
        },
        "/clear" => Input::Clear,
        "/list" => Input::List,
        "/optimize" => Input::Optimize,
        "/undo" => Input::Undo,
        "/show" => Input::Show,
        "/status" => Input::Status,
        "/submit" => Input::Submit,
        "/quit" => Input::Quit,
        "/help" => Input::Help,
        other => Input::Invalid(format!("unknown command {other}; type /help")),
    }
}

pub enum DialogEvent {
    Input(String),
    InputClosed,
    ImageSupport(Vec<ImageFormat>),
    OptimizerReady(Box<dyn TextOptimizer>),
    Optimized(CompletedOptimization),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

/// Optimizer handle the session owns from the start; the real client is
/// filled in once its background construction finishes.
#[derive(Default)]
struct DeferredOptimizer {
    inner: OnceLock<Box<dyn TextOptimizer>>,
}

impl DeferredOptimizer {
    fn install(&self, optimizer: Box<dyn TextOptimizer>) -> bool {
        self.inner.set(optimizer).is_ok()
    }

    fn is_loaded(&self) -> bool {
        self.inner.get().is_some()
    }
}

impl TextOptimizer for DeferredOptimizer {
    fn is_available(&self) -> bool {
        self.inner.get().is_some_and(|optimizer| optimizer.is_available())
    }

    fn status_message(&self) -> String {
        match self.inner.get() {
            Some(optimizer) => optimizer.status_message(),
            None => "Prompt optimization client is still loading.".to_string(),
        }
    }

    fn optimize(&self, text: &str) -> Result<String, OptimizerError> {
        match self.inner.get() {
            Some(optimizer) => optimizer.optimize(text),
            None => Err(OptimizerError::NotAvailable(self.status_message())),
        }
    }
}

pub struct FeedbackDialog<W: Write> {
    session: DialogSession,
    tasks: BackgroundTasks<DialogEvent>,
    optimizer: Arc<DeferredOptimizer>,
    image_support: Option<Vec<ImageFormat>>,
    out: W,
}

impl<W: Write> FeedbackDialog<W> {
    /// Opens the session and starts the image-support probe and the
    /// optimizer construction in the background.
    pub fn start<F>(load_optimizer: F, out: W) -> Result<Self>
    where
        F: FnOnce() -> Box<dyn TextOptimizer> + Send + 'static,
    {
        let optimizer = Arc::new(DeferredOptimizer::default());
        let session = DialogSession::new(optimizer.clone());
        let mut tasks = BackgroundTasks::new();
        tasks.spawn("image-support", |_| {
            Some(DialogEvent::ImageSupport(codec::probe_output_formats()))
        })?;
        tasks.spawn("optimizer-client", move |_| {
            Some(DialogEvent::OptimizerReady(load_optimizer()))
        })?;
        Ok(Self {
            session,
            tasks,
            optimizer,
            image_support: None,
            out,
        })
    }

    pub fn sender(&self) -> mpsc::Sender<DialogEvent> {
        self.tasks.sender()
    }

    pub fn session(&self) -> &DialogSession {
        &self.session
    }

    pub fn image_support_ready(&self) -> bool {
        self.image_support.is_some()
    }

    pub fn optimizer_loaded(&self) -> bool {
        self.optimizer.is_loaded()
    }

    pub fn greet(&mut self, project_directory: &Path, prompt: &str) -> Result<()> {
        writeln!(self.out, "{prompt}")?;
        writeln!(self.out, "Project: {}", project_directory.display())?;
        writeln!(self.out, "Type your feedback, /submit to send or /help for commands.")?;
        self.out.flush()?;
        Ok(())
    }

    /// Handles the next queued event, waiting at most `timeout`. Returns
    /// `Done` once the session has ended or every producer is gone.
    pub fn pump(&mut self, timeout: Duration) -> Result<Flow> {
        match self.tasks.recv_timeout(timeout) {
            Ok(event) => self.handle_event(event),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(Flow::Continue),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.session.abandon();
                Ok(Flow::Done)
            }
        }
    }

    pub fn handle_event(&mut self, event: DialogEvent) -> Result<Flow> {
        match event {
            DialogEvent::Input(line) => return self.handle_input(parse_input(&line)),
            DialogEvent::InputClosed => {
                tracing::info!("input closed; abandoning dialog");
                self.session.abandon();
                return Ok(Flow::Done);
            }
            DialogEvent::ImageSupport(formats) => {
                tracing::debug!(formats = ?formats, "image support ready");
                self.image_support = Some(formats);
            }
            DialogEvent::OptimizerReady(optimizer) => {
                let available = optimizer.is_available();
                let message = optimizer.status_message();
                self.optimizer.install(optimizer);
                if !available {
                    writeln!(self.out, "{message}")?;
                }
            }
            DialogEvent::Optimized(completed) => {
                match self.session.apply_optimization(completed)? {
                    OptimizationOutcome::Applied => {
                        writeln!(self.out, "Optimized draft:\n{}", self.session.draft_text())?;
                        writeln!(self.out, "Use /undo to restore the previous text.")?;
                    }
                    OptimizationOutcome::Superseded => {}
                    OptimizationOutcome::Empty => {
                        writeln!(self.out, "The optimizer returned no text; draft unchanged.")?;
                    }
                    OptimizationOutcome::Failed(err) => {
                        writeln!(self.out, "Optimization failed: {err}")?;
                    }
                }
            }
        }
        self.out.flush()?;
        Ok(Flow::Continue)
    }

    fn handle_input(&mut self, input: Input) -> Result<Flow> {
        match input {
            Input::Text(line) => self.session.append_draft_line(&line)?,
            Input::Image(paths) => {
                if self.image_support.is_none() {
                    writeln!(self.out, "Image support is still loading; try again in a moment.")?;
                } else {
                    for result in self.session.add_images(&paths)? {
                        match result {
                            Ok(filename) => writeln!(self.out, "Attached {filename}")?,
                            Err(err) => writeln!(self.out, "Could not attach image: {err}")?,
                        }
                    }
                }
            }
            Input::Remove(position) => match self.session.remove_image(position - 1) {
                Ok(image) => writeln!(self.out, "Removed {}", image.filename)?,
                Err(err) => writeln!(self.out, "{err}")?,
            },
            Input::Clear => {
                self.session.clear_images()?;
                writeln!(self.out, "Removed all images.")?;
            }
            Input::List => self.list_images()?,
            Input::Optimize => match self.session.request_optimize(self.session.draft_text().to_string()) {
                Ok(pending) => {
                    writeln!(self.out, "Optimizing draft...")?;
                    self.tasks
                        .spawn("optimize", move |_| Some(DialogEvent::Optimized(pending.run())))?;
                }
                Err(err) => writeln!(self.out, "{err}")?,
            },
            Input::Undo => {
                if self.session.undo_optimize()? {
                    writeln!(self.out, "Restored draft:\n{}", self.session.draft_text())?;
                } else {
                    writeln!(self.out, "Nothing to undo.")?;
                }
            }
            Input::Show => {
                if self.session.draft_text().trim().is_empty() {
                    writeln!(self.out, "(draft is empty)")?;
                } else {
                    writeln!(self.out, "{}", self.session.draft_text())?;
                }
            }
            Input::Status => {
                writeln!(self.out, "Optimizer: {}", self.optimizer.status_message())?;
                match &self.image_support {
                    Some(formats) => {
                        let names: Vec<&str> = formats.iter().map(|format| format.as_str()).collect();
                        writeln!(self.out, "Image support: {}", names.join(", "))?;
                    }
                    None => writeln!(self.out, "Image support: loading")?,
                }
                if self.session.optimization_in_flight() {
                    writeln!(self.out, "An optimization is running.")?;
                }
            }
            Input::Submit => {
                self.session.finalize()?;
                return Ok(Flow::Done);
            }
            Input::Quit => {
                self.session.abandon();
                return Ok(Flow::Done);
            }
            Input::Help => writeln!(self.out, "{HELP}")?,
            Input::Invalid(message) => writeln!(self.out, "{message}")?,
        }
        self.out.flush()?;
        Ok(Flow::Continue)
    }

    fn list_images(&mut self) -> Result<()> {
        if self.session.images().is_empty() {
            writeln!(self.out, "No images attached.")?;
            return Ok(());
        }
        for (index, image) in self.session.images().iter().enumerate() {
            let preview = match codec::thumbnail(image) {
                Ok(thumb) => format!("{}x{} preview", thumb.width(), thumb.height()),
                Err(_) => "no preview".to_string(),
            };
            writeln!(
                self.out,
                "{}. {} ({}, {preview})",
                index + 1,
                image.filename,
                image.mime_type
            )?;
        }
        Ok(())
    }

    /// Cancels outstanding background work, waiting briefly, and returns how
    /// the session ended.
    pub fn close(mut self) -> SessionOutcome {
        self.stop_background();
        self.session.into_outcome()
    }

    /// Closes the dialog and delivers the outcome: to `output_file` when
    /// given, otherwise printed on the dialog's own output.
    pub fn finish(mut self, output_file: Option<&Path>) -> Result<()> {
        self.stop_background();
        let outcome = self.session.into_outcome();
        write_outcome(outcome, output_file, &mut self.out)?;
        self.out.flush()?;
        Ok(())
    }

    fn stop_background(&mut self) {
        let report = self.tasks.shutdown(DEFAULT_SHUTDOWN_GRACE);
        if !report.detached.is_empty() {
            tracing::warn!(tasks = ?report.detached, "left background tasks running at exit");
        }
    }
}

/// Where the operator types and reads.
pub struct Terminal {
    pub input: Box<dyn BufRead + Send>,
    pub output: Box<dyn Write + Send>,
}

impl Terminal {
    /// The controlling terminal in both directions when there is one. The
    /// launcher nulls the dialog's stdio, so stdin and stdout are only the
    /// fallback.
    pub fn open() -> Self {
        let tty = File::open("/dev/tty").and_then(|input| {
            let output = OpenOptions::new().write(true).open("/dev/tty")?;
            Ok((input, output))
        });
        match tty {
            Ok((input, output)) => Self {
                input: Box::new(BufReader::new(input)),
                output: Box::new(output),
            },
            Err(err) => {
                tracing::debug!(error = %err, "no controlling terminal; using stdin and stdout");
                Self {
                    input: Box::new(BufReader::new(io::stdin())),
                    output: Box::new(io::stdout()),
                }
            }
        }
    }
}

fn spawn_input_reader(reader: Box<dyn BufRead + Send>, sender: mpsc::Sender<DialogEvent>) -> Result<()> {
    thread::Builder::new()
        .name("calldk-input".to_string())
        .spawn(move || {
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if sender.send(DialogEvent::Input(line)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to read input");
                        break;
                    }
                }
            }
            let _ = sender.send(DialogEvent::InputClosed);
        })
        .context("failed to spawn input reader")?;
    Ok(())
}

pub fn write_outcome(outcome: SessionOutcome, output_file: Option<&Path>, out: &mut impl Write) -> Result<()> {
    match output_file {
        Some(path) => {
            let envelope = outcome.into_envelope();
            envelope
                .write_to(path)
                .with_context(|| format!("failed to write feedback to {}", path.display()))?;
            tracing::info!(path = %path.display(), images = envelope.images.len(), "feedback written");
        }
        None => match outcome {
            SessionOutcome::Cancelled => writeln!(out, "No feedback submitted.")?,
            SessionOutcome::Submitted(envelope) => {
                writeln!(out, "Received feedback:\n{}", envelope.text)?;
                if envelope.images.is_empty() {
                    writeln!(out, "No images attached.")?;
                } else {
                    writeln!(out, "Attached images:")?;
                    for image in &envelope.images {
                        writeln!(out, "- {} ({})", image.filename, image.mime_type)?;
                    }
                }
            }
        },
    }
    Ok(())
}

pub fn run<F>(
    project_directory: PathBuf,
    prompt: &str,
    output_file: Option<PathBuf>,
    load_optimizer: F,
) -> Result<()>
where
    F: FnOnce() -> Box<dyn TextOptimizer> + Send + 'static,
{
    run_on(
        Terminal::open(),
        &project_directory,
        prompt,
        output_file.as_deref(),
        load_optimizer,
    )
}

pub fn run_on<F>(
    terminal: Terminal,
    project_directory: &Path,
    prompt: &str,
    output_file: Option<&Path>,
    load_optimizer: F,
) -> Result<()>
where
    F: FnOnce() -> Box<dyn TextOptimizer> + Send + 'static,
{
    let Terminal { input, output } = terminal;
    let mut dialog = FeedbackDialog::start(load_optimizer, output)?;
    dialog.greet(project_directory, prompt)?;
    spawn_input_reader(input, dialog.sender())?;

    while dialog.pump(Duration::from_millis(250))? == Flow::Continue {}
    tracing::debug!(
        images = dialog.session().images().len(),
        image_support = dialog.image_support_ready(),
        optimizer_loaded = dialog.optimizer_loaded(),
        "dialog loop finished"
    );
    dialog.finish(output_file)
}
