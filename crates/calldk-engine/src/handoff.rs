use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::bail;
use calldk_contracts::envelope::ResultEnvelope;
use calldk_contracts::events::{HandoffEvent, HandoffJournal, HandoffLog};
use calldk_contracts::launch::LaunchSpec;
use tempfile::TempPath;
use thiserror::Error;
use uuid::Uuid;
use wait_timeout::ChildExt;

use crate::background::CancelToken;

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// How the dialog process ended when it did not end cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Code(i32),
    /// Terminated without an exit code (killed by a signal).
    Signal,
    TimedOut(Duration),
    /// Killed because the caller cancelled the handoff.
    Cancelled,
    WaitFailed(String),
}

impl ExitOutcome {
    fn from_status(status: ExitStatus) -> Self {
        status.code().map(Self::Code).unwrap_or(Self::Signal)
    }

    fn is_success(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal => f.write_str("terminated by signal"),
            Self::TimedOut(limit) => write!(f, "timed out after {}s", limit.as_secs_f64()),
            Self::Cancelled => f.write_str("cancelled"),
            Self::WaitFailed(reason) => write!(f, "wait failed: {reason}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("cannot prepare a handoff file in {}: {source}", dir.display())]
    Setup {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start dialog program {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("dialog process failed ({outcome})")]
    LaunchFailed { outcome: ExitOutcome },

    #[error("dialog exited cleanly but left no usable result at {}: {reason}", path.display())]
    MalformedResult { path: PathBuf, reason: String },
}

/// Program (plus leading arguments) that hosts the dialog frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogCommand {
    program: OsString,
    args: Vec<OsString>,
}

impl DialogCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Parses a shell-style command line such as `python3 -u dialog.py`.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut words = shell_words::split(raw)?.into_iter();
        let Some(program) = words.next() else {
            bail!("dialog command is empty");
        };
        Ok(Self::new(program).with_args(words))
    }

    /// The running executable's own `dialog` subcommand.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(env::current_exe()?).with_args(["dialog"]))
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    fn display_program(&self) -> String {
        self.program.to_string_lossy().to_string()
    }
}

/// Launches the dialog as a child process and recovers its result file.
///
/// One attempt per call; no retries. The wait blocks the calling thread, so
/// servers should call [`DialogLauncher::launch`] from a dedicated worker.
#[derive(Debug, Clone)]
pub struct DialogLauncher {
    command: DialogCommand,
    temp_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    journal: Option<HandoffJournal>,
}

impl DialogLauncher {
    pub fn new(command: DialogCommand) -> Self {
        Self {
            command,
            temp_dir: None,
            timeout: None,
            journal: None,
        }
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_journal(mut self, journal: Option<HandoffJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn command(&self) -> &DialogCommand {
        &self.command
    }

    pub fn launch(
        &self,
        project_directory: &str,
        prompt: &str,
    ) -> Result<ResultEnvelope, HandoffError> {
        self.launch_cancellable(project_directory, prompt, &CancelToken::default())
    }

    /// Like [`launch`](DialogLauncher::launch), but cancelling `cancel` kills
    /// the dialog and fails the handoff with [`ExitOutcome::Cancelled`]. The
    /// output file is removed either way.
    pub fn launch_cancellable(
        &self,
        project_directory: &str,
        prompt: &str,
        cancel: &CancelToken,
    ) -> Result<ResultEnvelope, HandoffError> {
        let handoff_id = Uuid::new_v4().to_string();
        let log = self.journal.as_ref().map(|journal| journal.handoff(&handoff_id));
        let result = self.launch_inner(&handoff_id, log.as_ref(), project_directory, prompt, cancel);
        if let Err(err) = &result {
            tracing::warn!(handoff = %handoff_id, error = %err, "dialog handoff failed");
            record(log.as_ref(), HandoffEvent::HandoffFailed {
                error: err.to_string(),
            });
        }
        result
    }

    fn launch_inner(
        &self,
        handoff_id: &str,
        log: Option<&HandoffLog>,
        project_directory: &str,
        prompt: &str,
        cancel: &CancelToken,
    ) -> Result<ResultEnvelope, HandoffError> {
        // Dropping the guard deletes the file, whichever way this returns.
        let output = self.create_output_file()?;
        let spec = LaunchSpec::new(project_directory, prompt, output.to_path_buf());
        if cancel.is_cancelled() {
            return Err(HandoffError::LaunchFailed {
                outcome: ExitOutcome::Cancelled,
            });
        }

        let mut child = self.spawn(&spec)?;
        tracing::info!(
            handoff = %handoff_id,
            pid = child.id(),
            program = %self.command.display_program(),
            "dialog launched"
        );
        record(log, HandoffEvent::HandoffLaunched {
            pid: child.id(),
            program: self.command.display_program(),
            output_path: spec.output_path().display().to_string(),
        });

        let outcome = self.wait_for_exit(&mut child, cancel);
        tracing::debug!(handoff = %handoff_id, outcome = %outcome, "dialog exited");
        record(log, HandoffEvent::HandoffExited {
            outcome: outcome.to_string(),
        });
        if !outcome.is_success() {
            return Err(HandoffError::LaunchFailed { outcome });
        }

        let envelope = read_result(spec.output_path())?;
        if let Err(err) = output.close() {
            tracing::warn!(error = %err, "failed to remove handoff file");
        }
        tracing::info!(
            handoff = %handoff_id,
            chars = envelope.text.chars().count(),
            images = envelope.images.len(),
            "dialog result received"
        );
        record(log, HandoffEvent::HandoffCompleted {
            text_chars: envelope.text.chars().count(),
            images: envelope.images.len(),
        });
        Ok(envelope)
    }

    fn create_output_file(&self) -> Result<TempPath, HandoffError> {
        let dir = self.temp_dir.clone().unwrap_or_else(env::temp_dir);
        tempfile::Builder::new()
            .prefix("calldk-")
            .suffix(".json")
            .tempfile_in(&dir)
            .map(|file| file.into_temp_path())
            .map_err(|source| HandoffError::Setup { dir, source })
    }

    fn spawn(&self, spec: &LaunchSpec) -> Result<Child, HandoffError> {
        // The parent may be speaking a protocol over its own stdio; the child
        // gets none of it.
        Command::new(&self.command.program)
            .args(&self.command.args)
            .args(spec.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| HandoffError::Spawn {
                program: self.command.display_program(),
                source,
            })
    }

    // Polls in short slices so cancellation is noticed while the operator
    // is still in the dialog.
    fn wait_for_exit(&self, child: &mut Child, cancel: &CancelToken) -> ExitOutcome {
        let deadline = self.timeout.map(|limit| (Instant::now() + limit, limit));
        loop {
            let slice = match deadline {
                Some((at, _)) => at.saturating_duration_since(Instant::now()).min(CANCEL_POLL),
                None => CANCEL_POLL,
            };
            match child.wait_timeout(slice) {
                Ok(Some(status)) => return ExitOutcome::from_status(status),
                Ok(None) => {}
                Err(err) => {
                    stop_child(child);
                    return ExitOutcome::WaitFailed(err.to_string());
                }
            }
            if cancel.is_cancelled() {
                stop_child(child);
                return ExitOutcome::Cancelled;
            }
            if let Some((at, limit)) = deadline {
                if Instant::now() >= at {
                    stop_child(child);
                    return ExitOutcome::TimedOut(limit);
                }
            }
        }
    }
}

fn stop_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn record(log: Option<&HandoffLog>, event: HandoffEvent) {
    let Some(log) = log else {
        return;
    };
    if let Err(err) = log.record(&event) {
        tracing::warn!(
            path = %log.journal().path().display(),
            event = event.kind(),
            error = %err,
            "handoff journal write failed"
        );
    }
}

fn read_result(path: &Path) -> Result<ResultEnvelope, HandoffError> {
    let malformed = |reason: String| HandoffError::MalformedResult {
        path: path.to_path_buf(),
        reason,
    };
    let raw = fs::read_to_string(path).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            malformed("output file is missing".to_string())
        } else {
            malformed(err.to_string())
        }
    })?;
    if raw.trim().is_empty() {
        return Err(malformed("output file is empty".to_string()));
    }
    ResultEnvelope::from_json(&raw).map_err(|err| malformed(format!("{err:#}")))
}
