use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;

/// How long teardown waits for outstanding tasks before leaving them behind.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

struct RunningTask {
    name: String,
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub joined: Vec<String>,
    pub detached: Vec<String>,
}

/// Worker threads that report back through one channel.
///
/// Each task delivers at most one message, and nothing once it has been
/// cancelled. The owning thread drains the channel, so task code never touches
/// state owned by that thread.
pub struct BackgroundTasks<M: Send + 'static> {
    sender: mpsc::Sender<M>,
    receiver: mpsc::Receiver<M>,
    running: Vec<RunningTask>,
}

impl<M: Send + 'static> Default for BackgroundTasks<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Send + 'static> BackgroundTasks<M> {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver,
            running: Vec::new(),
        }
    }

    /// Extra producer handle for sources that are not tasks (e.g. an input reader).
    pub fn sender(&self) -> mpsc::Sender<M> {
        self.sender.clone()
    }

    pub fn spawn<F>(&mut self, name: &str, job: F) -> anyhow::Result<CancelToken>
    where
        F: FnOnce(&CancelToken) -> Option<M> + Send + 'static,
    {
        self.prune_finished();
        let cancel = CancelToken::default();
        let token = cancel.clone();
        let sender = self.sender.clone();
        let handle = thread::Builder::new()
            .name(format!("calldk-{name}"))
            .spawn(move || {
                let message = job(&token);
                if token.is_cancelled() {
                    return;
                }
                if let Some(message) = message {
                    let _ = sender.send(message);
                }
            })
            .with_context(|| format!("failed to spawn background task {name}"))?;
        tracing::debug!(task = name, "background task started");
        self.running.push(RunningTask {
            name: name.to_string(),
            cancel: cancel.clone(),
            handle,
        });
        Ok(cancel)
    }

    pub fn recv(&self) -> Option<M> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<M> {
        self.receiver.try_recv().ok()
    }

    pub fn pending(&mut self) -> usize {
        self.prune_finished();
        self.running.len()
    }

    pub fn pending_names(&mut self) -> Vec<String> {
        self.prune_finished();
        self.running.iter().map(|task| task.name.clone()).collect()
    }

    /// Cancels everything and waits up to `grace` for tasks to wind down.
    /// Tasks still running afterwards are detached, never joined.
    pub fn shutdown(&mut self, grace: Duration) -> ShutdownReport {
        for task in &self.running {
            task.cancel.cancel();
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && self.running.iter().any(|task| !task.handle.is_finished())
        {
            thread::sleep(SHUTDOWN_POLL);
        }

        let mut report = ShutdownReport::default();
        for task in self.running.drain(..) {
            if task.handle.is_finished() {
                let _ = task.handle.join();
                report.joined.push(task.name);
            } else {
                tracing::warn!(task = %task.name, "background task did not stop in time; detaching");
                report.detached.push(task.name);
            }
        }
        report
    }

    fn prune_finished(&mut self) {
        let mut index = 0;
        while index < self.running.len() {
            if self.running[index].handle.is_finished() {
                let task = self.running.swap_remove(index);
                let _ = task.handle.join();
            } else {
                index += 1;
            }
        }
    }
}
