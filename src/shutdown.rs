use std::sync::Arc;
use tokio::sync::watch;

/// A handle used to shut down a stack and every task it spawned.
/// You can create multiple connected shutdowns by cloning.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// Tells every connected shutdown to stop.
    notify: Arc<watch::Sender<Option<ExitStatus>>>,
    /// Keeps track of the status so that `wait_for_shutdown` can be called
    /// any number of times, including after the shutdown happened.
    status: watch::Receiver<Option<ExitStatus>>,
}

impl Shutdown {
    /// Creates a new active shutdown.
    pub fn new() -> Self {
        let (notify, status) = watch::channel(None);
        Self {
            notify: Arc::new(notify),
            status,
        }
    }

    /// Sends `ExitStatus::Exited` to all `Shutdown`s cloned from this one.
    pub fn shut_down(&self) {
        self.shut_down_with_status(ExitStatus::Exited);
    }

    /// Sends `status` to all `Shutdown`s cloned from this one. Only the first
    /// status sent is kept.
    pub fn shut_down_with_status(&self, status: ExitStatus) {
        self.notify.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(status);
                true
            } else {
                false
            }
        });
    }

    /// Whether a shutdown has been requested.
    pub fn is_shut_down(&self) -> bool {
        self.status.borrow().is_some()
    }

    /// Waits to receive a shutdown status.
    pub async fn wait_for_shutdown(&mut self) -> ExitStatus {
        loop {
            if let Some(status) = *self.status.borrow_and_update() {
                return status;
            }
            if self.status.changed().await.is_err() {
                // Every sender is gone, and we hold one, so this cannot happen
                return ExitStatus::Exited;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ExitStatus {
    Status(u32),
    Exited,
    TimedOut,
}
