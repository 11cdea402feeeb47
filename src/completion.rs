use std::sync::OnceLock;

use tokio::sync::Notify;
use tracing::error;

/// The outcome slot of an asynchronous operation. It can be completed exactly once, and any
///  number of tasks can wait for the outcome.
pub struct Completion<T> {
    outcome: OnceLock<T>,
    notify: Notify,
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Completion<T> {
        Completion {
            outcome: OnceLock::new(),
            notify: Notify::new(),
        }
    }

    /// Returns `false` without changing anything if the completion was already completed
    pub fn try_complete(&self, outcome: T) -> bool {
        if self.outcome.set(outcome).is_err() {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    /// Completing twice is a bug in the calling code, and it is treated as fatal
    pub fn complete(&self, outcome: T, what: &str) {
        if !self.try_complete(outcome) {
            error!("{} was completed twice", what);
            panic!("this is a bug: {} was completed twice", what);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.outcome.get().is_some()
    }

    pub fn get(&self) -> Option<T> {
        self.outcome.get().cloned()
    }

    pub async fn wait(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so that a completion between the check and the await
            //  is not missed
            notified.as_mut().enable();

            if let Some(outcome) = self.outcome.get() {
                return outcome.clone();
            }
            notified.await;
        }
    }
}
