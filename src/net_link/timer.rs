use std::future::pending;

use tokio::time::{Duration, Instant, sleep_until};

/// A one-shot timer that can be armed, re-armed and cancelled from inside a
/// `select!` loop without owning a task.
#[derive(Debug, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn arm(&mut self, after: Duration) {
        self.at = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.at = None;
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.at.is_some()
    }

    /// Resolves when the deadline passes, disarming it. Never resolves while
    /// unarmed.
    pub async fn fired(&mut self) {
        match self.at {
            Some(at) => {
                sleep_until(at).await;
                self.at = None;
            }
            None => pending::<()>().await,
        }
    }
}
