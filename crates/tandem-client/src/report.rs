//! Connection status shown to the user.

use std::time::{Duration, Instant};

/// What the status line currently says.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Ok,
    Delayed(String),
    Failed(String),
}

/// Tracks the user-visible connection status.
///
/// A failure stays visible for a while even when a later request succeeds,
/// so it can actually be read.
#[derive(Clone, Debug)]
pub struct Reporter {
    status: Status,
    set_at: Option<Instant>,
    failure_sticky: Duration,
}

impl Reporter {
    pub fn new(failure_sticky: Duration) -> Self {
        Self {
            status: Status::Ok,
            set_at: None,
            failure_sticky,
        }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn failure(&mut self, message: impl Into<String>) {
        self.failure_at(message, Instant::now());
    }

    pub fn failure_at(&mut self, message: impl Into<String>, now: Instant) {
        self.status = Status::Failed(message.into());
        self.set_at = Some(now);
    }

    /// Show a delay. Ignored while a failure is shown.
    pub fn delay(&mut self, message: impl Into<String>) {
        self.delay_at(message, Instant::now());
    }

    pub fn delay_at(&mut self, message: impl Into<String>, now: Instant) {
        if matches!(self.status, Status::Failed(_)) {
            return;
        }
        self.status = Status::Delayed(message.into());
        self.set_at = Some(now);
    }

    pub fn success(&mut self) {
        self.success_at(Instant::now());
    }

    pub fn success_at(&mut self, now: Instant) {
        if let (Status::Failed(_), Some(at)) = (&self.status, self.set_at) {
            if now.saturating_duration_since(at) < self.failure_sticky {
                return;
            }
        }
        self.status = Status::Ok;
        self.set_at = None;
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
