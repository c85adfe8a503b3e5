//! Operation deadlines.

use std::time::Duration;

use tokio::time::Instant;

/// Point in time after which a blocking operation must give up.
///
/// An unreachable deadline never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// Deadline that expires `duration` from now.
    #[must_use]
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(duration),
        }
    }

    /// Deadline at the given instant.
    #[must_use]
    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    /// Deadline that never expires.
    #[must_use]
    pub fn unreachable() -> Self {
        Self { at: None }
    }

    /// Whether the deadline has already passed.
    #[must_use]
    pub fn is_reached(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time remaining until the deadline, `None` if it never expires.
    #[must_use]
    pub fn time_left(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// The expiry instant, if any.
    #[must_use]
    pub fn instant(&self) -> Option<Instant> {
        self.at
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::unreachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let deadline = Deadline::from_duration(Duration::from_millis(100));
        assert!(!deadline.is_reached());
        assert_eq!(deadline.time_left(), Some(Duration::from_millis(100)));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(deadline.is_reached());
        assert_eq!(deadline.time_left(), Some(Duration::ZERO));
    }

    #[test]
    fn test_unreachable_deadline() {
        let deadline = Deadline::unreachable();
        assert!(!deadline.is_reached());
        assert!(deadline.time_left().is_none());
        assert_eq!(deadline, Deadline::default());
    }
}
