//! Typing cadence detection.
//!
//! Every user edit restarts a fixed idle window; the user counts as typing
//! until that window passes without another edit.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TypingDetector {
    idle_after: Duration,
    last_edit: Option<Instant>,
    typing: bool,
}

impl TypingDetector {
    pub fn new(idle_after: Duration) -> Self {
        Self {
            idle_after,
            last_edit: None,
            typing: false,
        }
    }

    pub fn note_edit(&mut self, now: Instant) {
        if !self.typing {
            tracing::trace!("typing started");
        }
        self.last_edit = Some(now);
        self.typing = true;
    }

    pub fn is_typing(&self, now: Instant) -> bool {
        self.typing && self.deadline().is_some_and(|deadline| now < deadline)
    }

    /// When the current idle window closes, if the user is typing.
    pub fn deadline(&self) -> Option<Instant> {
        if !self.typing {
            return None;
        }
        self.last_edit.map(|at| at + self.idle_after)
    }

    /// Returns `true` exactly once when the idle window closes.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.typing = false;
                tracing::trace!("typing stopped");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_millis(800);

    #[test]
    fn idle_until_first_edit() {
        let detector = TypingDetector::new(IDLE);
        assert!(!detector.is_typing(Instant::now()));
        assert_eq!(detector.deadline(), None);
    }

    #[test]
    fn continuous_typing_stays_active_then_settles() {
        let start = Instant::now();
        let mut detector = TypingDetector::new(IDLE);

        // One keystroke every 100ms for two seconds.
        for step in 0..=20u64 {
            let now = start + Duration::from_millis(step * 100);
            detector.note_edit(now);
            assert!(detector.is_typing(now));
            assert!(!detector.poll(now));
        }

        let last = start + Duration::from_millis(2_000);
        assert!(detector.is_typing(last + Duration::from_millis(799)));
        assert!(!detector.poll(last + Duration::from_millis(799)));
        assert!(!detector.is_typing(last + IDLE));
        assert!(detector.poll(last + IDLE));
        assert!(!detector.poll(last + IDLE + Duration::from_millis(10)));
    }

    #[test]
    fn each_edit_restarts_the_window() {
        let start = Instant::now();
        let mut detector = TypingDetector::new(IDLE);
        detector.note_edit(start);
        detector.note_edit(start + Duration::from_millis(700));
        assert!(detector.is_typing(start + Duration::from_millis(1_400)));
        assert_eq!(detector.deadline(), Some(start + Duration::from_millis(1_500)));
    }
}
