use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Last-input clock for a terminal session.
///
/// Operator input touches the clock; the session's idle watcher waits on it
/// and tears the shell down once nobody has typed for the idle window. Shell
/// output deliberately does not count as activity, so a runaway process
/// cannot keep an abandoned session alive.
#[derive(Clone)]
pub struct IdleClock {
    tx: Arc<watch::Sender<Instant>>,
}

impl Default for IdleClock {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleClock {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Instant::now());
        Self { tx: Arc::new(tx) }
    }

    /// Record activity. Safe to call while holding a sync lock.
    pub fn touch(&self) {
        self.tx.send_replace(Instant::now());
    }

    /// Restart the clock when a new session begins.
    pub fn reset(&self) {
        self.tx.send_replace(Instant::now());
    }

    /// Time since the last touch or reset.
    pub fn idle_for(&self) -> Duration {
        self.tx.borrow().elapsed()
    }

    /// Resolve once `window` has elapsed with no touch.
    ///
    /// Each touch pushes the deadline out again. Returns immediately if the
    /// clock is already idle for longer than `window`.
    pub async fn wait_for_idle(&self, window: Duration) {
        let mut rx = self.tx.subscribe();
        loop {
            let elapsed = rx.borrow_and_update().elapsed();
            if elapsed >= window {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(window - elapsed) => {
                    if rx.borrow_and_update().elapsed() >= window {
                        return;
                    }
                }
                res = rx.changed() => {
                    // All senders gone means nobody can touch us any more.
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn touch_resets_elapsed() {
        let clock = IdleClock::new();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(clock.idle_for() >= Duration::from_millis(25));
        clock.touch();
        assert!(clock.idle_for() < Duration::from_millis(25));
    }

    #[tokio::test]
    async fn reset_restarts_the_window() {
        let clock = IdleClock::new();
        tokio::time::sleep(Duration::from_millis(30)).await;
        clock.reset();
        assert!(clock.idle_for() < Duration::from_millis(25));
    }

    #[tokio::test]
    async fn idle_resolves_after_window() {
        let clock = IdleClock::new();
        let start = Instant::now();
        clock.wait_for_idle(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn touch_extends_deadline() {
        let clock = IdleClock::new();
        let c = clock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.touch();
        });

        let start = Instant::now();
        clock.wait_for_idle(Duration::from_millis(150)).await;
        // 20ms until the touch, then a full window of silence.
        assert!(start.elapsed() >= Duration::from_millis(165), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn already_idle_returns_immediately() {
        let clock = IdleClock::new();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let start = Instant::now();
        clock.wait_for_idle(Duration::from_millis(50)).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }
}
