// =============================================================================
// Interrupt signal
// =============================================================================
//
// A `watch` flag flipped by the Ctrl+C listener. The controller checks it
// between exchange calls and while sleeping; a call already in flight is
// never aborted.
// =============================================================================

use tokio::sync::watch;
use tokio::time::{sleep_until, Duration, Instant};

/// Sending half, held by whoever delivers the interrupt.
pub type InterruptTrigger = watch::Sender<bool>;

/// What an operator interrupt asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// First press: unwind the position gracefully.
    Unwind,
    /// Pressed again while unwinding: stop right away.
    Abort,
}

/// Record one interrupt on `trigger`. The first sets the flag; any later one
/// escalates to an abort.
pub fn escalate(trigger: &InterruptTrigger) -> Escalation {
    if trigger.send_replace(true) {
        Escalation::Abort
    } else {
        Escalation::Unwind
    }
}

#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: watch::Receiver<bool>,
}

impl Interrupt {
    pub fn channel() -> (InterruptTrigger, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration` unless interrupted first. Returns whether the
    /// interrupt is set.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let deadline = Instant::now() + duration;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return self.is_set(),
                changed = self.rx.changed() => match changed {
                    Ok(()) if self.is_set() => return true,
                    Ok(()) => continue,
                    Err(_) => {
                        // Trigger dropped: nobody can interrupt any more.
                        sleep_until(deadline).await;
                        return false;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn full_sleep_without_interrupt() {
        let (_tx, mut interrupt) = Interrupt::channel();
        let started = Instant::now();
        assert!(!interrupt.sleep(Duration::from_secs(30)).await);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_cuts_sleep_short() {
        let (tx, mut interrupt) = Interrupt::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let _ = tx.send(true);
        });
        let started = Instant::now();
        assert!(interrupt.sleep(Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn second_interrupt_escalates_to_abort() {
        let (tx, interrupt) = Interrupt::channel();
        assert_eq!(escalate(&tx), Escalation::Unwind);
        assert!(interrupt.is_set());
        assert_eq!(escalate(&tx), Escalation::Abort);
        assert_eq!(escalate(&tx), Escalation::Abort);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trigger_still_sleeps_full_duration() {
        let (tx, mut interrupt) = Interrupt::channel();
        drop(tx);
        let started = Instant::now();
        assert!(!interrupt.sleep(Duration::from_secs(10)).await);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }
}
