//! Poll timers driven by the coordinator loop.
//!
//! A timer never queues work: if it fires while a cluster manager call is
//! in flight, it parks and is rescheduled once the call completes.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct PollTimer {
    name: &'static str,
    period: Option<Duration>,
    deadline: Option<Instant>,
    parked: bool,
}

impl PollTimer {
    /// `period == None` disables the timer.
    pub fn new(name: &'static str, period: Option<Duration>) -> Self {
        Self {
            name,
            period,
            deadline: None,
            parked: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_scheduled(&self) -> bool {
        self.deadline.is_some()
    }

    /// Schedule one period from now, unless already scheduled or parked.
    pub fn schedule(&mut self) {
        if self.deadline.is_some() || self.parked {
            return;
        }
        if let Some(period) = self.period {
            self.deadline = Some(Instant::now() + period);
        }
    }

    /// Consume a fired deadline.
    pub fn fire(&mut self) {
        self.deadline = None;
    }

    pub fn park(&mut self) {
        self.deadline = None;
        self.parked = true;
    }

    /// Called when no cluster manager call is in flight any more.
    pub fn resume(&mut self) {
        if self.parked {
            self.parked = false;
            self.schedule();
        }
    }

    pub fn stop(&mut self) {
        self.deadline = None;
        self.parked = false;
    }
}

/// Sleep until `deadline`, or forever without one.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn parked_timer_reschedules_on_resume() {
        let mut timer = PollTimer::new("job", Some(Duration::from_secs(15)));
        timer.schedule();
        let first = timer.deadline().unwrap();
        timer.schedule();
        assert_eq!(timer.deadline(), Some(first));

        timer.fire();
        timer.park();
        timer.schedule();
        assert!(!timer.is_scheduled());

        timer.resume();
        assert!(timer.is_scheduled());
    }

    #[test]
    fn disabled_timer_never_schedules() {
        let mut timer = PollTimer::new("health", None);
        timer.schedule();
        timer.resume();
        assert!(!timer.is_scheduled());
    }
}
