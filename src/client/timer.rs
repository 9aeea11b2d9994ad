use std::{future::Future, pin::Pin};

use tokio::time::{sleep_until, Instant, Sleep};

/// A one-shot timer that can be re-armed in place.
///
/// `T` is handed back when the timer fires. Re-arming replaces it, so only
/// the most recently armed value is ever observed.
#[derive(Debug)]
pub struct Timer<T> {
    sleep: Pin<Box<Sleep>>,
    armed: Option<T>,
}

impl<T> Timer<T> {
    /// Creates the timer on the current runtime, already armed.
    pub fn new(deadline: Instant, value: T) -> Self {
        Self {
            sleep: Box::pin(sleep_until(deadline)),
            armed: Some(value),
        }
    }

    pub fn rearm(&mut self, deadline: Instant, value: T) {
        self.cancel();
        self.sleep.as_mut().reset(deadline);
        self.armed = Some(value);
    }

    /// Disarms the timer, returning what it would have fired with.
    pub fn cancel(&mut self) -> Option<T> {
        self.armed.take()
    }

    /// Completes at the deadline with the armed value. Never completes
    /// while disarmed.
    pub async fn fired(&mut self) -> T {
        if self.armed.is_none() {
            return std::future::pending().await;
        }
        self.sleep.as_mut().await;
        match self.armed.take() {
            Some(value) => value,
            None => std::future::pending().await,
        }
    }
}

/// Waits on an optional timer; an absent timer never fires.
pub async fn fired<T>(timer: &mut Option<Timer<T>>) -> T {
    match timer {
        Some(timer) => timer.fired().await,
        None => std::future::pending().await,
    }
}

/// Runs `fut` unless the timer fires first, in which case the timer's value
/// is returned as the error.
pub async fn race<T, F>(timer: &mut Option<Timer<T>>, fut: F) -> Result<F::Output, T>
where
    F: Future,
{
    tokio::select! {
        output = fut => Ok(output),
        value = fired(timer) => Err(value),
    }
}
