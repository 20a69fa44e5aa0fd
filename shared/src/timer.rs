//! Clock and cancellable timers.
//!
//! Cancellation is token based: a scheduled tick captures a
//! [`GenerationToken`] and its owner compares it against the live
//! [`Generation`] before acting. Aborting the task through [`TimerHandle`]
//! is only an optimisation; a tick that already woke up is still stopped by
//! the token check.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::model::UnixTimeMs;

pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenerationToken(u64);

/// Monotonic counter; every `advance` invalidates all tokens issued before it.
#[derive(Debug, Default)]
pub struct Generation(u64);

impl Generation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self) -> GenerationToken {
        self.0 = self.0.wrapping_add(1);
        GenerationToken(self.0)
    }

    pub fn current(&self) -> GenerationToken {
        GenerationToken(self.0)
    }

    pub fn is_current(&self, token: GenerationToken) -> bool {
        self.0 == token.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

/// Dropping the handle detaches the timer; call [`TimerHandle::abort`] to stop it.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Runs `f` once after `delay`.
pub fn once<F, Fut>(delay: Duration, f: F) -> TimerHandle
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    TimerHandle {
        task: tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f().await;
        }),
    }
}

/// Calls `f` every `interval`, `ticks` times, passing the number of ticks
/// still to come (so the last call sees `0`).
pub fn repeating<F, Fut>(interval: Duration, ticks: u32, mut f: F) -> TimerHandle
where
    F: FnMut(u32) -> Fut + Send + 'static,
    Fut: Future<Output = TickControl> + Send + 'static,
{
    TimerHandle {
        task: tokio::spawn(async move {
            for elapsed in 1..=ticks {
                tokio::time::sleep(interval).await;
                if f(ticks - elapsed).await == TickControl::Stop {
                    break;
                }
            }
        }),
    }
}
