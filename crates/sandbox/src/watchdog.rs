//! Timeout Guard - per-call deadline for one script turn
//!
//! Philosophy:
//! - The transition table is a pure function, tested without timers
//! - The timer re-arms itself on every expiry: one interrupt per period
//!
//! ```text
//!   Running ──TimerExpired──▶ Interrupting{1} ──TimerExpired──▶ Interrupting{n+1}
//!      │                           │
//!      └──ResultReady/ErrorReady──▶ Done ◀──ResultReady/ErrorReady
//! ```

use std::pin::Pin;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};

use crate::sandbox::{LoopHandle, TurnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecPhase {
    Running,
    Interrupting { attempts: u32 },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecEvent {
    TimerExpired,
    ResultReady,
    ErrorReady,
}

/// What the waiting caller must do after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    /// Keep waiting
    Wait,
    /// Send one interrupt request for the in-flight turn
    Interrupt,
    /// Stop waiting, the call is over
    Finish,
}

impl ExecPhase {
    pub fn next(self, event: ExecEvent) -> (ExecPhase, GuardAction) {
        match (self, event) {
            (ExecPhase::Done, _) => (ExecPhase::Done, GuardAction::Wait),
            (_, ExecEvent::ResultReady | ExecEvent::ErrorReady) => {
                (ExecPhase::Done, GuardAction::Finish)
            }
            (ExecPhase::Running, ExecEvent::TimerExpired) => (
                ExecPhase::Interrupting { attempts: 1 },
                GuardAction::Interrupt,
            ),
            (ExecPhase::Interrupting { attempts }, ExecEvent::TimerExpired) => (
                ExecPhase::Interrupting {
                    attempts: attempts.saturating_add(1),
                },
                GuardAction::Interrupt,
            ),
        }
    }
}

/// Deadline timer driving [`ExecPhase`]
pub struct TimeoutGuard {
    period: Duration,
    phase: ExecPhase,
    started: Instant,
    sleep: Pin<Box<Sleep>>,
}

impl TimeoutGuard {
    pub fn new(period: Duration) -> Self {
        let started = Instant::now();
        Self {
            period,
            phase: ExecPhase::Running,
            started,
            sleep: Box::pin(tokio::time::sleep_until(started + period)),
        }
    }

    pub fn phase(&self) -> ExecPhase {
        self.phase
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Apply an event, returns the action for the caller
    pub fn on_event(&mut self, event: ExecEvent) -> GuardAction {
        let (phase, action) = self.phase.next(event);
        if phase != self.phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "Exec phase change");
        }
        self.phase = phase;
        action
    }

    /// Resolves at the next deadline, then re-arms for one more period.
    ///
    /// Cancel-safe: dropping the future leaves the deadline in place.
    pub async fn expired(&mut self) {
        self.sleep.as_mut().await;
        let next = Instant::now() + self.period;
        self.sleep.as_mut().reset(next);
    }

    /// Wait for the outcome of `turn`, interrupting it once per elapsed period.
    ///
    /// Returns `None` if the worker dropped the turn without answering.
    pub async fn supervise<T, F>(
        handle: &LoopHandle,
        turn: TurnId,
        mut outcome: oneshot::Receiver<T>,
        period: Duration,
        classify: F,
    ) -> Option<T>
    where
        F: Fn(&T) -> ExecEvent,
    {
        let mut guard = TimeoutGuard::new(period);
        loop {
            tokio::select! {
                received = &mut outcome => {
                    return match received {
                        Ok(value) => {
                            guard.on_event(classify(&value));
                            Some(value)
                        }
                        Err(_) => {
                            guard.on_event(ExecEvent::ErrorReady);
                            None
                        }
                    };
                }
                _ = guard.expired() => {
                    if guard.on_event(ExecEvent::TimerExpired) == GuardAction::Interrupt {
                        tracing::warn!(
                            turn,
                            elapsed = ?guard.elapsed(),
                            phase = ?guard.phase(),
                            "Script turn overran, interrupting"
                        );
                        handle.request_interrupt(turn);
                    }
                }
            }
        }
    }
}
