//! Script Sandbox - one engine pinned to one worker thread
//!
//! Design decisions:
//! 1. The QuickJS runtime never leaves its thread; everything else talks to it
//!    through a FIFO queue of jobs (`RunOnLoop`).
//! 2. A job runs to completion. Promise jobs it queued are drained right after.
//! 3. Interrupts are addressed to a turn id, so a late interrupt can never
//!    abort the turn that follows the one it was meant for.

use rquickjs::{Context, Ctx, Runtime};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

use crate::error::SandboxError;

/// Monotonic id of one scheduled job
pub type TurnId = u64;

/// Runs on the worker once a turn's promise jobs have drained
pub type Settle = Box<dyn FnOnce() + Send>;

/// Work item executed on the worker
pub type Job = Box<dyn for<'js> FnOnce(Ctx<'js>) -> Option<Settle> + Send>;

/// Promise jobs drained after each turn before the next message is taken
const MAX_PENDING_JOBS: usize = 10_000;

enum Message {
    Run { turn: TurnId, job: Job },
    Shutdown,
}

/// Engine limits applied when the runtime is created
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineLimits {
    pub memory_limit: Option<usize>,
    pub max_stack_size: Option<usize>,
}

#[derive(Default)]
struct LoopState {
    next_turn: AtomicU64,
    /// Turn being evaluated, 0 when idle
    current: AtomicU64,
    /// Turn an interrupt was requested for, 0 when none
    interrupt_target: AtomicU64,
    /// Set by the interrupt handler once it aborted the current turn
    interrupted: AtomicBool,
    stopping: AtomicBool,
}

/// Cheap, cloneable handle for scheduling work on the worker
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<Message>,
    state: Arc<LoopState>,
}

impl LoopHandle {
    /// Schedule `job` after everything queued so far. Never blocks.
    pub fn run_on_loop<F>(&self, job: F) -> Result<TurnId, SandboxError>
    where
        F: for<'js> FnOnce(Ctx<'js>) + Send + 'static,
    {
        let job: Job = Box::new(move |ctx: Ctx<'_>| -> Option<Settle> {
            job(ctx);
            None
        });
        self.schedule(job)
    }

    /// Like `run_on_loop`, but the job's value is delivered only after the
    /// promise jobs it queued have run. A deadline on the receiver covers them.
    pub fn run_settled<F, T>(&self, job: F) -> Result<(TurnId, oneshot::Receiver<T>), SandboxError>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |ctx: Ctx<'_>| -> Option<Settle> {
            let value = job(ctx);
            let settle: Settle = Box::new(move || {
                let _ = tx.send(value);
            });
            Some(settle)
        });
        Ok((self.schedule(job)?, rx))
    }

    fn schedule(&self, job: Job) -> Result<TurnId, SandboxError> {
        if self.state.stopping.load(Ordering::SeqCst) {
            return Err(SandboxError::WorkerStopped);
        }
        let turn = self.state.next_turn.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx
            .send(Message::Run { turn, job })
            .map_err(|_| SandboxError::WorkerStopped)?;
        Ok(turn)
    }

    /// Ask the worker to abort `turn` if it is (or becomes) the running turn
    pub fn request_interrupt(&self, turn: TurnId) {
        self.state.interrupt_target.store(turn, Ordering::SeqCst);
    }

    /// True once the running turn was aborted by an interrupt.
    ///
    /// Only meaningful when called from inside a job.
    pub fn was_interrupted(&self) -> bool {
        self.state.interrupted.load(Ordering::SeqCst)
    }

    /// Turn currently being evaluated, if any
    pub fn current_turn(&self) -> Option<TurnId> {
        match self.state.current.load(Ordering::SeqCst) {
            0 => None,
            turn => Some(turn),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.state.stopping.load(Ordering::SeqCst)
    }
}

/// Owns the worker thread
pub struct ScriptSandbox {
    limits: EngineLimits,
    handle: Option<LoopHandle>,
    worker: Option<JoinHandle<()>>,
}

impl ScriptSandbox {
    pub fn new(limits: EngineLimits) -> Self {
        Self {
            limits,
            handle: None,
            worker: None,
        }
    }

    /// Spin up the worker; returns once it accepts work
    pub async fn start(&mut self) -> Result<LoopHandle, SandboxError> {
        if self.handle.is_some() {
            return Err(SandboxError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(LoopState::default());
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker_state = Arc::clone(&state);
        let limits = self.limits;
        let worker = std::thread::Builder::new()
            .name("sandbox-worker".to_string())
            .spawn(move || worker_main(rx, worker_state, limits, ready_tx))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = worker.join();
                return Err(err);
            }
            Err(_) => return Err(SandboxError::WorkerStopped),
        }

        let handle = LoopHandle { tx, state };
        self.handle = Some(handle.clone());
        self.worker = Some(worker);
        tracing::debug!("Sandbox worker started");
        Ok(handle)
    }

    pub fn handle(&self) -> Result<&LoopHandle, SandboxError> {
        self.handle.as_ref().ok_or(SandboxError::NotStarted)
    }

    pub fn run_on_loop<F>(&self, job: F) -> Result<TurnId, SandboxError>
    where
        F: for<'js> FnOnce(Ctx<'js>) + Send + 'static,
    {
        self.handle()?.run_on_loop(job)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Abort the running turn, drain the queue and join the worker.
    ///
    /// Safe to call repeatedly or before `start`.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        handle.state.stopping.store(true, Ordering::SeqCst);
        let _ = handle.tx.send(Message::Shutdown);

        if let Some(worker) = self.worker.take() {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => tracing::debug!("Sandbox worker joined"),
                Ok(Err(_)) => tracing::warn!("Sandbox worker panicked"),
                Err(err) => tracing::warn!("Failed to join sandbox worker: {}", err),
            }
        }
    }
}

impl Drop for ScriptSandbox {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.state.stopping.store(true, Ordering::SeqCst);
            let _ = handle.tx.send(Message::Shutdown);
        }
    }
}

fn create_engine(limits: EngineLimits, state: &Arc<LoopState>) -> Result<(Runtime, Context), SandboxError> {
    let runtime = Runtime::new()?;
    if let Some(limit) = limits.memory_limit {
        runtime.set_memory_limit(limit);
    }
    if let Some(size) = limits.max_stack_size {
        runtime.set_max_stack_size(size);
    }

    let handler_state = Arc::clone(state);
    runtime.set_interrupt_handler(Some(Box::new(move || {
        let current = handler_state.current.load(Ordering::SeqCst);
        let target = handler_state.interrupt_target.load(Ordering::SeqCst);
        let abort = current != 0
            && (target == current || handler_state.stopping.load(Ordering::SeqCst));
        if abort {
            handler_state.interrupted.store(true, Ordering::SeqCst);
        }
        abort
    })));

    let context = Context::full(&runtime)?;
    Ok((runtime, context))
}

fn worker_main(
    mut rx: mpsc::UnboundedReceiver<Message>,
    state: Arc<LoopState>,
    limits: EngineLimits,
    ready: oneshot::Sender<Result<(), SandboxError>>,
) {
    let (runtime, context) = match create_engine(limits, &state) {
        Ok(engine) => {
            let _ = ready.send(Ok(()));
            engine
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    while let Some(message) = rx.blocking_recv() {
        let (turn, job) = match message {
            Message::Run { turn, job } => (turn, job),
            Message::Shutdown => break,
        };

        state.interrupted.store(false, Ordering::SeqCst);
        state.current.store(turn, Ordering::SeqCst);

        let settle = context.with(|ctx| match catch_unwind(AssertUnwindSafe(|| job(ctx))) {
            Ok(settle) => settle,
            Err(_) => {
                tracing::error!(turn, "Sandbox job panicked");
                None
            }
        });
        // Still the current turn, so an interrupt aimed at it reaches these jobs
        drain_pending_jobs(&runtime, &state, turn);
        if let Some(settle) = settle {
            settle();
        }

        state.current.store(0, Ordering::SeqCst);
        let _ = state.interrupt_target.compare_exchange(
            turn,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    tracing::debug!("Sandbox worker exiting");
}

fn drain_pending_jobs(runtime: &Runtime, state: &LoopState, turn: TurnId) {
    let mut executed = 0;
    let mut reported_interrupt = false;
    while runtime.is_job_pending() && executed < MAX_PENDING_JOBS {
        match runtime.execute_pending_job() {
            Ok(true) => executed += 1,
            Ok(false) => break,
            Err(_) if state.interrupted.load(Ordering::SeqCst) => {
                if !reported_interrupt {
                    tracing::warn!(turn, "Promise job interrupted");
                    reported_interrupt = true;
                }
                executed += 1;
            }
            Err(_) => {
                tracing::warn!(turn, "Promise job threw");
                executed += 1;
            }
        }
    }
    if executed >= MAX_PENDING_JOBS {
        tracing::warn!(turn, "Promise job limit reached, leaving jobs queued");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::prelude::Coerced;

    async fn eval(handle: &LoopHandle, source: &'static str) -> String {
        let (tx, rx) = oneshot::channel();
        handle
            .run_on_loop(move |ctx| {
                let value = ctx
                    .eval::<Coerced<String>, _>(source)
                    .map(|v| v.0)
                    .unwrap_or_else(|_| "error".to_string());
                let _ = tx.send(value);
            })
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_jobs_share_globals_in_order() {
        let mut sandbox = ScriptSandbox::new(EngineLimits::default());
        let handle = sandbox.start().await.unwrap();

        assert_eq!(eval(&handle, "var state = 'empty'; state").await, "empty");
        assert_eq!(eval(&handle, "state + '!'").await, "empty!");

        sandbox.stop().await;
        assert!(!sandbox.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut sandbox = ScriptSandbox::new(EngineLimits::default());
        sandbox.stop().await;
        sandbox.start().await.unwrap();
        sandbox.stop().await;
        sandbox.stop().await;
        assert!(matches!(
            sandbox.run_on_loop(|_| {}),
            Err(SandboxError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_interrupt_targets_running_turn() {
        let mut sandbox = ScriptSandbox::new(EngineLimits::default());
        let handle = sandbox.start().await.unwrap();

        let (tx, rx) = oneshot::channel();
        let job_handle = handle.clone();
        let turn = handle
            .run_on_loop(move |ctx| {
                let result = ctx.eval::<(), _>("for (;;) {}");
                let _ = ctx.catch();
                let _ = tx.send((result.is_err(), job_handle.was_interrupted()));
            })
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.request_interrupt(turn);
        assert_eq!(rx.await.unwrap(), (true, true));

        // The next turn is unaffected
        assert_eq!(eval(&handle, "1 + 1").await, "2");
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_settled_value_waits_for_promise_jobs() {
        let mut sandbox = ScriptSandbox::new(EngineLimits::default());
        let handle = sandbox.start().await.unwrap();

        let (_, rx) = handle
            .run_settled(|ctx| {
                ctx.eval::<Coerced<String>, _>(
                    "var order = []; Promise.resolve().then(function () { order.push('job'); }); order.push('script'); 'done'",
                )
                .map(|v| v.0)
                .unwrap_or_default()
            })
            .unwrap();
        assert_eq!(rx.await.unwrap(), "done");
        assert_eq!(eval(&handle, "order.join(',')").await, "script,job");
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_runaway_promise_job_stays_interruptible() {
        let mut sandbox = ScriptSandbox::new(EngineLimits::default());
        let handle = sandbox.start().await.unwrap();

        let (turn, mut rx) = handle
            .run_settled(|ctx| {
                let _ = ctx.eval::<(), _>("Promise.resolve().then(function () { for (;;) {} })");
            })
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(handle.current_turn(), Some(turn));

        handle.request_interrupt(turn);
        rx.await.unwrap();
        assert_eq!(eval(&handle, "1 + 1").await, "2");
        sandbox.stop().await;
    }
}
