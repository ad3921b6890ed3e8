//! Script Sandbox - run untrusted page scripts against a synthetic DOM
//!
//! Page scripts run in an embedded QuickJS engine pinned to one worker
//! thread. The host observes what they change and gets the page back as
//! serialized HTML, without a slow or hostile script ever blocking it.
//!
//! # Architecture
//!
//! 1. **One thread owns the engine**: everything else schedules jobs onto it
//!    (`RunOnLoop`), so two script turns never overlap.
//! 2. **Every turn has a deadline**: the timeout guard interrupts overruns,
//!    and the engine is still usable afterwards.
//! 3. **Host I/O stays off the worker**: XHR and timers run as tokio tasks
//!    and re-enter through the same queue.
//! 4. **Mutations are a signal, not a log**: a lossy bounded channel says
//!    "something changed", the tracker re-serializes once things go quiet.
//!
//! ```text
//!  control socket ─▶ Dispatcher ─▶ ExecutionSession ─▶ ScriptSandbox (worker)
//!                                     │      ▲              │
//!                                     │      └── Mutation ◀─┤ shim natives
//!                                     └─▶ CallbackBridge ◀──┘ XHR / timers / Style
//! ```

pub mod bridge;
pub mod config;
pub mod control;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod sandbox;
pub mod session;
pub mod shim;
pub mod tracker;
pub mod watchdog;

pub use bridge::{CallbackBridge, Fetched, Fetcher, NoStyles, StyleProvider, XhrRequest};
pub use config::SessionConfig;
pub use control::{ControlError, ControlServer, Dispatcher, StartPlan};
pub use error::{BridgeError, ExecError, SandboxError};
pub use events::{mutation_channel, Mutation, MutationKind, MutationQueue, MutationRecorder};
pub use sandbox::{EngineLimits, LoopHandle, ScriptSandbox, TurnId};
pub use session::{ClickOutcome, ExecRequest, ExecutionSession, Lifecycle};
pub use tracker::{ChangeTracker, Changes};
pub use watchdog::{ExecPhase, TimeoutGuard};
