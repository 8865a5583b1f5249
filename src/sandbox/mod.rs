//! Sandbox lifecycle and fault recovery.
//!
//! ## Overview
//!
//! Every development session runs in one remote sandbox. This subsystem
//! creates and caches those sandboxes, probes them on a timer, tracks their
//! health behind a per-session circuit breaker and, when a sandbox keeps
//! failing, rebuilds what it knows about the session and runs an ordered
//! chain of recovery strategies.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Caller  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ create / get / execute_command         │
//!                       │         v                                        │
//!                       │  lifecycle.rs  (SandboxManager, idle sweep)      │
//!                       │         │                                        │
//!                       │         │ register_sandbox()                     │
//!                       │         v                                        │
//!                       │  monitor.rs  (HealthMonitor: health + breakers)  │
//!                       │         │  probe.rs  (HealthProber)              │
//!                       │         │  breaker.rs  (CircuitBreaker)          │
//!                       │         │                                        │
//!                       │         │ threshold reached → recovery worker    │
//!                       │         v                                        │
//!                       │  context.rs  (RecoveryContextBuilder)            │
//!                       │  chain.rs    (RecoveryChain)                     │
//!                       │  strategy.rs (four built-in strategies)          │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                          |
//! |------------|---------------------------------------------------------|
//! | `models`   | Session, snapshot, failure and recovery types           |
//! | `health`   | `HealthStatus`, `SandboxHealth`, status thresholds      |
//! | `client`   | `SandboxClient` trait and command types                 |
//! | `daytona`  | `DaytonaClient`, the REST implementation of the client  |
//! | `store`    | `SessionStore` trait and the SQLite `DbHandle` store    |
//! | `project`  | Project bootstrap inside a fresh sandbox                |
//! | `attempt`  | `first_success` ordered-fallback helper                 |
//! | `events`   | `SandboxEvent` enum + WebSocket fan-out                 |
//! | `testing`  | Scripted client and store doubles (`testing` feature)   |
//!
//! ## Failure Flow
//!
//! 1. The scheduler tick probes every registered session concurrently. A
//!    session whose circuit is open, or whose previous probe is still
//!    running, is skipped.
//! 2. Each probe updates the session's `SandboxHealth` and breaker.
//! 3. At `auto_recovery_threshold` consecutive failures (and while the
//!    attempt budget lasts) a recovery job is queued for the worker.
//! 4. The worker builds a fresh `RecoveryContext` from the session store and
//!    runs the chain. A new sandbox is swapped into the session's health
//!    record; a clean-slate result moves tracking to the new session id.
//! 5. Every outcome is recorded in the store and broadcast as an event.

pub mod api;
pub mod attempt;
pub mod breaker;
pub mod chain;
pub mod client;
pub mod context;
pub mod daytona;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod monitor;
pub mod probe;
pub mod project;
pub mod server;
pub mod store;
pub mod strategy;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
