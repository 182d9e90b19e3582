//! Drover Supervisor - keeps a fleet of coding-agent workers alive and within budget
//!
//! Wraps the policy types of `drover-core` in one owned [`FleetSupervisor`]
//! that ticks on a timer against an external [`WorkerRuntime`]:
//! - **Recovery** - poke idle workers, optionally kill stuck ones
//! - **Restarts** - exponential backoff, give up after a retry cap
//! - **Circuit breaker** - pause all spawns after a burst of deaths
//! - **Cost** - price token usage and alert on per-worker, per-unit and daily limits
//! - **Handoffs** - move work to a better-suited model without losing it
//! - **Rotation** - restart long-lived specialists with summarized memory
//!
//! ## Example
//!
//! ```rust,ignore
//! use drover_supervisor::FleetSupervisor;
//! use drover_core::prelude::*;
//! use std::sync::Arc;
//!
//! let supervisor = Arc::new(FleetSupervisor::new(
//!     DroverConfig::load()?,
//!     runtime,
//!     Arc::new(InMemoryWorkerStore::new()),
//! ));
//! supervisor.init().await?;
//!
//! let looping = supervisor.clone();
//! tokio::spawn(async move { looping.run().await });
//!
//! // later
//! supervisor.shutdown().await?;
//! ```
//!
//! [`WorkerRuntime`]: drover_core::runtime::WorkerRuntime

mod error;
mod handoff;
mod recovery;
mod restart;
mod rotation;
mod status;
mod supervisor;

pub use error::{Result, SupervisorError};
pub use recovery::RecoveryReport;
pub use status::{FleetStatus, count_states};
pub use supervisor::{EmergencyStopReport, FleetSupervisor, TickReport};
