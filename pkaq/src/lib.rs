//! pkaq - FIFO admission, cluster dispatch and progress reporting for
//! protein titration jobs.
//!
//! Every accepted submission gets its own worker. Workers share exactly one
//! compute slot, handed out in strict arrival order by an admission queue
//! that can live in a database shared by several server processes. The
//! worker at the head either runs the titration routine in-process or ships
//! it to a batch cluster and waits for the cluster job to leave the queue.
//!
//! # Core Concepts
//!
//! - **Admission**: the [`AdmissionQueue`] trait and the slot protocol in
//!   [`runtime::slot`]. Entries carry a lease that waiters and the slot
//!   holder renew; a housekeeper evicts entries whose holder went away.
//!
//! - **Dispatch**: the [`JobDispatcher`] trait with a local implementation
//!   and a cluster implementation ([`cluster::ClusterDispatcher`]) whose
//!   plain and power-aware behaviour is a configuration choice.
//!
//! - **Lifecycle store**: the [`LifecycleStore`] trait holds Jobs, Proteins,
//!   Inputs and the single Result per job. Job state is never stored; it is
//!   derived from queue membership and the Result.
//!
//! - **Runner**: [`ComputationRunner`] wraps a [`TitrationRoutine`] so a
//!   failed or panicking computation becomes a recorded failure.
//!
//! - **Progress**: [`ProgressReporter`] answers status queries from the
//!   Result when there is one and from the live log otherwise.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL queue and store via sqlx, and the `pkaq` binary
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pkaq::*;
//!
//! let store = Arc::new(InMemoryLifecycleStore::new());
//! let runner = ComputationRunner::new(CommandRoutine::new("pypka-json", "2.10"), config.runner.clone());
//! let runtime = OrchestratorRuntimeBuilder::new(OrchestratorRuntimeConfig::from(&config))
//!     .with_queue(Arc::new(InMemoryAdmissionQueue::new()))
//!     .with_store(store.clone())
//!     .with_dispatcher(Arc::new(LocalDispatcher::new(runner, store)))
//!     .build()?;
//! runtime.spawn_housekeeper();
//! let receipt = runtime.submit(request).await?;
//! ```

/// Batch cluster dispatch.
///
/// Script generation, the [`cluster::ClusterCli`] seam with its Slurm
/// implementation, and the submit-and-poll [`cluster::ClusterDispatcher`].
pub mod cluster;

/// Configuration structures, loaded from TOML.
pub mod config;

/// The [`JobDispatcher`] seam and the in-process [`LocalDispatcher`].
pub mod dispatch;

pub mod error;

/// Event publishing and subscription.
///
/// [`JobEvent`] and [`JobEventPayload`] describe lifecycle transitions;
/// [`InProcEventBus`] fans them out to in-process observers.
pub mod events;

/// Job identity: tokens, store ids, submission metadata and derived state.
pub mod job;

/// Queue entry leases and bounded retry policy.
pub mod lease;

#[cfg(feature = "metrics")]
pub mod metrics;

/// Parameter bag handed to the routine and the echoed parameter sets.
pub mod params;

/// Status lookups and the push stream built on them.
pub mod progress;

/// Admission queue trait and the in-memory implementation.
pub mod queue;

/// The titration routine seam and the external-command adapter.
pub mod routine;

/// Executes the routine and persists its outcome.
pub mod runner;

/// Runtime orchestration: submission intake, slot acquisition, workers.
///
/// - [`OrchestratorRuntime`] - main runtime type
/// - [`OrchestratorRuntimeConfig`] - runtime configuration
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`SlotHold`] - the compute slot and its lease heartbeat
/// - [`OrchestratorRuntimeBuilder`] for constructing runtimes
pub mod runtime;

/// Lifecycle store trait, record types and the in-memory implementation.
pub mod store;

/// Submission validation, token assignment and parameter construction.
pub mod submission;

pub mod telemetry;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides PostgreSQL-backed implementations
/// of the admission queue and the lifecycle store when the `postgres`
/// feature is enabled.
pub mod persistence;

pub use config::*;
pub use dispatch::*;
pub use error::PkaqError;
pub use events::*;
pub use job::*;
pub use lease::*;
pub use params::*;
pub use progress::*;
pub use queue::*;
pub use routine::*;
pub use runner::*;
pub use runtime::*;
pub use store::*;
pub use submission::*;
