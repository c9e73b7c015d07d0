//! modshard: shards test modules across a pool of devices.
//!
//! A run discovers test modules, instantiates one executor per module and
//! architecture variant, and hands each connected device a balanced share.
//! Devices run their share concurrently; a later run can retry whatever an
//! earlier one left outstanding.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Repository**: classifies modules into buckets and assigns them to shards
//! - **Coordinator**: drives one device through its assigned modules
//! - **Retry**: rebuilds a run's scope from a persisted invocation record
//! - **Report**: JUnit XML and console summaries
//!
//! ```text
//!   module files ──► ModuleLoader ──► ModuleRepository ◄── get_modules(serial)
//!                                          ▲                     │
//!                           InitRequest    │          ShardCoordinator × N
//!                                          │                     │
//!   --retry ──► RetryReconciler ──► Invocation ◄──── ShardReport ┘
//!                                          │
//!                                   ResultStore + JUnit
//! ```
//!
//! # Example
//!
//! ```no_run
//! use modshard::config::load_config;
//! use modshard::invocation::Invocation;
//! use modshard::options::SchedulingOptions;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("modshard.toml"))?;
//!     let outcome = Invocation::new(config, SchedulingOptions::default()).run().await?;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod device;
pub mod filter;
pub mod invocation;
pub mod module;
pub mod options;
pub mod report;
pub mod repository;
pub mod retry;
pub mod shell;
pub mod token;

pub use config::{Config, load_config};
pub use coordinator::{ShardCoordinator, ShardReport};
pub use invocation::{Invocation, InvocationOutcome};
pub use module::{ModuleDescriptor, TestOutcome, TestResult};
pub use options::SchedulingOptions;
pub use repository::{InitRequest, ModuleRepository};
