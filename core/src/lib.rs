//! Process lifecycle manager for user-defined shell scripts.
//!
//! `LifecycleController` starts and stops scripts, captures their output,
//! publishes `RunState` transitions and, after a restart of the manager,
//! re-adopts processes that are still alive via the persisted run index.

// Prevent accidental direct writes to stdout/stderr in library code.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
mod controller;
mod error;
pub mod output_buffer;
pub mod process;
mod registry;
pub mod run_index;
mod run_state;
mod script;

pub use config::LifecycleConfig;
pub use config::find_scriptdeck_home;
pub use controller::LifecycleController;
pub use controller::ReconcileReport;
pub use error::LifecycleError;
pub use error::Result;
pub use output_buffer::OutputBuffer;
pub use registry::ProcessRegistry;
pub use run_index::PersistedRunEntry;
pub use run_index::PersistentRunIndex;
pub use run_state::RunState;
pub use run_state::RunStateChange;
pub use run_state::RunStatus;
pub use script::ScriptDefinition;
pub use script::ScriptId;
