//! monwatch Daemon Library
//!
//! Event loop, action dispatch and process lifecycle for the display
//! hotplug watcher. The `monwatch` binary wires these together.

pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod lifecycle;

pub use config::DaemonConfig;
pub use daemon::{ReconcileOptions, Reconciler};
pub use dispatch::{ActionSink, ScriptDispatcher};
pub use lifecycle::{ChildReaper, ShutdownHandle};
