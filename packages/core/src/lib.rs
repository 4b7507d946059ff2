//! swift-drive-autopilot-core: drive lifecycle engine for Swift storage nodes.
//!
//! This library discovers raw block devices inside a chroot, encrypts blank
//! ones with LUKS, opens existing containers, assigns every drive a stable
//! swift-id and mounts it at `/srv/node/<swift-id>`. Failing drives are
//! quarantined until an operator reinstates them.
//!
//! # Modules
//!
//! - [`config`]: Configuration file model
//! - [`executor`]: Command execution (chroot wrapping, stdin, secret hiding)
//! - [`drive`]: Drive entities and content classification
//! - [`luks`]: LUKS open/close/format/check
//! - [`mounts`]: Kernel mount table snapshots
//! - [`mount`]: Scratch and final mount controllers
//! - [`identity`]: Swift-id assignment
//! - [`quarantine`]: Broken-drive quarantine and reinstatement
//! - [`reconciler`]: Drive registry and reconciliation pass
//! - [`events`]: Polling event source
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use swift_drive_autopilot_core::{Config, Context, Reconciler};
//!
//! let config = Config::load(Path::new("/etc/swift-drive-autopilot.yaml")).unwrap();
//! let mut reconciler = Reconciler::new(Context::new(config));
//!
//! // Requires root and real drives:
//! let report = reconciler.run_pass().unwrap();
//! std::process::exit(if report.failed { 1 } else { 0 });
//! ```

pub mod config;
pub mod context;
pub mod drive;
pub mod error;
pub mod events;
pub mod executor;
pub mod identity;
pub mod luks;
pub mod mount;
pub mod mounts;
pub mod paths;
pub mod quarantine;
pub mod reconciler;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use context::Context;
pub use drive::Drive;
pub use error::{Error, Result};
pub use events::{Event, EventSource};
pub use reconciler::{PassReport, Reconciler};
