//! Sandbox Manager - isolated, forkable workspaces for running agent code.
//!
//! A [`Manager`](manager::Manager) keeps a durable index of sandboxes and
//! delegates their lifecycle to pluggable [`Driver`](driver::Driver)s. Every
//! loaded sandbox exposes the same [`Sandbox`](sandbox::Sandbox) contract:
//! file I/O, paginated directory listings and detached process execution
//! with captured output.
//!
//! Two backends ship with the crate:
//!
//! - `local`: one directory per sandbox on the host, processes supervised by
//!   the `sbx helper exec` subcommand
//! - `docker`: one long-lived container per sandbox, forks via image commits
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sandbox_manager::driver::{LocalDriver, LocalDriverConfig};
//! use sandbox_manager::manager::{FileStore, Manager};
//! use sandbox_manager::sandbox::{ExecOptions, SandboxConfig};
//! use sandbox_manager::system::paths;
//!
//! #[tokio::main]
//! async fn main() -> miette::Result<()> {
//!     let base = paths::default_base_dir();
//!     let manager = Manager::new(Arc::new(FileStore::open(paths::index_dir(&base))?))
//!         .with_driver(Arc::new(LocalDriver::new(LocalDriverConfig::new(
//!             paths::sandboxes_dir(&base),
//!         ))))
//!         .with_default_driver("local");
//!
//!     let sandbox = manager.create_sandbox(SandboxConfig::new("demo")).await?;
//!     let id = sandbox.execute("ls", &[], ExecOptions::default()).await?;
//!     sandbox.wait(&id).await?;
//!     println!("{}", sandbox.output(&id).await?.output);
//!     Ok(())
//! }
//! ```

pub mod driver;
pub mod error;
pub mod helper;
pub mod manager;
pub mod sandbox;
pub mod system;

// Re-export commonly used types
pub use driver::Driver;
pub use error::{Error, Result};
pub use manager::Manager;
pub use sandbox::{Sandbox, SandboxConfig};
