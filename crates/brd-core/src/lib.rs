//! brd Core - Download Engine and Worker Supervisor
//!
//! This crate retrieves files over HTTP(S) with bandwidth pacing, redirect
//! following, retries and collision-safe naming, either inline or inside
//! worker processes managed by a [`Supervisor`].

pub mod engine;
mod error;
mod registry;
mod storage;
pub mod supervisor;

pub use engine::{build_client, DownloadEngine, EngineControl, Scheme, TaskHooks};
pub use error::*;
pub use registry::*;
pub use storage::*;
pub use supervisor::{Supervisor, SupervisorConfig, WorkerConfig, WorkerEntry};
