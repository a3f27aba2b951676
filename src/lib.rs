//! script-exec - run a wrapped script the way its wrapper was configured
//!
//! The engine launches the script (plainly or with elevated privileges),
//! routes its output to a presentation surface, queues further triggers
//! (dropped files, dropped text, control-stream requests) and decides when
//! the wrapper itself terminates.

pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod job;
pub mod logging;
pub mod output;
pub mod queue;
pub mod triggers;

pub use controller::{EngineHandle, EngineOutcome, EngineStatus, ExecutionController, RunState};
pub use error::{Result, ScriptExecError};
