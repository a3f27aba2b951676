//! Script execution module
//!
//! This module owns everything that touches a child process:
//! - The launcher capability shared by both execution paths
//! - Normal execution in a dedicated process group
//! - Elevated execution through an OS helper with a file-based transport
//! - Incremental decoding of the combined output stream

mod decode;
mod launcher;
mod privileged;
pub(crate) mod process;

pub use decode::{ChunkDecoder, OutputChunk, TextEncoding};

pub use launcher::{
    ActiveRun, CancelOutcome, ExitCause, ExitReport, Launcher, OutputSink, ProcessEvent, RunId,
    TaggedEvent, EXIT_CODE_CANCELLED, EXIT_CODE_CRASHED,
};

pub use privileged::{ElevationHelper, PrivilegedLauncher};

pub use process::{ProcessGroup, ProcessLauncher};
