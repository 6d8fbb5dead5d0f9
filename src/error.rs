//! Error types for the job engine
//!
//! Per-drainer I/O errors are local to the drainer and never fail the job.
//! Invalid state transitions are reported to the caller and leave job state
//! unchanged. Terminal-control failures in non-interactive mode are absorbed
//! before they ever reach this type.

use crate::jobs::state::{JobEvent, JobState};
use crate::stream::ChannelIndex;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Fork or exec setup failed before a job could be registered.
    #[error("failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: nix::Error,
    },

    /// Pipe creation failed while building the six-channel topology.
    #[error("failed to create pipe for channel {channel}: {source}")]
    PipeCreateFailed {
        channel: ChannelIndex,
        #[source]
        source: nix::Error,
    },

    /// The state machine rejected the (state, event) pair.
    #[error("invalid transition: event {event} in state {state}")]
    InvalidTransition { state: JobState, event: JobEvent },

    /// No job with this id exists in the registry.
    #[error("no such job: {0}")]
    NoSuchJob(u32),

    /// A terminal operation was requested but the shell has no controlling
    /// terminal.
    #[error("no controlling terminal")]
    NoControllingTerminal,

    /// A read on a channel endpoint failed unrecoverably.
    #[error("read failed on channel {channel}: {source}")]
    ReadError {
        channel: ChannelIndex,
        #[source]
        source: nix::Error,
    },

    /// A write on a channel endpoint failed.
    #[error("write failed on channel {channel}: {source}")]
    WriteError {
        channel: ChannelIndex,
        #[source]
        source: nix::Error,
    },

    /// The stdin or stddati endpoint was already closed.
    #[error("channel {0} is closed")]
    ChannelClosed(ChannelIndex),

    /// A signal could not be delivered to a job's process group.
    #[error("failed to signal job {job_id}: {source}")]
    SignalDelivery {
        job_id: u32,
        #[source]
        source: nix::Error,
    },

    /// A handle-map string could not be parsed at all. Individual malformed
    /// entries are skipped silently; this is reserved for callers that
    /// require a map and got none.
    #[error("malformed handle map: {0}")]
    HandleMapMalformed(String),

    /// Advisory: a drop-policy drainer discarded data. Visible through the
    /// drainer's counter, not raised per occurrence.
    #[error("drainer dropped {0} bytes on overflow")]
    OverflowDropped(u64),

    /// Terminal mode query or update failed.
    #[error("terminal operation failed: {0}")]
    Terminal(nix::Error),
}
