//! Engine configuration from environment variables
//!
//! Tuning knobs for the stream subsystem:
//! - HEXSH_RING_CAPACITY       ring capacity for stdout/stderr/stddato (bytes)
//! - HEXSH_TELEMETRY_CAPACITY  ring capacity for stddbg (bytes)
//! - HEXSH_SCRATCH_SIZE        per-read scratch buffer (bytes)
//! - HEXSH_POLL_INTERVAL_MS    drainer poll timeout (capped at 100 ms)

use crate::stream::ChannelIndex;

/// Default ring capacity for user-visible output channels (1 MiB)
pub const DEFAULT_RING_CAPACITY: usize = 1024 * 1024;

/// Default ring capacity for the telemetry channel (64 KiB)
pub const DEFAULT_TELEMETRY_CAPACITY: usize = 64 * 1024;

/// Default per-read scratch size (4 KiB)
pub const DEFAULT_SCRATCH_SIZE: usize = 4096;

/// Default drainer poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u16 = 100;

/// Cancellation must be observed within one poll interval, so the interval
/// never exceeds this bound.
pub const MAX_POLL_INTERVAL_MS: u16 = 100;

/// Stream subsystem configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Ring capacity for stdout, stderr and stddato
    pub ring_capacity: usize,
    /// Ring capacity for stddbg
    pub telemetry_capacity: usize,
    /// Scratch buffer size used by each drainer read
    pub scratch_size: usize,
    /// Poll timeout for each drainer iteration
    pub poll_interval_ms: u16,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            telemetry_capacity: DEFAULT_TELEMETRY_CAPACITY,
            scratch_size: DEFAULT_SCRATCH_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl StreamConfig {
    /// Ring capacity for a given channel. Input channels get the same
    /// capacity as output channels; their buffers simply stay empty.
    pub fn capacity_for(&self, channel: ChannelIndex) -> usize {
        match channel {
            ChannelIndex::Stddbg => self.telemetry_capacity,
            _ => self.ring_capacity,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub stream: StreamConfig,
}

impl EngineConfig {
    /// Load configuration from the environment, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_usize("HEXSH_RING_CAPACITY") {
            if v > 1 {
                cfg.stream.ring_capacity = v;
            }
        }
        if let Some(v) = env_usize("HEXSH_TELEMETRY_CAPACITY") {
            if v > 1 {
                cfg.stream.telemetry_capacity = v;
            }
        }
        if let Some(v) = env_usize("HEXSH_SCRATCH_SIZE") {
            if v > 0 {
                cfg.stream.scratch_size = v;
            }
        }
        if let Some(v) = env_usize("HEXSH_POLL_INTERVAL_MS") {
            let v = v.min(MAX_POLL_INTERVAL_MS as usize).max(1);
            cfg.stream.poll_interval_ms = v as u16;
        }

        cfg
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}
