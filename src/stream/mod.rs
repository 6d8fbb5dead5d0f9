//! Six-channel ("hex-stream") I/O for child processes
//!
//! Every job gets six directed byte conduits between parent and child:
//!
//! - 0 stdin   text input (child reads)
//! - 1 stdout  text output (child writes)
//! - 2 stderr  error text (child writes)
//! - 3 stddbg  structured telemetry (child writes, drop on overflow)
//! - 4 stddati binary data input (child reads)
//! - 5 stddato binary data output (child writes)
//!
//! One drain worker per output channel keeps the kernel pipe from filling,
//! which is what prevents the classic pipe deadlock on large outputs.

pub mod drainer;
pub mod pipes;
pub mod ring_buffer;

pub use drainer::StreamDrainer;
pub use pipes::PipeSet;
pub use ring_buffer::RingBuffer;

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use nix::unistd;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Channel index with its fixed semantic role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(u8)]
pub enum ChannelIndex {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
    Stddbg = 3,
    Stddati = 4,
    Stddato = 5,
}

impl ChannelIndex {
    pub const ALL: [ChannelIndex; 6] = [
        ChannelIndex::Stdin,
        ChannelIndex::Stdout,
        ChannelIndex::Stderr,
        ChannelIndex::Stddbg,
        ChannelIndex::Stddati,
        ChannelIndex::Stddato,
    ];

    /// The four channels the child writes and the parent drains.
    pub const OUTPUTS: [ChannelIndex; 4] = [
        ChannelIndex::Stdout,
        ChannelIndex::Stderr,
        ChannelIndex::Stddbg,
        ChannelIndex::Stddato,
    ];

    pub fn from_index(idx: u8) -> Option<Self> {
        match idx {
            0 => Some(ChannelIndex::Stdin),
            1 => Some(ChannelIndex::Stdout),
            2 => Some(ChannelIndex::Stderr),
            3 => Some(ChannelIndex::Stddbg),
            4 => Some(ChannelIndex::Stddati),
            5 => Some(ChannelIndex::Stddato),
            _ => None,
        }
    }

    pub fn as_index(self) -> usize {
        self as usize
    }

    /// Child reads from this channel (parent holds the write end).
    pub fn is_child_read(self) -> bool {
        matches!(self, ChannelIndex::Stdin | ChannelIndex::Stddati)
    }

    /// Child writes to this channel (parent holds the read end).
    pub fn is_child_write(self) -> bool {
        !self.is_child_read()
    }

    pub fn name(self) -> &'static str {
        match self {
            ChannelIndex::Stdin => "stdin",
            ChannelIndex::Stdout => "stdout",
            ChannelIndex::Stderr => "stderr",
            ChannelIndex::Stddbg => "stddbg",
            ChannelIndex::Stddati => "stddati",
            ChannelIndex::Stddato => "stddato",
        }
    }

    /// Overflow policy applied when this channel's ring is full. Telemetry
    /// drops; everything user-visible blocks.
    pub fn overflow_policy(self) -> OverflowPolicy {
        match self {
            ChannelIndex::Stddbg => OverflowPolicy::Drop,
            _ => OverflowPolicy::Block,
        }
    }
}

impl fmt::Display for ChannelIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_index(), self.name())
    }
}

/// What a drainer does with bytes its ring buffer cannot accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Retry until accepted; backpressure reaches the child through the
    /// kernel pipe.
    Block,
    /// Discard the unaccepted tail and keep going.
    Drop,
}

/// Callback invoked from a drainer's thread context as `(channel, bytes)`.
/// Callbacks must not block.
pub type DataCallback = Box<dyn Fn(ChannelIndex, &[u8]) + Send>;

pub(crate) type DataCallbacks = Arc<Mutex<Vec<DataCallback>>>;

pub(crate) fn new_callbacks() -> DataCallbacks {
    Arc::new(Mutex::new(Vec::new()))
}

/// Owns one pipe set, six ring buffers and up to four drain workers for a
/// single job. Created per job; lives until the job terminates and every
/// drainer has finalized.
pub struct StreamController {
    config: StreamConfig,
    pipes: Option<PipeSet>,
    buffers: [Arc<RingBuffer>; 6],
    drainers: Vec<StreamDrainer>,
    callbacks: DataCallbacks,
    foreground: Arc<AtomicBool>,
}

impl StreamController {
    pub fn new(config: StreamConfig) -> Self {
        let buffers = ChannelIndex::ALL
            .map(|ch| Arc::new(RingBuffer::new(config.capacity_for(ch))));
        Self {
            config,
            pipes: None,
            buffers,
            drainers: Vec::new(),
            callbacks: new_callbacks(),
            foreground: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Create the six channels, close-on-exec set on every endpoint.
    pub fn create_pipes(&mut self) -> Result<()> {
        self.pipes = Some(PipeSet::create()?);
        Ok(())
    }

    pub fn pipes(&self) -> Option<&PipeSet> {
        self.pipes.as_ref()
    }

    /// Child side: install descriptors 0..5 and close the originals. Called
    /// between fork and exec; any error here aborts the child.
    pub fn setup_child(&mut self) -> std::result::Result<(), nix::Error> {
        match self.pipes.as_mut() {
            Some(pipes) => pipes.setup_child(),
            None => Err(nix::Error::EBADF),
        }
    }

    /// Parent side: close the child-owned endpoints so EOF can propagate.
    pub fn setup_parent(&mut self) {
        if let Some(pipes) = self.pipes.as_mut() {
            pipes.setup_parent();
        }
    }

    /// Start one drain worker per output channel. Each takes ownership of
    /// its read end.
    pub fn start_draining(&mut self) {
        let pipes = match self.pipes.as_mut() {
            Some(p) => p,
            None => return,
        };

        for channel in ChannelIndex::OUTPUTS {
            if let Some(fd) = pipes.take_parent_read_end(channel) {
                self.drainers.push(StreamDrainer::spawn(
                    channel,
                    fd,
                    Arc::clone(&self.buffers[channel.as_index()]),
                    channel.overflow_policy(),
                    Arc::clone(&self.callbacks),
                    Arc::clone(&self.foreground),
                    self.config.scratch_size,
                    self.config.poll_interval_ms,
                ));
            }
        }
    }

    /// Cancel every drainer and join it. Synchronous: returns only after
    /// all workers have finalized. Statistics remain readable afterwards.
    pub fn stop_draining(&mut self) {
        for drainer in &self.drainers {
            drainer.request_stop();
        }
        for drainer in &mut self.drainers {
            drainer.join();
        }
    }

    /// Join drainers without cancelling them first. Used after child exit
    /// when the workers are expected to run to EOF on their own.
    pub fn finish_draining(&mut self) {
        for drainer in &mut self.drainers {
            drainer.join();
        }
    }

    /// Producer side of channel 0. May block on the pipe when the child is
    /// slow; that is deliberate upstream backpressure.
    pub fn write_stdin(&self, data: &[u8]) -> Result<usize> {
        self.write_input(ChannelIndex::Stdin, data)
    }

    /// Close channel 0, signalling EOF to the child. Idempotent.
    pub fn close_stdin(&mut self) {
        if let Some(pipes) = self.pipes.as_mut() {
            pipes.close_parent_write_end(ChannelIndex::Stdin);
        }
    }

    /// Producer side of channel 4.
    pub fn write_stddati(&self, data: &[u8]) -> Result<usize> {
        self.write_input(ChannelIndex::Stddati, data)
    }

    fn write_input(&self, channel: ChannelIndex, data: &[u8]) -> Result<usize> {
        let pipes = self.pipes.as_ref().ok_or(Error::ChannelClosed(channel))?;
        let fd = pipes
            .parent_write_end(channel)
            .ok_or(Error::ChannelClosed(channel))?;
        unistd::write(fd, data).map_err(|e| Error::WriteError {
            channel,
            source: e,
        })
    }

    /// Consume buffered output for a channel.
    pub fn read_buffer(&self, channel: ChannelIndex, out: &mut [u8]) -> usize {
        self.buffers[channel.as_index()].read(out)
    }

    /// Bytes currently buffered for a channel.
    pub fn available(&self, channel: ChannelIndex) -> usize {
        self.buffers[channel.as_index()].available()
    }

    pub fn has_pending(&self, channel: ChannelIndex) -> bool {
        self.available(channel) > 0
    }

    /// Register a data callback. Invoked from the drainer's thread with
    /// each chunk as it is read; must not block.
    pub fn on_data<F>(&self, callback: F)
    where
        F: Fn(ChannelIndex, &[u8]) + Send + 'static,
    {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    /// In foreground mode stdout/stderr are also copied straight to the
    /// shell's terminal; buffers still receive the data.
    pub fn set_foreground_mode(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::Release);
    }

    pub fn foreground_mode(&self) -> bool {
        self.foreground.load(Ordering::Acquire)
    }

    /// Drain all ring buffers through the registered callbacks. Used after
    /// job termination to deliver trailing output.
    pub fn flush_buffers(&self) {
        let mut scratch = [0u8; 4096];
        for channel in ChannelIndex::ALL {
            loop {
                let n = self.buffers[channel.as_index()].read(&mut scratch);
                if n == 0 {
                    break;
                }
                let callbacks = self.callbacks.lock().unwrap();
                for cb in callbacks.iter() {
                    cb(channel, &scratch[..n]);
                }
            }
        }
    }

    /// Sum of bytes read from all output channels.
    pub fn total_bytes_transferred(&self) -> u64 {
        self.drainers.iter().map(|d| d.bytes_transferred()).sum()
    }

    /// Bytes discarded by drop-policy drainers.
    pub fn total_bytes_dropped(&self) -> u64 {
        self.drainers.iter().map(|d| d.bytes_dropped()).sum()
    }

    /// Drainers whose worker is still running.
    pub fn active_drainer_count(&self) -> usize {
        self.drainers.iter().filter(|d| d.is_active()).count()
    }

    /// Stop drainers and close every endpoint. Idempotent.
    pub fn close(&mut self) {
        self.stop_draining();
        if let Some(pipes) = self.pipes.as_mut() {
            pipes.close();
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.close();
    }
}
