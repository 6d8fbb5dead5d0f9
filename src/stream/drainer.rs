//! Per-channel drain worker
//!
//! One thread per output channel. Each iteration polls the child's endpoint
//! with a short timeout so the cancellation flag is observed promptly, reads
//! a scratch-sized chunk and enqueues it into the ring buffer under the
//! channel's overflow policy.

use crate::stream::ring_buffer::RingBuffer;
use crate::stream::{ChannelIndex, DataCallbacks, OverflowPolicy};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Cooperative worker draining one output channel into its ring buffer.
///
/// Terminates on EOF, unrecoverable read error, pipe hang-up or
/// cancellation. Requesting cancellation is guaranteed to be observed
/// within one poll interval plus any in-flight read.
pub struct StreamDrainer {
    channel: ChannelIndex,
    stop: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    bytes_transferred: Arc<AtomicU64>,
    bytes_dropped: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl StreamDrainer {
    /// Start the worker thread. Takes ownership of the channel's read end;
    /// the descriptor closes when the worker finishes.
    pub fn spawn(
        channel: ChannelIndex,
        fd: OwnedFd,
        buffer: Arc<RingBuffer>,
        policy: OverflowPolicy,
        callbacks: DataCallbacks,
        foreground: Arc<AtomicBool>,
        scratch_size: usize,
        poll_interval_ms: u16,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicBool::new(true));
        let bytes_transferred = Arc::new(AtomicU64::new(0));
        let bytes_dropped = Arc::new(AtomicU64::new(0));

        let worker = DrainWorker {
            channel,
            fd,
            buffer,
            policy,
            callbacks,
            foreground,
            scratch_size,
            poll_interval_ms,
            stop: Arc::clone(&stop),
            active: Arc::clone(&active),
            bytes_transferred: Arc::clone(&bytes_transferred),
            bytes_dropped: Arc::clone(&bytes_dropped),
        };

        let handle = thread::spawn(move || worker.run());

        Self {
            channel,
            stop,
            active,
            bytes_transferred,
            bytes_dropped,
            handle: Some(handle),
        }
    }

    pub fn channel(&self) -> ChannelIndex {
        self.channel
    }

    /// Ask the worker to stop at its next poll boundary.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait for the worker to finish. Idempotent.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Total bytes read from the pipe, including any later dropped.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    /// Bytes discarded under the drop policy. Strictly increasing under
    /// sustained overload; advisory only.
    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped.load(Ordering::Relaxed)
    }
}

impl Drop for StreamDrainer {
    fn drop(&mut self) {
        self.request_stop();
        self.join();
    }
}

struct DrainWorker {
    channel: ChannelIndex,
    fd: OwnedFd,
    buffer: Arc<RingBuffer>,
    policy: OverflowPolicy,
    callbacks: DataCallbacks,
    foreground: Arc<AtomicBool>,
    scratch_size: usize,
    poll_interval_ms: u16,
    stop: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    bytes_transferred: Arc<AtomicU64>,
    bytes_dropped: Arc<AtomicU64>,
}

impl DrainWorker {
    fn run(self) {
        let mut scratch = vec![0u8; self.scratch_size.max(1)];
        let timeout = PollTimeout::from(self.poll_interval_ms);

        while !self.stop.load(Ordering::Acquire) {
            let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
            let ready = match poll(&mut fds, timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            };
            if ready == 0 {
                // Timeout: loop back to observe the stop flag
                continue;
            }

            let revents = fds[0].revents().unwrap_or(PollFlags::empty());

            if revents.contains(PollFlags::POLLIN) {
                match unistd::read(self.fd.as_raw_fd(), &mut scratch) {
                    Ok(0) => break, // EOF, child closed its end
                    Ok(n) => self.deliver(&scratch[..n]),
                    Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                    Err(_) => break,
                }
            } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                // Hang-up with nothing readable left
                break;
            }
        }

        self.active.store(false, Ordering::Release);
    }

    fn deliver(&self, chunk: &[u8]) {
        let mut accepted = self.buffer.write(chunk);

        if accepted < chunk.len() {
            match self.policy {
                OverflowPolicy::Drop => {
                    // Timeliness beats completeness on this channel
                    self.bytes_dropped
                        .fetch_add((chunk.len() - accepted) as u64, Ordering::Relaxed);
                }
                OverflowPolicy::Block => {
                    // Spin-yield until the consumer makes room. The OS pipe
                    // fills behind us, which blocks the child's write.
                    while accepted < chunk.len() && !self.stop.load(Ordering::Acquire) {
                        let n = self.buffer.write(&chunk[accepted..]);
                        if n == 0 {
                            thread::yield_now();
                        } else {
                            accepted += n;
                        }
                    }
                }
            }
        }

        self.bytes_transferred
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);

        if self.foreground.load(Ordering::Acquire) {
            self.passthrough(chunk);
        }

        let callbacks = self.callbacks.lock().unwrap();
        for cb in callbacks.iter() {
            cb(self.channel, chunk);
        }
    }

    /// Copy foreground output straight to the shell's own terminal
    /// endpoints. Buffers still receive the data.
    fn passthrough(&self, chunk: &[u8]) {
        match self.channel {
            ChannelIndex::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(chunk);
                let _ = out.flush();
            }
            ChannelIndex::Stderr => {
                let mut err = std::io::stderr().lock();
                let _ = err.write_all(chunk);
                let _ = err.flush();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::new_callbacks;
    use std::time::{Duration, Instant};

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        nix::unistd::pipe().expect("pipe")
    }

    fn test_drainer(
        fd: OwnedFd,
        buffer: Arc<RingBuffer>,
        policy: OverflowPolicy,
    ) -> StreamDrainer {
        StreamDrainer::spawn(
            ChannelIndex::Stdout,
            fd,
            buffer,
            policy,
            new_callbacks(),
            Arc::new(AtomicBool::new(false)),
            4096,
            20,
        )
    }

    #[test]
    fn test_drains_into_ring() {
        let (r, w) = pipe_pair();
        let buffer = Arc::new(RingBuffer::new(4096));
        let mut drainer = test_drainer(r, Arc::clone(&buffer), OverflowPolicy::Block);

        nix::unistd::write(&w, b"hello drainer").unwrap();
        drop(w); // EOF terminates the worker
        drainer.join();

        assert!(!drainer.is_active());
        assert_eq!(drainer.bytes_transferred(), 13);

        let mut out = [0u8; 32];
        let n = buffer.read(&mut out);
        assert_eq!(&out[..n], b"hello drainer");
    }

    #[test]
    fn test_drop_policy_counts_discards() {
        let (r, w) = pipe_pair();
        // Tiny ring: 15 usable bytes
        let buffer = Arc::new(RingBuffer::new(16));
        let mut drainer = test_drainer(r, Arc::clone(&buffer), OverflowPolicy::Drop);

        nix::unistd::write(&w, &vec![b'x'; 1024]).unwrap();
        drop(w);
        drainer.join();

        assert_eq!(drainer.bytes_transferred(), 1024);
        assert!(drainer.bytes_dropped() > 0);
        assert_eq!(
            drainer.bytes_transferred() - drainer.bytes_dropped(),
            buffer.available() as u64
        );
    }

    #[test]
    fn test_block_policy_preserves_bytes_when_consumer_resumes() {
        let (r, w) = pipe_pair();
        let buffer = Arc::new(RingBuffer::new(64));
        let mut drainer = test_drainer(r, Arc::clone(&buffer), OverflowPolicy::Block);

        let writer = std::thread::spawn(move || {
            nix::unistd::write(&w, &vec![b'y'; 1000]).unwrap();
            drop(w);
        });

        // Slow consumer: drain everything, verifying nothing is lost
        let mut total = 0usize;
        let mut out = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(5);
        while total < 1000 && Instant::now() < deadline {
            let n = buffer.read(&mut out);
            if n == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            total += n;
        }

        writer.join().unwrap();
        drainer.join();
        assert_eq!(total, 1000);
        assert_eq!(drainer.bytes_dropped(), 0);
    }

    #[test]
    fn test_cancellation_latency() {
        let (r, _w) = pipe_pair(); // held open, nothing to read
        let buffer = Arc::new(RingBuffer::new(1024));
        let mut drainer = test_drainer(r, buffer, OverflowPolicy::Block);

        let start = Instant::now();
        drainer.request_stop();
        drainer.join();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(!drainer.is_active());
    }
}
