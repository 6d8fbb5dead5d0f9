//! Six-channel pipe set with parent/child endpoint discipline
//!
//! Each channel gets a unidirectional pipe. The parent keeps the write ends
//! of stdin/stddati and the read ends of the four output channels; the child
//! keeps the inverse. After spawn each side closes the endpoints it does not
//! own, otherwise EOF never propagates.

use crate::error::{Error, Result};
use crate::stream::ChannelIndex;
use nix::fcntl::OFlag;
use nix::unistd;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

/// Read/write endpoint pair per channel, held as options so that `close`
/// is idempotent and partially torn-down sets stay valid.
pub struct PipeSet {
    read_ends: [Option<OwnedFd>; 6],
    write_ends: [Option<OwnedFd>; 6],
}

impl PipeSet {
    /// Create all six pipes with close-on-exec set on every endpoint.
    /// Descriptors 0..5 are installed in the child by `dup2`, which clears
    /// the flag on the duplicate; the originals vanish at exec.
    pub fn create() -> Result<Self> {
        let mut read_ends: [Option<OwnedFd>; 6] = Default::default();
        let mut write_ends: [Option<OwnedFd>; 6] = Default::default();

        for channel in ChannelIndex::ALL {
            let (r, w) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| {
                Error::PipeCreateFailed {
                    channel,
                    source: e,
                }
            })?;
            read_ends[channel.as_index()] = Some(r);
            write_ends[channel.as_index()] = Some(w);
        }

        Ok(Self {
            read_ends,
            write_ends,
        })
    }

    /// Parent-owned endpoint of an output channel (its read end).
    pub fn parent_read_end(&self, channel: ChannelIndex) -> Option<BorrowedFd<'_>> {
        debug_assert!(channel.is_child_write());
        self.read_ends[channel.as_index()].as_ref().map(|fd| fd.as_fd())
    }

    /// Parent-owned endpoint of an input channel (its write end).
    pub fn parent_write_end(&self, channel: ChannelIndex) -> Option<BorrowedFd<'_>> {
        debug_assert!(channel.is_child_read());
        self.write_ends[channel.as_index()].as_ref().map(|fd| fd.as_fd())
    }

    /// Move an output channel's read end out of the set, transferring
    /// ownership (to a drainer).
    pub fn take_parent_read_end(&mut self, channel: ChannelIndex) -> Option<OwnedFd> {
        debug_assert!(channel.is_child_write());
        self.read_ends[channel.as_index()].take()
    }

    /// Close the parent's write end of an input channel, signalling EOF to
    /// the child. Idempotent.
    pub fn close_parent_write_end(&mut self, channel: ChannelIndex) {
        debug_assert!(channel.is_child_read());
        self.write_ends[channel.as_index()].take();
    }

    /// Child-side raw tokens for channels 3..5, for the handle-map contract
    /// on hosts that cannot inherit numeric descriptors.
    pub fn child_token(&self, channel: ChannelIndex) -> Option<u64> {
        let fd = if channel.is_child_read() {
            self.read_ends[channel.as_index()].as_ref()
        } else {
            self.write_ends[channel.as_index()].as_ref()
        };
        fd.map(|fd| fd.as_raw_fd() as u64)
    }

    /// Duplicate child-owned endpoints onto numeric descriptors 0..5 and
    /// close every original. Runs in the child between fork and exec.
    pub fn setup_child(&mut self) -> std::result::Result<(), nix::Error> {
        use nix::fcntl::{fcntl, FcntlArg};
        use std::os::fd::FromRawFd;

        // Drop the parent-owned endpoints first; the child must not hold
        // them or EOF never reaches the parent's drainers.
        for channel in ChannelIndex::ALL {
            let idx = channel.as_index();
            if channel.is_child_read() {
                self.write_ends[idx].take();
            } else {
                self.read_ends[idx].take();
            }
        }

        // Any endpoint numerically inside the 0..5 target range would be
        // clobbered mid-loop; move those above it before installing.
        let mut sources: [Option<OwnedFd>; 6] = Default::default();
        for channel in ChannelIndex::ALL {
            let idx = channel.as_index();
            let fd = if channel.is_child_read() {
                self.read_ends[idx].take()
            } else {
                self.write_ends[idx].take()
            };
            let fd = match fd {
                Some(fd) => fd,
                None => continue,
            };
            if fd.as_raw_fd() < 6 {
                let moved = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(16))?;
                sources[idx] = Some(unsafe { OwnedFd::from_raw_fd(moved) });
            } else {
                sources[idx] = Some(fd);
            }
        }

        // dup2 clears close-on-exec on the installed descriptor, so 0..5
        // survive the exec while every original closes.
        for (idx, source) in sources.iter().enumerate() {
            if let Some(fd) = source {
                unistd::dup2(fd.as_raw_fd(), idx as i32)?;
            }
        }
        Ok(())
    }

    /// Close child-owned endpoints in the parent after fork. Without this
    /// the parent holds write ends open and drainers never see EOF.
    pub fn setup_parent(&mut self) {
        for channel in ChannelIndex::ALL {
            let idx = channel.as_index();
            if channel.is_child_read() {
                self.read_ends[idx].take();
            } else {
                self.write_ends[idx].take();
            }
        }
    }

    /// All six channels were created and not yet torn down on the standard
    /// trio.
    pub fn is_valid(&self) -> bool {
        self.write_ends[0].is_some()
            && self.read_ends[1].is_some()
            && self.read_ends[2].is_some()
    }

    /// Close every endpoint still held. Idempotent.
    pub fn close(&mut self) {
        for idx in 0..6 {
            self.read_ends[idx].take();
            self.write_ends[idx].take();
        }
    }
}

impl Drop for PipeSet {
    fn drop(&mut self) {
        self.close();
    }
}
