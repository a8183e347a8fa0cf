//! TRIM submission seam.
//!
//! The discard manager hands each command piece to a [`TrimDevice`] together
//! with a [`TrimCompletion`]. Devices may complete inline (from inside
//! `submit_trim`) or later from another thread.

use lfs_error::{LfsError, Result};
use lfs_types::BlockAddr;
use parking_lot::Mutex;
use std::fmt;

/// One-shot completion callback for a submitted TRIM piece.
pub struct TrimCompletion {
    callback: Box<dyn FnOnce(Result<()>) + Send>,
}

impl TrimCompletion {
    pub fn new(callback: impl FnOnce(Result<()>) + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// Report the device result. Consumes the completion.
    pub fn complete(self, result: Result<()>) {
        (self.callback)(result);
    }
}

impl fmt::Debug for TrimCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrimCompletion").finish_non_exhaustive()
    }
}

/// Device that accepts TRIM (discard) requests.
pub trait TrimDevice: Send + Sync {
    /// Largest single request the device accepts, in blocks.
    fn max_discard_blocks(&self) -> u64;

    /// Submit a TRIM of `len` blocks at `start`.
    ///
    /// An `Err` return means the piece was never queued and `done` will not
    /// be called. On `Ok`, `done` is called exactly once.
    fn submit_trim(&self, start: BlockAddr, len: u64, done: TrimCompletion) -> Result<()>;
}

/// Completion behaviour of [`MemTrimDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimMode {
    /// Complete inside `submit_trim`.
    Immediate,
    /// Hold completions until [`MemTrimDevice::complete_held`].
    Deferred,
}

#[derive(Default)]
struct MemTrimState {
    trimmed: Vec<(u64, u64)>,
    held: Vec<(u64, u64, TrimCompletion)>,
    fail_with: Option<i32>,
    reject_submit: bool,
}

/// In-memory TRIM device recording every submitted piece.
pub struct MemTrimDevice {
    max_discard_blocks: u64,
    mode: Mutex<TrimMode>,
    state: Mutex<MemTrimState>,
}

impl MemTrimDevice {
    #[must_use]
    pub fn new(max_discard_blocks: u64, mode: TrimMode) -> Self {
        Self {
            max_discard_blocks,
            mode: Mutex::new(mode),
            state: Mutex::new(MemTrimState::default()),
        }
    }

    pub fn set_mode(&self, mode: TrimMode) {
        *self.mode.lock() = mode;
    }

    /// Complete subsequent pieces with `errno` instead of success.
    pub fn fail_completions_with(&self, errno: Option<i32>) {
        self.state.lock().fail_with = errno;
    }

    /// Refuse subsequent submissions outright.
    pub fn reject_submissions(&self, reject: bool) {
        self.state.lock().reject_submit = reject;
    }

    /// `(start, len)` of every piece accepted so far, in submission order.
    #[must_use]
    pub fn trimmed(&self) -> Vec<(u64, u64)> {
        self.state.lock().trimmed.clone()
    }

    #[must_use]
    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Complete every deferred piece. Returns how many were completed.
    pub fn complete_held(&self) -> usize {
        let (held, fail_with) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.held), state.fail_with)
        };
        let count = held.len();
        for (_, _, done) in held {
            done.complete(outcome(fail_with));
        }
        count
    }
}

fn outcome(fail_with: Option<i32>) -> Result<()> {
    match fail_with {
        Some(errno) => Err(LfsError::Io(std::io::Error::from_raw_os_error(errno))),
        None => Ok(()),
    }
}

impl fmt::Debug for MemTrimDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemTrimDevice")
            .field("max_discard_blocks", &self.max_discard_blocks)
            .field("mode", &*self.mode.lock())
            .finish_non_exhaustive()
    }
}

impl TrimDevice for MemTrimDevice {
    fn max_discard_blocks(&self) -> u64 {
        self.max_discard_blocks
    }

    fn submit_trim(&self, start: BlockAddr, len: u64, done: TrimCompletion) -> Result<()> {
        let mode = *self.mode.lock();
        let mut state = self.state.lock();
        if state.reject_submit {
            tracing::debug!(target: "lfs::block", start = start.0, len, "trim_submission_rejected");
            return Err(LfsError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }
        tracing::trace!(target: "lfs::block", start = start.0, len, ?mode, "trim_submitted");
        state.trimmed.push((start.0, len));
        match mode {
            TrimMode::Immediate => {
                let fail_with = state.fail_with;
                drop(state);
                done.complete(outcome(fail_with));
            }
            TrimMode::Deferred => state.held.push((start.0, len, done)),
        }
        Ok(())
    }
}
