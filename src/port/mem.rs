//! RAM-backed port for host tests and board bring-up.
//!
//! The backing store is shared behind `Arc<Mutex<_>>` so a test can keep an
//! alias to the "media" while the store owns the port: corrupt a byte, zero
//! a region, then remount and watch the recovery path run. Write faults can
//! be injected to exercise rollback.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::{NvmError, NvmPort, PortResult};

struct MemBacking {
    cells: Vec<u8>,
    millis: u32,
    /// Countdown until the next write fails; `None` disables injection.
    fail_writes_after: Option<u32>,
}

/// In-memory NVM device with a millisecond tick per transport call.
#[derive(Clone)]
pub struct MemNvm {
    inner: Arc<Mutex<MemBacking>>,
}

impl MemNvm {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemBacking {
                cells: vec![0u8; size],
                millis: 0,
                fail_writes_after: None,
            })),
        }
    }

    /// XOR one media byte, bypassing the port interface.
    pub fn corrupt(&self, offset: u32, mask: u8) {
        let mut inner = self.inner.lock();
        inner.cells[offset as usize] ^= mask;
    }

    /// Overwrite a media range with a fill byte, bypassing the port.
    pub fn fill(&self, offset: u32, len: usize, value: u8) {
        let mut inner = self.inner.lock();
        let start = offset as usize;
        inner.cells[start..start + len].fill(value);
    }

    /// Copy of a media range, bypassing the port.
    pub fn snapshot(&self, offset: u32, len: usize) -> Vec<u8> {
        let inner = self.inner.lock();
        let start = offset as usize;
        inner.cells[start..start + len].to_vec()
    }

    /// Let the next `n` writes succeed, then fail every write until
    /// [`Self::clear_write_faults`].
    pub fn fail_writes_after(&self, n: u32) {
        self.inner.lock().fail_writes_after = Some(n);
    }

    pub fn clear_write_faults(&self) {
        self.inner.lock().fail_writes_after = None;
    }

    /// Advance the fake clock.
    pub fn advance_millis(&self, millis: u32) {
        self.inner.lock().millis += millis;
    }
}

impl NvmPort for MemNvm {
    fn nvm_init(&mut self) -> PortResult {
        Ok(())
    }

    fn nvm_read(&mut self, offset: u32, dst: &mut [u8]) -> PortResult {
        let mut inner = self.inner.lock();
        inner.millis += 1;
        let start = offset as usize;
        let end = start.checked_add(dst.len()).ok_or(NvmError(-1))?;
        if end > inner.cells.len() {
            return Err(NvmError(-1));
        }
        dst.copy_from_slice(&inner.cells[start..end]);
        Ok(())
    }

    fn nvm_write(&mut self, offset: u32, src: &[u8]) -> PortResult {
        let mut inner = self.inner.lock();
        inner.millis += 1;
        if let Some(left) = inner.fail_writes_after {
            if left == 0 {
                return Err(NvmError(-5));
            }
            inner.fail_writes_after = Some(left - 1);
        }
        let start = offset as usize;
        let end = start.checked_add(src.len()).ok_or(NvmError(-1))?;
        if end > inner.cells.len() {
            return Err(NvmError(-1));
        }
        inner.cells[start..end].copy_from_slice(src);
        Ok(())
    }

    fn time_seconds(&self) -> u32 {
        self.inner.lock().millis / 1000
    }

    fn time_millis(&self) -> u32 {
        self.inner.lock().millis
    }
}
