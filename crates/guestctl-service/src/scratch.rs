use guestctl_proto::msg::MAX_TRANSFER_SIZE;
use guestctl_proto::{ErrorCode, Result};

/// Reusable receive buffer for variable-length message bodies and file reads.
#[derive(Debug)]
pub struct ScratchBuffer {
    buf: Vec<u8>,
    grows: u32,
}

impl ScratchBuffer {
    pub const INITIAL_SIZE: usize = 64 * 1024;

    pub fn new() -> Self {
        ScratchBuffer {
            buf: vec![0; Self::INITIAL_SIZE],
            grows: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// How often the buffer had to be enlarged.
    pub fn grows(&self) -> u32 {
        self.grows
    }

    /// Doubles the buffer until `needed` bytes fit, never past the transfer
    /// limit.
    pub fn ensure_capacity(&mut self, needed: usize) -> Result<()> {
        if needed <= self.buf.len() {
            return Ok(());
        }
        if needed > MAX_TRANSFER_SIZE {
            return Err(ErrorCode::TooMuchData);
        }
        let target = grown_size(self.buf.len(), needed);
        self.buf
            .try_reserve_exact(target - self.buf.len())
            .map_err(|_| ErrorCode::NoMemory)?;
        self.buf.resize(target, 0);
        self.grows += 1;
        tracing::debug!("scratch buffer grown to {} bytes", target);
        Ok(())
    }

    pub fn as_mut_slice(&mut self, len: usize) -> &mut [u8] {
        let len = len.min(self.buf.len());
        &mut self.buf[..len]
    }
}

fn grown_size(current: usize, needed: usize) -> usize {
    let mut size = current.max(1);
    while size < needed {
        size = size.saturating_mul(2);
    }
    size.min(MAX_TRANSFER_SIZE)
}

impl Default for ScratchBuffer {
    fn default() -> Self {
        Self::new()
    }
}
