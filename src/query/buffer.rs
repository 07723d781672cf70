//! Capacity-checked byte buffer for per-connection I/O.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("buffer overflow: {needed} bytes needed, {available} available")]
pub struct BufferError {
    pub needed: usize,
    pub available: usize,
}

/// A byte queue that never grows past its capacity.
#[derive(Debug)]
pub struct BoundedBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl BoundedBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.data.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes that can still be appended.
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append all of `bytes`, or nothing if they do not fit.
    pub fn try_extend(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        if bytes.len() > self.remaining() {
            return Err(BufferError {
                needed: bytes.len(),
                available: self.remaining(),
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Drop the first `n` bytes, moving the rest to the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Length of the first newline-terminated line, excluding the newline.
    pub fn find_line(&self) -> Option<usize> {
        self.data.iter().position(|&b| b == b'\n')
    }
}
