//! Decode-target buffers.
//!
//! Sized to the worker count so every concurrent decode has its own buffer.
//! Acquiring from an exhausted pool blocks until a buffer is returned.

use std::ops::{Deref, DerefMut};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};

pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    returned: Condvar,
    buffer_bytes: usize,
    capacity: usize,
}

impl BufferPool {
    pub fn new(count: usize, buffer_bytes: usize) -> Self {
        let buffers = (0..count).map(|_| BytesMut::zeroed(buffer_bytes)).collect();
        Self {
            buffers: Mutex::new(buffers),
            returned: Condvar::new(),
            buffer_bytes,
            capacity: count,
        }
    }

    /// Take a buffer, waiting for one if all are in use.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let mut buffers = self.buffers.lock();
        loop {
            if let Some(buf) = buffers.pop() {
                return PooledBuffer {
                    pool: self,
                    buf: Some(buf),
                };
            }
            self.returned.wait(&mut buffers);
        }
    }

    /// Take a buffer if one is idle.
    pub fn try_acquire(&self) -> Option<PooledBuffer<'_>> {
        self.buffers.lock().pop().map(|buf| PooledBuffer {
            pool: self,
            buf: Some(buf),
        })
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }
}

/// A buffer checked out of a [`BufferPool`]; returned on drop.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Option<BytesMut>,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.buffers.lock().push(buf);
            self.pool.returned.notify_one();
        }
    }
}
