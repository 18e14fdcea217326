use std::sync::Mutex;

use bytes::BytesMut;
use tracing::{debug, trace};

/// Recycles serialization buffers for outgoing messages. Payloads shared between several
///  recipients are returned here once the last recipient has consumed them.
pub struct BufferPool {
    buf_size: usize,
    max_pool_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            max_pool_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_from_pool(&self) -> BytesMut {
        if let Ok(mut buffers) = self.buffers.lock() {
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        buffer.clear();

        if let Ok(mut buffers) = self.buffers.lock() {
            if buffers.len() < self.max_pool_size {
                trace!("returning buffer to pool");
                buffers.push(buffer);
                return;
            }
        }
        debug!("pool is full: discarding returned buffer");
    }

    pub fn num_pooled(&self) -> usize {
        self.buffers.lock()
            .map(|b| b.len())
            .unwrap_or_default()
    }
}
