//! Per-connection write lock
//!
//! Both workers of a connection may write (the reader echoes keystrokes or
//! answers pings while the drain worker flushes the mailbox), so every write
//! goes through one async mutex and a frame is always written whole.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::frame::{encode_frame, OpCode};

/// Cloneable handle serializing writes to one connection
#[derive(Debug)]
pub struct SharedWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for SharedWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin> SharedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Write and flush raw bytes
    pub async fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Write one complete unmasked frame
    pub async fn send_frame(&self, opcode: OpCode, payload: &[u8]) -> io::Result<()> {
        self.write_all(&encode_frame(opcode, payload)).await
    }

    /// Shut down the write side
    pub async fn shutdown(&self) -> io::Result<()> {
        self.inner.lock().await.shutdown().await
    }
}
