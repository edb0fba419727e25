//! Per-direction socket context
//!
//! One end of a tunnel. Read and write are tracked independently:
//!
//! ```text
//!              busy                  done           stop
//!  readable  | waiting for data    | have data    | idle
//!  writable  | write in flight     | write done   | idle
//! ```
//!
//! `dead` is terminal; a closed context never transitions again. The
//! handshake phase uses the fixed internal buffer with discrete reads
//! (one read, then nothing until its bytes are written out); the
//! idle timer is armed on every I/O initiation and expiry surfaces as
//! [`ProxyError::Timeout`].

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use ssrlocal_core::{ProxyError, Result, SSR_BUFF_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    Stop,
    Busy,
    Done,
    Dead,
}

pub struct SocketCtx<S> {
    stream: Option<S>,
    pub(crate) rdstate: IoState,
    pub(crate) wrstate: IoState,
    idle_timeout: Duration,
    buf: Box<[u8]>,
    nread: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SocketCtx<S> {
    pub fn new(stream: S, idle_timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            rdstate: IoState::Stop,
            wrstate: IoState::Stop,
            idle_timeout,
            buf: vec![0u8; SSR_BUFF_SIZE].into_boxed_slice(),
            nread: 0,
        }
    }

    /// One discrete read into the fixed buffer. EOF is an error here;
    /// the UDP-ASSOCIATE wait state treats it as informational at the
    /// call site.
    pub async fn read(&mut self) -> Result<usize> {
        debug_assert_eq!(self.rdstate, IoState::Stop);
        self.rdstate = IoState::Busy;
        let stream = self.stream.as_mut().ok_or(ProxyError::Eof)?;
        let n = match timeout(self.idle_timeout, stream.read(&mut self.buf)).await {
            Err(_) => {
                self.rdstate = IoState::Stop;
                return Err(ProxyError::Timeout);
            }
            Ok(Err(e)) => {
                self.rdstate = IoState::Stop;
                return Err(e.into());
            }
            Ok(Ok(n)) => n,
        };
        if n == 0 {
            self.rdstate = IoState::Stop;
            return Err(ProxyError::Eof);
        }
        self.rdstate = IoState::Done;
        self.nread = n;
        Ok(n)
    }

    /// Bytes of the last completed read.
    pub fn data(&self) -> &[u8] {
        debug_assert_eq!(self.rdstate, IoState::Done);
        &self.buf[..self.nread]
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        debug_assert!(matches!(self.wrstate, IoState::Stop | IoState::Done));
        self.wrstate = IoState::Busy;
        let stream = self.stream.as_mut().ok_or(ProxyError::Eof)?;
        match timeout(self.idle_timeout, stream.write_all(data)).await {
            Err(_) => {
                self.wrstate = IoState::Stop;
                Err(ProxyError::Timeout)
            }
            Ok(Err(e)) => {
                self.wrstate = IoState::Stop;
                Err(e.into())
            }
            Ok(Ok(())) => {
                self.wrstate = IoState::Done;
                Ok(())
            }
        }
    }

    /// Close: mark both halves dead and drop the handle.
    pub fn close(&mut self) {
        debug_assert_ne!(self.rdstate, IoState::Dead);
        debug_assert_ne!(self.wrstate, IoState::Dead);
        self.rdstate = IoState::Dead;
        self.wrstate = IoState::Dead;
        self.stream = None;
    }

    /// Hand the raw stream to the proxy phase.
    pub fn into_stream(mut self) -> Option<S> {
        self.stream.take()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_write_state_pairs() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut ctx = SocketCtx::new(client, Duration::from_secs(1));
        assert_eq!(ctx.rdstate, IoState::Stop);
        assert_eq!(ctx.wrstate, IoState::Stop);

        server.write_all(b"hello").await.unwrap();
        let n = ctx.read().await.unwrap();
        assert_eq!(ctx.rdstate, IoState::Done);
        assert_eq!(ctx.data(), b"hello");
        assert_eq!(n, 5);
        ctx.rdstate = IoState::Stop;

        ctx.write(b"world").await.unwrap();
        assert_eq!(ctx.wrstate, IoState::Done);
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_idle_timeout_on_read() {
        let (client, _server) = tokio::io::duplex(256);
        let mut ctx = SocketCtx::new(client, Duration::from_millis(20));
        assert!(matches!(ctx.read().await, Err(ProxyError::Timeout)));
    }

    #[tokio::test]
    async fn test_eof_surfaces() {
        let (client, server) = tokio::io::duplex(256);
        drop(server);
        let mut ctx = SocketCtx::new(client, Duration::from_secs(1));
        assert!(matches!(ctx.read().await, Err(ProxyError::Eof)));
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let (client, _server) = tokio::io::duplex(256);
        let mut ctx = SocketCtx::new(client, Duration::from_secs(1));
        ctx.close();
        assert_eq!(ctx.rdstate, IoState::Dead);
        assert_eq!(ctx.wrstate, IoState::Dead);
        assert!(ctx.into_stream().is_none());
    }
}
