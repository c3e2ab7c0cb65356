//! The transport abstraction: the connection layer talks to
//! `dyn Stream`/`impl Stream` rather than any concrete socket type, so TLS, plain TCP,
//! `tokio::io::duplex` halves used in tests, or anything else that implements
//! [`tokio::io::AsyncRead`] + [`tokio::io::AsyncWrite`] can sit underneath it. This
//! crate carries no TLS dependency of its own as a result.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A bidirectional byte stream, as consumed by [`crate::connection::Connection`].
///
/// Methods are declared with an explicit `impl Future<..> + Send` return instead of
/// plain `async fn` so that generic code holding a `S: Stream + Send` (e.g.
/// [`crate::connection::Connection::into_message_stream`], which hands the whole
/// connection to `tokio::spawn`) can rely on the resulting futures being `Send` too.
/// Bare `async fn` in a trait doesn't carry that guarantee for a generic caller.
pub trait Stream: Send {
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
    fn read_exact(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<()>> + Send;
    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Best-effort liveness check; a `false` result is not itself an error, merely a
    /// hint the connection layer uses to short-circuit further reads/writes.
    fn connected(&self) -> bool {
        true
    }

    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        AsyncReadExt::read(self, buf).await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        AsyncReadExt::read_exact(self, buf).await?;
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        AsyncWriteExt::write_all(self, buf).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        AsyncWriteExt::flush(self).await
    }

    async fn close(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(self).await
    }
}
