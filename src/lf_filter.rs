//! Stream adapters for CR-only instruments.
//!
//! Some instruments terminate every line with a bare CR and reject (or choke
//! on) LF bytes. These adapters sit between such a device and a line reader
//! that expects LF-terminated input: [`NoLfWriter`] drops every LF on the way
//! out, and [`AddLfReader`] synthesises an LF after each CR on the way in.
//! Composed together they let the CRLF line framer drive a CR-only port
//! unchanged.
//!
//! Each adapter passes the opposite direction through untouched, so
//! `AddLfReader::new(NoLfWriter::new(stream))` is a full bidirectional
//! adapter.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Writer adapter that removes LF bytes from the outgoing stream.
pub struct NoLfWriter<S> {
    inner: S,
    pending: Vec<u8>,
}

impl<S> NoLfWriter<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    /// Drives buffered filtered bytes into the inner writer.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>
    where
        S: AsyncWrite + Unpin,
    {
        while !self.pending.is_empty() {
            let n = match Pin::new(&mut self.inner).poll_write(cx, &self.pending) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Ready(Ok(n)) => n,
            };
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.drain(..n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for NoLfWriter<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Pending => return Poll::Pending,
        }
        this.pending.extend(buf.iter().copied().filter(|&b| b != b'\n'));
        // The caller's bytes are accepted in full; the filtered remainder is
        // flushed on the next write or flush.
        let _ = this.poll_drain(cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for NoLfWriter<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

/// Reader adapter that inserts an LF after every CR read from the inner
/// stream.
pub struct AddLfReader<S> {
    inner: S,
    queued: VecDeque<u8>,
}

impl<S> AddLfReader<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            queued: VecDeque::new(),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AddLfReader<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.queued.is_empty() {
            let mut tmp = [0u8; 256];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Ready(Ok(())) => {}
            }
            let filled = tmp_buf.filled();
            if filled.is_empty() {
                // EOF
                return Poll::Ready(Ok(()));
            }
            for &b in filled {
                this.queued.push_back(b);
                if b == b'\r' {
                    this.queued.push_back(b'\n');
                }
            }
        }

        while buf.remaining() > 0 {
            match this.queued.pop_front() {
                Some(b) => buf.put_slice(&[b]),
                None => break,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AddLfReader<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Wraps a stream so that a CRLF-based line framer can drive a CR-only
/// device.
pub fn adapt_cr_stream<S: AsyncRead + AsyncWrite + Unpin>(stream: S) -> AddLfReader<NoLfWriter<S>> {
    AddLfReader::new(NoLfWriter::new(stream))
}
