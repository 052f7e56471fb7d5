//! Multiplexed stream handle and its per-stream state

use crate::multiplexer::MuxShared;
use crate::{lock, MuxError};
use burrow_proto::{Frame, StreamId, MAX_DATA_PAYLOAD};
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// State shared between a `MuxStream` and the connection's reader task
pub(crate) struct StreamState {
    id: StreamId,
    inner: Mutex<StreamInner>,
}

struct StreamInner {
    recv_buf: VecDeque<Bytes>,
    /// Credit the peer still holds for sending to us
    recv_window: u32,
    /// Bytes handed to the reader but not yet returned to the peer
    unacked: u32,
    send_window: u32,
    read_closed: bool,
    write_closed: bool,
    reset: bool,
    transport_closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamState {
    pub(crate) fn new(id: StreamId, window: u32) -> Self {
        Self {
            id,
            inner: Mutex::new(StreamInner {
                recv_buf: VecDeque::new(),
                recv_window: window,
                unacked: 0,
                send_window: window,
                read_closed: false,
                write_closed: false,
                reset: false,
                transport_closed: false,
                read_waker: None,
                write_waker: None,
            }),
        }
    }

    /// Queue data received from the peer
    pub(crate) fn push_data(&self, data: Bytes) -> Result<(), MuxError> {
        let mut inner = lock(&self.inner);
        let len = data.len() as u32;
        if len > inner.recv_window {
            return Err(MuxError::WindowExceeded(self.id));
        }
        inner.recv_window -= len;

        // Late data after a local reset or remote FIN is dropped
        if inner.reset || inner.read_closed {
            return Ok(());
        }

        inner.recv_buf.push_back(data);
        let waker = inner.read_waker.take();
        drop(inner);
        wake(waker);
        Ok(())
    }

    pub(crate) fn add_send_credit(&self, increment: u32) {
        let mut inner = lock(&self.inner);
        inner.send_window = inner.send_window.saturating_add(increment);
        let waker = inner.write_waker.take();
        drop(inner);
        wake(waker);
    }

    /// Peer half-closed; returns true if both directions are now finished
    pub(crate) fn remote_fin(&self) -> bool {
        let mut inner = lock(&self.inner);
        inner.read_closed = true;
        let done = inner.write_closed;
        let waker = inner.read_waker.take();
        drop(inner);
        wake(waker);
        done
    }

    pub(crate) fn remote_reset(&self) {
        let mut inner = lock(&self.inner);
        inner.reset = true;
        let wakers = (inner.read_waker.take(), inner.write_waker.take());
        drop(inner);
        wake(wakers.0);
        wake(wakers.1);
    }

    pub(crate) fn transport_closed(&self) {
        let mut inner = lock(&self.inner);
        inner.transport_closed = true;
        let wakers = (inner.read_waker.take(), inner.write_waker.take());
        drop(inner);
        wake(wakers.0);
        wake(wakers.1);
    }
}

fn wake(waker: Option<Waker>) {
    if let Some(waker) = waker {
        waker.wake();
    }
}

/// One logical byte stream inside a `Multiplexer`
///
/// Reads return buffered data, then EOF after the peer's FIN. `shutdown` sends
/// FIN; the read side stays open. Dropping a stream that has not finished in
/// both directions resets it.
pub struct MuxStream {
    id: StreamId,
    state: Arc<StreamState>,
    shared: Arc<MuxShared>,
}

impl MuxStream {
    pub(crate) fn new(id: StreamId, state: Arc<StreamState>, shared: Arc<MuxShared>) -> Self {
        Self { id, state, shared }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Abort the stream in both directions
    pub fn reset(self) {
        self.reset_local();
    }

    fn reset_local(&self) {
        let mut inner = lock(&self.state.inner);
        let finished = inner.reset
            || inner.transport_closed
            || (inner.read_closed && inner.write_closed);
        inner.reset = true;
        drop(inner);

        if !finished {
            let _ = self.shared.send_frame(Frame::rst(self.id));
        }
        self.shared.remove_stream(self.id);
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = lock(&this.state.inner);

        if !inner.recv_buf.is_empty() {
            let mut read = 0usize;
            while buf.remaining() > 0 {
                let Some(chunk) = inner.recv_buf.front_mut() else {
                    break;
                };
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n == chunk.len() {
                    inner.recv_buf.pop_front();
                } else {
                    chunk.advance(n);
                }
                read += n;
            }

            inner.unacked += read as u32;
            let credit = if inner.unacked >= this.shared.window_size / 2
                && !inner.read_closed
                && !inner.reset
            {
                let credit = inner.unacked;
                inner.unacked = 0;
                inner.recv_window += credit;
                Some(credit)
            } else {
                None
            };
            drop(inner);

            if let Some(credit) = credit {
                let _ = this
                    .shared
                    .send_frame(Frame::window_update(this.id, credit));
            }
            return Poll::Ready(Ok(()));
        }

        // A FIN already delivered everything; a reset after it only ends writes
        if inner.read_closed {
            return Poll::Ready(Ok(()));
        }
        if inner.reset {
            return Poll::Ready(Err(MuxError::StreamReset(this.id).into()));
        }
        if inner.transport_closed {
            return Poll::Ready(Err(MuxError::TransportClosed.into()));
        }

        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut inner = lock(&this.state.inner);
        if inner.reset {
            return Poll::Ready(Err(MuxError::StreamReset(this.id).into()));
        }
        if inner.transport_closed {
            return Poll::Ready(Err(MuxError::TransportClosed.into()));
        }
        if inner.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if inner.send_window == 0 {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf
            .len()
            .min(inner.send_window as usize)
            .min(MAX_DATA_PAYLOAD);
        inner.send_window -= n as u32;
        drop(inner);

        this.shared
            .send_frame(Frame::data(this.id, Bytes::copy_from_slice(&buf[..n])))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the writer task
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = lock(&this.state.inner);
        if inner.write_closed || inner.reset || inner.transport_closed {
            return Poll::Ready(Ok(()));
        }
        inner.write_closed = true;
        let done = inner.read_closed;
        drop(inner);

        this.shared.send_frame(Frame::fin(this.id))?;
        if done {
            this.shared.remove_stream(this.id);
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.reset_local();
    }
}

impl fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxStream").field("id", &self.id).finish()
    }
}
