//! Inbound connection dispatcher.
//!
//! [`Server`] accepts sockets, frames packets exactly like the client's
//! read path, and hands each one to a [`PacketHandler`] — the single
//! point where application semantics enter. Replies go back through the
//! connection's outbound buffer, drained by a per-connection write loop.
//!
//! Tiger Style: the accept loop distinguishes transient socket errors
//! (log and keep accepting) from listener-level faults (stop or
//! propagate); a connection's reply buffer is bounded by parking the
//! read loop at the 64 KiB soft cap so a slow consumer cannot buffer
//! without bound.

use std::io;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::constants::{HEADER_LEN, OUTBOUND_SOFT_CAP, READ_BUFFER_SIZE, WRITE_DRAIN_TIMEOUT};
use crate::error::NetError;
use crate::frame;
use crate::packet::Header;
use crate::socket::configure_stream;

/// Capability implemented by the node that interprets packets.
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    /// Handle one inbound frame. `body` holds exactly `header.len` bytes.
    /// Replies go through [`ServerConnection::send_packet`]. An error is
    /// fatal for the connection that carried the frame.
    async fn handle_packet(
        &self,
        conn: &ServerConnection,
        header: Header,
        body: Bytes,
    ) -> anyhow::Result<()>;
}

/// One accepted connection, shared with the node capability.
pub struct ServerConnection {
    peer: SocketAddr,
    outbound: Mutex<BytesMut>,
    /// Notified after each flush; releases the read loop's backpressure.
    write_event: Notify,
    /// Notified after each append; wakes the write loop to flush.
    writer_event: Notify,
}

impl ServerConnection {
    /// The remote endpoint of this connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Append a reply frame and nudge the write loop to flush.
    pub fn send_packet(&self, header: &Header, body: &[u8]) {
        debug_assert_eq!(header.len as usize, body.len());
        {
            let mut buf = self.outbound.lock();
            buf.reserve(HEADER_LEN + body.len());
            header.encode(&mut *buf);
            buf.put_slice(body);
        }
        self.writer_event.notify_one();
    }

    fn buffered(&self) -> usize {
        self.outbound.lock().len()
    }
}

/// Accept loop plus per-connection dispatch for one listener.
pub struct Server<H> {
    handler: Arc<H>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl<H: PacketHandler> Server<H> {
    /// Server dispatching to `handler`.
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Accept connections until cancellation or a fatal listener error.
    ///
    /// Transient per-connection failures (reset, aborted, out of memory,
    /// interrupted) are logged and accepting continues; a closed listener
    /// stops the loop cleanly; anything else propagates.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), NetError> {
        info!(local = ?listener.local_addr().ok(), "server listening");
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("server cancelled; closing listener");
                    break;
                }
                res = listener.accept() => match res {
                    Ok(pair) => pair,
                    Err(err) if is_transient_accept_error(&err) => {
                        warn!(error = %err, "transient accept failure");
                        continue;
                    }
                    Err(err) if is_listener_closed(&err) => {
                        debug!(error = %err, "listener no longer accepting");
                        break;
                    }
                    Err(err) => return Err(NetError::Io(err)),
                },
            };
            if let Err(err) = configure_stream(&stream) {
                warn!(%peer, error = %err, "failed to set socket options");
                continue;
            }
            let handler = Arc::clone(&self.handler);
            let conn_cancel = self.cancel.child_token();
            self.tracker.spawn(async move {
                match serve_connection(stream, peer, handler, conn_cancel).await {
                    Ok(()) => debug!(%peer, "connection closed"),
                    Err(err) => debug!(%peer, error = %err, "connection ended with error"),
                }
            });
        }
        Ok(())
    }

    /// Stop accepting, cancel every connection, and wait for them all.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Accept failures worth logging and carrying on from: per-connection
/// teardown races and resource pressure rather than listener faults.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    )
}

fn is_listener_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::InvalidInput
    )
}

/// Paired read/write loops for one accepted socket, symmetric to the
/// client's post-connect path: write loop on its own task, read loop
/// inline; when the read loop returns the pair token is cancelled and
/// the writer drains before exit.
async fn serve_connection<H: PacketHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    cancel: CancellationToken,
) -> Result<(), NetError> {
    debug!(%peer, "accepted connection");
    let (read_half, write_half) = stream.into_split();
    let conn = Arc::new(ServerConnection {
        peer,
        outbound: Mutex::new(BytesMut::new()),
        write_event: Notify::new(),
        writer_event: Notify::new(),
    });

    let writer = {
        let conn = Arc::clone(&conn);
        let cancel = cancel.clone();
        tokio::spawn(async move { write_loop(conn, write_half, cancel).await })
    };
    let result = read_loop(read_half, &conn, handler.as_ref(), &cancel).await;
    cancel.cancel();
    match writer.await {
        Ok(_) => {}
        Err(err) => warn!(%peer, error = %err, "write loop panicked"),
    }
    result
}

/// Frame inbound packets and dispatch them to the handler. Before each
/// dispatch the loop parks while the connection's reply buffer is over
/// the soft cap, so upstream slowness backpressures the peer instead of
/// growing the buffer.
async fn read_loop<H: PacketHandler>(
    mut reader: OwnedReadHalf,
    conn: &Arc<ServerConnection>,
    handler: &H,
    cancel: &CancellationToken,
) -> Result<(), NetError> {
    let mut fifo = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        let Some(header) = frame::read_header(&mut reader, &mut fifo, cancel).await? else {
            return Ok(());
        };
        let body = frame::read_body(&mut reader, &mut fifo, header.len as usize, cancel).await?;

        loop {
            let mut notified = pin!(conn.write_event.notified());
            notified.as_mut().enable();
            if conn.buffered() <= OUTBOUND_SOFT_CAP {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(NetError::Cancelled),
                _ = &mut notified => {}
            }
        }

        handler
            .handle_packet(conn, header, body)
            .await
            .map_err(NetError::Handler)?;
    }
}

/// Drain the connection's reply buffer to the socket. Unlike the client,
/// the buffer is copied out and cleared in place so its capacity is
/// retained across replies.
///
/// As in the client's write loop, cancellation is never raced against a
/// whole `write_all`: the scratch goes out through plain `write` calls,
/// and on cancellation the unwritten tail is requeued at the front of
/// the reply buffer for the bounded final drain.
async fn write_loop(
    conn: Arc<ServerConnection>,
    mut writer: OwnedWriteHalf,
    cancel: CancellationToken,
) -> Result<(), NetError> {
    let mut scratch = Vec::new();
    'serve: loop {
        let notified = conn.writer_event.notified();
        if drain_into(&conn, &mut scratch) {
            let mut written = 0;
            while written < scratch.len() {
                tokio::select! {
                    biased;
                    res = writer.write(&scratch[written..]) => {
                        let n = res?;
                        if n == 0 {
                            return Err(NetError::Io(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "socket closed while draining",
                            )));
                        }
                        written += n;
                    }
                    _ = cancel.cancelled() => {
                        requeue_front(&conn, &scratch[written..]);
                        break 'serve;
                    }
                }
            }
            conn.write_event.notify_waiters();
        } else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = notified => {}
            }
        }
    }
    if drain_into(&conn, &mut scratch) {
        let _ = tokio::time::timeout(WRITE_DRAIN_TIMEOUT, writer.write_all(&scratch)).await;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

fn drain_into(conn: &ServerConnection, scratch: &mut Vec<u8>) -> bool {
    let mut buf = conn.outbound.lock();
    if buf.is_empty() {
        return false;
    }
    scratch.clear();
    scratch.extend_from_slice(&buf);
    buf.clear();
    true
}

/// Put an unwritten tail back at the front of the reply buffer, ahead of
/// anything the handler appended since the scratch was drained.
fn requeue_front(conn: &ServerConnection, tail: &[u8]) {
    if tail.is_empty() {
        return;
    }
    let mut buf = conn.outbound.lock();
    if buf.is_empty() {
        buf.put_slice(tail);
    } else {
        let mut merged = BytesMut::with_capacity(tail.len() + buf.len());
        merged.put_slice(tail);
        merged.put_slice(&buf[..]);
        *buf = merged;
    }
}
