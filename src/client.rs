//! Outbound connection pool with nonce-correlated RPC.
//!
//! A [`Client`] is bound to one remote peer and grows a pool of TCP
//! connections toward a target capacity on demand. Writers append frames
//! to a shared outbound buffer under a 64 KiB soft cap; each live
//! connection runs a paired read/write loop, and response frames are
//! routed back to awaiting requests through the [`RpcTable`].
//!
//! Connection attempts are serialized through a connect mutex so
//! concurrent attempts observe the circuit breaker in order. The breaker
//! refuses attempts while open and inserts an exponential pre-connect
//! delay while failures are outstanding, so a flapping peer sees one
//! paced dialer instead of a thundering herd.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::address::PeerAddr;
use crate::breaker::{now_ms, BreakerState, CircuitBreaker};
use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_POOL_CAPACITY, HEADER_LEN, MAX_FRAME_LEN, OUTBOUND_SOFT_CAP,
    READ_BUFFER_SIZE, WRITE_DRAIN_TIMEOUT,
};
use crate::error::{NetError, WireError};
use crate::frame;
use crate::packet::{Header, Op, Tag};
use crate::rpc::RpcTable;
use crate::socket::configure_stream;

/// Tunables for a client pool.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Number of connections the pool grows toward. Default 4.
    pub target_capacity: usize,
    /// Consecutive dial failures tolerated before the breaker opens.
    /// Default 5.
    pub max_fails: u64,
    /// Cooldown after which an open breaker allows a probe. Default 30 s.
    pub reset: Duration,
    /// Bound on a single dial. Default 10 s.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target_capacity: DEFAULT_POOL_CAPACITY,
            max_fails: 5,
            reset: Duration::from_secs(30),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Pooled RPC client bound to one remote peer.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

struct Shared {
    addr: PeerAddr,
    config: ClientConfig,
    rpc: RpcTable,
    outbound: Mutex<BytesMut>,
    /// Notified after each flush; releases writers parked on the soft cap.
    write_event: Notify,
    /// Notified after each append; wakes a write loop to flush.
    writer_event: Notify,
    pool: Mutex<PoolState>,
    /// Notified on alive/tripped transitions.
    connect_event: Notify,
    /// Serializes connection attempts across the pool.
    connect_mutex: tokio::sync::Mutex<()>,
    breaker: Mutex<CircuitBreaker>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

#[derive(Default)]
struct PoolState {
    /// Connection tasks currently running, connected or retrying.
    tasks: usize,
    /// Connections past the dial, serving their read/write loops.
    alive: usize,
    /// Set when the breaker trips; cleared when a fresh task spawns.
    tripped: bool,
    next_id: u64,
}

impl Client {
    /// Client with default configuration.
    pub fn new(addr: PeerAddr) -> Self {
        Self::with_config(addr, ClientConfig::default())
    }

    /// Client with explicit tunables.
    pub fn with_config(addr: PeerAddr, config: ClientConfig) -> Self {
        let breaker = CircuitBreaker::closed(config.max_fails, config.reset);
        Self {
            shared: Arc::new(Shared {
                addr,
                config,
                rpc: RpcTable::new(),
                outbound: Mutex::new(BytesMut::new()),
                write_event: Notify::new(),
                writer_event: Notify::new(),
                pool: Mutex::new(PoolState::default()),
                connect_event: Notify::new(),
                connect_mutex: tokio::sync::Mutex::new(()),
                breaker: Mutex::new(breaker),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// The peer this client dials.
    pub fn peer_addr(&self) -> PeerAddr {
        self.shared.addr
    }

    /// Acquire a handle that appends to the shared outbound buffer.
    ///
    /// Ensures a connection is available (spawning one if needed), then
    /// parks while the buffer is over the 64 KiB soft cap. Dropping the
    /// handle signals the write loop to flush.
    pub async fn acquire_writer(&self) -> Result<Writer<'_>, NetError> {
        if self.shared.cancel.is_cancelled() {
            return Err(NetError::Closed);
        }
        ensure_connection_available(&self.shared).await?;
        self.shared.wait_for_buffer_capacity().await?;
        Ok(Writer {
            shared: &self.shared,
        })
    }

    /// Send a request frame and await the matching response body.
    pub async fn request(&self, tag: Tag, body: &[u8]) -> Result<Bytes, NetError> {
        if self.shared.cancel.is_cancelled() {
            return Err(NetError::Closed);
        }
        let len = frame_len(body)?;
        let pending = self.shared.rpc.register(&self.shared.cancel).await?;
        let header = Header {
            len,
            nonce: pending.nonce(),
            op: Op::Request,
            tag,
        };
        {
            let mut writer = self.acquire_writer().await?;
            writer.write_frame(&header, body);
        }
        let frame = pending.wait(&self.shared.cancel).await?;
        Ok(frame.body)
    }

    /// Send a one-way command frame; no response is expected.
    pub async fn send_command(&self, tag: Tag, body: &[u8]) -> Result<(), NetError> {
        let len = frame_len(body)?;
        let header = Header {
            len,
            nonce: 0,
            op: Op::Command,
            tag,
        };
        let mut writer = self.acquire_writer().await?;
        writer.write_frame(&header, body);
        Ok(())
    }

    /// Cancel every task, wake every parked waiter, and wait for the
    /// pool to drain.
    pub async fn shutdown(&self) {
        debug!(peer = %self.shared.addr, "client shutting down");
        self.shared.cancel.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }
}

fn frame_len(body: &[u8]) -> Result<u32, NetError> {
    let len = u32::try_from(body.len())
        .map_err(|_| NetError::Wire(WireError::FrameTooLarge { len: u32::MAX }))?;
    if len > MAX_FRAME_LEN {
        return Err(NetError::Wire(WireError::FrameTooLarge { len }));
    }
    Ok(len)
}

/// Buffered writer handle appending to the client's shared outbound
/// buffer. Dropping it notifies the write loop to flush.
pub struct Writer<'a> {
    shared: &'a Shared,
}

impl std::fmt::Debug for Writer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer").finish_non_exhaustive()
    }
}

impl Writer<'_> {
    /// Append one frame: header plus body.
    pub fn write_frame(&mut self, header: &Header, body: &[u8]) {
        debug_assert_eq!(header.len as usize, body.len());
        let mut buf = self.shared.outbound.lock();
        buf.reserve(HEADER_LEN + body.len());
        header.encode(&mut *buf);
        buf.put_slice(body);
    }

    /// Append raw, already-framed bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        self.shared.outbound.lock().put_slice(bytes);
    }
}

impl Drop for Writer<'_> {
    fn drop(&mut self) {
        self.shared.writer_event.notify_one();
    }
}

enum AttemptError {
    /// The breaker is open; the pool task broadcasts and exits.
    Tripped,
    Cancelled,
    Failed(NetError),
}

/// Park until a connection is alive, spawning one when the pool has room
/// and demand. Fails fast once the breaker trips.
async fn ensure_connection_available(shared: &Arc<Shared>) -> Result<(), NetError> {
    maybe_spawn_connection(shared);
    loop {
        let mut notified = pin!(shared.connect_event.notified());
        notified.as_mut().enable();
        {
            let pool = shared.pool.lock();
            if pool.alive > 0 {
                return Ok(());
            }
            if pool.tripped {
                return Err(NetError::CircuitBreakerTripped);
            }
        }
        tokio::select! {
            _ = shared.cancel.cancelled() => return Err(NetError::Closed),
            _ = &mut notified => {}
        }
    }
}

/// Spawn a connection task when the pool is empty, or when bytes are
/// pending, the breaker is clean, and the pool is under capacity. Growth
/// is demand-driven and suppressed during breaker recovery.
fn maybe_spawn_connection(shared: &Arc<Shared>) {
    if shared.cancel.is_cancelled() {
        return;
    }
    let pending_bytes = !shared.outbound.lock().is_empty();
    let clean = !shared.breaker.lock().has_failures();
    let mut pool = shared.pool.lock();
    let spawn =
        pool.tasks == 0 || (pending_bytes && clean && pool.tasks < shared.config.target_capacity);
    if !spawn {
        return;
    }
    pool.tasks += 1;
    pool.tripped = false;
    let id = pool.next_id;
    pool.next_id += 1;
    drop(pool);

    let shared = Arc::clone(shared);
    let tracker = shared.tracker.clone();
    tracker.spawn(async move {
        run_connection(shared, id).await;
    });
}

/// One pool slot: dial, serve, and reconnect until shed or cancelled.
async fn run_connection(shared: Arc<Shared>, id: u64) {
    debug!(conn = id, peer = %shared.addr, "connection task started");
    loop {
        match attempt_connection(&shared).await {
            Ok(stream) => {
                {
                    shared.pool.lock().alive += 1;
                }
                shared.connect_event.notify_waiters();
                debug!(conn = id, peer = %shared.addr, "connected");
                match serve_streams(&shared, stream).await {
                    Ok(()) => debug!(conn = id, "connection closed by peer"),
                    Err(err) => debug!(conn = id, error = %err, "connection ended"),
                }
                shared.pool.lock().alive -= 1;
            }
            Err(AttemptError::Tripped) => {
                warn!(conn = id, peer = %shared.addr, "circuit breaker tripped");
                {
                    shared.pool.lock().tripped = true;
                }
                shared.connect_event.notify_waiters();
                break;
            }
            Err(AttemptError::Cancelled) => break,
            Err(AttemptError::Failed(err)) => {
                debug!(conn = id, peer = %shared.addr, error = %err, "connection attempt failed");
            }
        }
        if shared.cancel.is_cancelled() {
            break;
        }
        // Contraction: only the last pool task keeps retrying; the rest
        // shed themselves and growth stays demand-driven.
        if shared.pool.lock().tasks > 1 {
            debug!(conn = id, "shedding surplus connection task");
            break;
        }
    }
    let mut pool = shared.pool.lock();
    pool.tasks -= 1;
    debug!(conn = id, remaining = pool.tasks, "connection task exited");
}

/// One dial attempt, serialized with every other attempt so they all
/// observe the breaker in order. Sleeps the backoff when failures exist
/// and reports the outcome to the breaker.
async fn attempt_connection(shared: &Shared) -> Result<TcpStream, AttemptError> {
    let _guard = tokio::select! {
        _ = shared.cancel.cancelled() => return Err(AttemptError::Cancelled),
        guard = shared.connect_mutex.lock() => guard,
    };

    let delay = {
        let breaker = shared.breaker.lock();
        if breaker.state(now_ms()) == BreakerState::Open {
            return Err(AttemptError::Tripped);
        }
        breaker.backoff()
    };
    if let Some(delay) = delay {
        trace!(delay_ms = delay.as_millis() as u64, "backing off before dial");
        tokio::select! {
            _ = shared.cancel.cancelled() => return Err(AttemptError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let dial = async {
        let stream = tokio::time::timeout(
            shared.config.connect_timeout,
            TcpStream::connect(shared.addr.socket_addr()),
        )
        .await
        .map_err(|_| NetError::ConnectTimeout)??;
        configure_stream(&stream)?;
        Ok::<_, NetError>(stream)
    };
    tokio::select! {
        _ = shared.cancel.cancelled() => Err(AttemptError::Cancelled),
        res = dial => match res {
            Ok(stream) => {
                shared.breaker.lock().report_success();
                Ok(stream)
            }
            Err(err) => {
                shared.breaker.lock().report_failure(now_ms());
                Err(AttemptError::Failed(err))
            }
        },
    }
}

/// Run the paired loops for one established connection: the write loop
/// on its own task, the read loop inline. When the read loop returns,
/// cancel the pair's token and await the writer.
async fn serve_streams(shared: &Arc<Shared>, stream: TcpStream) -> Result<(), NetError> {
    let (read_half, write_half) = stream.into_split();
    let pair = shared.cancel.child_token();
    let writer = {
        let shared = Arc::clone(shared);
        let pair = pair.clone();
        tokio::spawn(async move { write_loop(shared, write_half, pair).await })
    };
    let result = read_loop(shared, read_half, &pair).await;
    pair.cancel();
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => trace!(error = %err, "write loop ended with error"),
        Err(err) => warn!(error = %err, "write loop panicked"),
    }
    result
}

/// Frame packets off the socket and route responses. Anything that is
/// not a response is discarded; the client serves no inbound requests.
/// A rejected push is fatal for this connection.
async fn read_loop(
    shared: &Shared,
    mut reader: OwnedReadHalf,
    cancel: &CancellationToken,
) -> Result<(), NetError> {
    let mut fifo = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        let Some(header) = frame::read_header(&mut reader, &mut fifo, cancel).await? else {
            return Ok(());
        };
        let body = frame::read_body(&mut reader, &mut fifo, header.len as usize, cancel).await?;
        match header.op {
            Op::Response => {
                if !shared.rpc.push(header, body) {
                    return Err(NetError::UnexpectedResponse {
                        nonce: header.nonce,
                    });
                }
            }
            Op::Command | Op::Request => {
                trace!(tag = ?header.tag, "discarding inbound non-response frame");
            }
        }
    }
}

/// Park until bytes are appended, take ownership of the buffer in a
/// single swap so appenders never see a torn flush, write it out, then
/// release any writers stalled on backpressure.
///
/// Cancellation is never raced against a whole `write_all`. The chunk
/// goes out through plain `write` calls, which consume nothing when they
/// lose the race, so on cancellation the unwritten tail is requeued at
/// the front of the shared buffer and the final drain below flushes it
/// under a bound. Taken bytes are therefore either on the wire, back in
/// the buffer, or lost only to a failed socket.
async fn write_loop(
    shared: Arc<Shared>,
    mut writer: OwnedWriteHalf,
    cancel: CancellationToken,
) -> Result<(), NetError> {
    'serve: loop {
        let notified = shared.writer_event.notified();
        match shared.take_outbound() {
            Some(chunk) => {
                let mut written = 0;
                while written < chunk.len() {
                    tokio::select! {
                        biased;
                        res = writer.write(&chunk[written..]) => {
                            let n = res?;
                            if n == 0 {
                                return Err(NetError::Io(std::io::Error::new(
                                    std::io::ErrorKind::WriteZero,
                                    "socket closed while draining",
                                )));
                            }
                            written += n;
                        }
                        _ = cancel.cancelled() => {
                            shared.requeue_front(&chunk[written..]);
                            break 'serve;
                        }
                    }
                }
                shared.write_event.notify_waiters();
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = notified => {}
                }
            }
        }
    }
    // Final drain, then half-close so the peer sees a clean FIN.
    if let Some(chunk) = shared.take_outbound() {
        let _ = tokio::time::timeout(WRITE_DRAIN_TIMEOUT, writer.write_all(&chunk)).await;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

impl Shared {
    /// Park while the outbound buffer is over the soft cap, rechecking
    /// cancellation on every wake.
    async fn wait_for_buffer_capacity(&self) -> Result<(), NetError> {
        loop {
            let mut notified = pin!(self.write_event.notified());
            notified.as_mut().enable();
            if self.outbound.lock().len() <= OUTBOUND_SOFT_CAP {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(NetError::Closed),
                _ = &mut notified => {}
            }
        }
    }

    fn take_outbound(&self) -> Option<Bytes> {
        let mut buf = self.outbound.lock();
        if buf.is_empty() {
            None
        } else {
            Some(buf.split().freeze())
        }
    }

    /// Put an unwritten tail back at the front of the outbound buffer,
    /// ahead of anything appended since the chunk was taken.
    fn requeue_front(&self, tail: &[u8]) {
        if tail.is_empty() {
            return;
        }
        let mut buf = self.outbound.lock();
        if buf.is_empty() {
            buf.put_slice(tail);
        } else {
            let mut merged = BytesMut::with_capacity(tail.len() + buf.len());
            merged.put_slice(tail);
            merged.put_slice(&buf[..]);
            *buf = merged;
        }
    }
}
