//! Shared helpers for the integration suite: loopback responders that
//! speak the wire format.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use trellis::constants::{HEADER_LEN, MAX_FRAME_LEN};
use trellis::{Header, Op};

/// Read one complete frame off the stream.
pub async fn read_frame(stream: &mut TcpStream) -> Result<(Header, Vec<u8>)> {
    let mut header_bytes = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_bytes).await?;
    let header = Header::decode(&mut &header_bytes[..])?;
    let mut body = vec![0u8; header.len as usize];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

/// Write one complete frame to the stream.
pub async fn write_frame(stream: &mut TcpStream, header: &Header, body: &[u8]) -> Result<()> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    header.encode(&mut buf);
    buf.extend_from_slice(body);
    stream.write_all(&buf).await?;
    Ok(())
}

/// Bind a loopback responder that answers every request frame with a
/// response carrying the same nonce, tag, and body.
pub async fn spawn_echo_responder() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                while let Ok((header, body)) = read_frame(&mut stream).await {
                    if header.op != Op::Request {
                        continue;
                    }
                    let reply = Header {
                        op: Op::Response,
                        ..header
                    };
                    if write_frame(&mut stream, &reply, &body).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    Ok(addr)
}

/// Bind a responder that collects `batch` requests per connection, then
/// answers them in the arrival-index order given by `order`.
pub async fn spawn_reordering_responder(batch: usize, order: Vec<usize>) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let order = order.clone();
            tokio::spawn(async move {
                let mut requests = Vec::with_capacity(batch);
                for _ in 0..batch {
                    match read_frame(&mut stream).await {
                        Ok(frame) => requests.push(frame),
                        Err(_) => return,
                    }
                }
                for &index in &order {
                    let (header, body) = &requests[index];
                    let reply = Header {
                        op: Op::Response,
                        ..*header
                    };
                    if write_frame(&mut stream, &reply, body).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    Ok(addr)
}

/// Bind a responder whose first connection answers the first request
/// twice — the duplicate targets an already-vacated nonce — and every
/// later connection is a plain echo. Returns the bound address and the
/// running accept count.
pub async fn spawn_duplicate_reply_then_echo_responder() -> Result<(SocketAddr, Arc<AtomicUsize>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepts);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(async move {
                if n == 1 {
                    let Ok((header, body)) = read_frame(&mut stream).await else {
                        return;
                    };
                    let reply = Header {
                        op: Op::Response,
                        ..header
                    };
                    if write_frame(&mut stream, &reply, &body).await.is_err() {
                        return;
                    }
                    // The duplicate: same nonce a second time.
                    let _ = write_frame(&mut stream, &reply, &body).await;
                    let mut sink = [0u8; 64];
                    while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                } else {
                    while let Ok((header, body)) = read_frame(&mut stream).await {
                        if header.op != Op::Request {
                            continue;
                        }
                        let reply = Header {
                            op: Op::Response,
                            ..header
                        };
                        if write_frame(&mut stream, &reply, &body).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });
    Ok((addr, accepts))
}

/// Bind a responder whose first connection answers one request and then
/// sends a header announcing an oversize body; every later connection is
/// a plain echo. Returns the bound address and the running accept count.
pub async fn spawn_poisoned_then_echo_responder() -> Result<(SocketAddr, Arc<AtomicUsize>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepts);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(async move {
                if n == 1 {
                    let Ok((header, body)) = read_frame(&mut stream).await else {
                        return;
                    };
                    let reply = Header {
                        op: Op::Response,
                        ..header
                    };
                    if write_frame(&mut stream, &reply, &body).await.is_err() {
                        return;
                    }
                    // Poison the stream: a header whose body can never be
                    // accepted. The peer must drop the connection.
                    let poison = Header {
                        len: MAX_FRAME_LEN + 1,
                        nonce: 0,
                        op: Op::Response,
                        tag: header.tag,
                    };
                    let mut buf = BytesMut::new();
                    poison.encode(&mut buf);
                    let _ = stream.write_all(&buf).await;
                    // Hold the socket open; the client closes it.
                    let mut sink = [0u8; 64];
                    while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                } else {
                    while let Ok((header, body)) = read_frame(&mut stream).await {
                        if header.op != Op::Request {
                            continue;
                        }
                        let reply = Header {
                            op: Op::Response,
                            ..header
                        };
                        if write_frame(&mut stream, &reply, &body).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });
    Ok((addr, accepts))
}
