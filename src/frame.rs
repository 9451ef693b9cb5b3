//! Stream framing: carving length-framed packets out of a byte stream.
//!
//! Both the client and server read loops maintain a dynamic byte FIFO and
//! pull complete frames from it: fill to the 10-byte header, decode, fill
//! to `len`, split the body off. The header's 1 MiB cap bounds every body
//! allocation before it happens.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::constants::HEADER_LEN;
use crate::error::NetError;
use crate::packet::Header;

/// Read the next frame header. Returns `Ok(None)` on a clean EOF at a
/// frame boundary; EOF mid-header is an error.
pub(crate) async fn read_header<R>(
    reader: &mut R,
    fifo: &mut BytesMut,
    cancel: &CancellationToken,
) -> Result<Option<Header>, NetError>
where
    R: AsyncRead + Unpin,
{
    if !fill(reader, fifo, HEADER_LEN, cancel, true).await? {
        return Ok(None);
    }
    let mut header_bytes = fifo.split_to(HEADER_LEN);
    let header = Header::decode(&mut header_bytes)?;
    Ok(Some(header))
}

/// Read the frame body following a decoded header: exactly `len` bytes.
pub(crate) async fn read_body<R>(
    reader: &mut R,
    fifo: &mut BytesMut,
    len: usize,
    cancel: &CancellationToken,
) -> Result<Bytes, NetError>
where
    R: AsyncRead + Unpin,
{
    fill(reader, fifo, len, cancel, false).await?;
    Ok(fifo.split_to(len).freeze())
}

/// Fill `fifo` to at least `need` buffered bytes. With `eof_ok`, an EOF
/// on an empty FIFO reports `false` instead of failing; EOF anywhere else
/// is an unexpected disconnect.
async fn fill<R>(
    reader: &mut R,
    fifo: &mut BytesMut,
    need: usize,
    cancel: &CancellationToken,
    eof_ok: bool,
) -> Result<bool, NetError>
where
    R: AsyncRead + Unpin,
{
    while fifo.len() < need {
        fifo.reserve(need - fifo.len());
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(NetError::Cancelled),
            res = reader.read_buf(fifo) => res?,
        };
        if n == 0 {
            if eof_ok && fifo.is_empty() {
                return Ok(false);
            }
            return Err(NetError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            )));
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::constants::READ_BUFFER_SIZE;
    use crate::error::WireError;
    use crate::packet::{Op, Tag};

    fn frame(header: &Header, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.put_slice(body);
        buf
    }

    #[tokio::test]
    async fn frames_are_reassembled_across_reads() {
        let (mut tx, mut rx) = tokio::io::duplex(16);
        let cancel = CancellationToken::new();
        let header = Header {
            len: 64,
            nonce: 9,
            op: Op::Request,
            tag: Tag::Hello,
        };
        let body = vec![0xAB; 64];
        let wire = frame(&header, &body);

        let writer = tokio::spawn(async move {
            // Dribble the frame through a tiny duplex so the reader has
            // to accumulate across several reads.
            for chunk in wire.chunks(7) {
                tx.write_all(chunk).await.unwrap();
            }
            tx
        });

        let mut fifo = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let got = read_header(&mut rx, &mut fifo, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, header);
        let got_body = read_body(&mut rx, &mut fifo, got.len as usize, &cancel)
            .await
            .unwrap();
        assert_eq!(got_body.as_ref(), &body[..]);
        drop(writer.await.unwrap());

        // The stream is closed now; the next header read is a clean EOF.
        assert!(read_header(&mut rx, &mut fifo, &cancel)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        tx.write_all(&[1, 2, 3]).await.unwrap();
        drop(tx);

        let mut fifo = BytesMut::new();
        let err = read_header(&mut rx, &mut fifo, &cancel).await.unwrap_err();
        match err {
            NetError::Io(io) => assert_eq!(io.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected io error, got {other}"),
        }
    }

    #[tokio::test]
    async fn oversize_header_fails_before_body_allocation() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let mut wire = BytesMut::new();
        wire.put_u32_le(crate::constants::MAX_FRAME_LEN + 1);
        wire.put_u32_le(0);
        wire.put_u8(Op::Response as u8);
        wire.put_u8(Tag::Ping as u8);
        tx.write_all(&wire).await.unwrap();

        let mut fifo = BytesMut::new();
        let err = read_header(&mut rx, &mut fifo, &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            NetError::Wire(WireError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_pending_read() {
        let (_tx, mut rx) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut fifo = BytesMut::new();
                read_header(&mut rx, &mut fifo, &cancel).await
            })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, NetError::Cancelled));
    }
}
