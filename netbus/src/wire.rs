//! Length-prefixed frame I/O shared by the connection pool and the inbound server.
//!
//! Every frame on the wire is a 4-byte big-endian length followed by that many bytes of
//! payload, produced by [`netbus_core::encode_frame`] / consumed by
//! [`netbus_core::decode_frame`]. This module only knows about the length prefix; it has no
//! opinion about what is inside the payload.

use bytes::{BufMut, Bytes, BytesMut};
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::io_bytes::IoBytes;

/// Writes one length-prefixed frame as a single buffered write.
///
/// `buffer_size` is a capacity hint (`BusOptions::write_buffer_size`) for the header+payload
/// buffer assembled here; a small frame is copied into one preallocated `BytesMut` so the
/// 4-byte length prefix and the payload go out in a single `write_all` rather than two.
pub async fn write_frame<S>(stream: &mut S, payload: Bytes, buffer_size: usize) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(buffer_size.max(4 + payload.len()));
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    let BufResult(res, _) = stream.write_all(IoBytes::new(buf.freeze())).await;
    res
}

/// Writes the single-byte pong response to a ping frame (never length-prefixed).
pub async fn write_pong<S>(stream: &mut S) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let BufResult(res, _) = stream.write_all(vec![0x01u8]).await;
    res?;
    Ok(())
}

/// Reads exactly one length-prefixed frame's payload, or `Ok(None)` on a clean EOF before any
/// byte of a new frame has arrived.
///
/// # Errors
///
/// Returns an error on I/O failure or on EOF in the middle of a frame (a partial read is not a
/// clean shutdown).
pub async fn read_frame<S>(stream: &mut S) -> std::io::Result<Option<Bytes>>
where
    S: AsyncRead + Unpin,
{
    let len_buf = vec![0u8; 4];
    let BufResult(res, len_buf) = stream.read_exact(len_buf).await;
    match res {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes([len_buf[0], len_buf[1], len_buf[2], len_buf[3]]) as usize;

    let body_buf = vec![0u8; len];
    let BufResult(res, body_buf) = stream.read_exact(body_buf).await;
    res?;
    Ok(Some(Bytes::from(body_buf)))
}

/// Reads whatever bytes are currently available on a connection used only to watch for pong
/// liveness bytes (an outbound pool connection never receives framed data, only `0x01` pongs).
///
/// `buffer_size` (`BusOptions::read_buffer_size`) sizes the read buffer; liveness traffic is a
/// single byte per pong, so any buffer large enough to hold one is equivalent, but reusing the
/// configured size avoids a second buffer-sizing policy for the one socket read this module does
/// without a known payload length up front.
///
/// Returns `Ok(0)` on clean EOF.
pub async fn read_liveness_byte<S>(stream: &mut S, buffer_size: usize) -> std::io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    let buf = vec![0u8; buffer_size.max(1)];
    let BufResult(res, _buf) = stream.read(buf).await;
    res
}
