//! Synthetic PostgreSQL ErrorResponse frame.
//!
//! Emitted to a client only when no primary is available at accept time.
//! This is the single place the gateway speaks the database wire
//! protocol; client traffic is never parsed.

use bytes::{BufMut, Bytes, BytesMut};
use std::io::Write;
use std::net::TcpStream;

const SEVERITY: &str = "FATAL";
const SQLSTATE: &str = "08006"; // connection_failure

/// Build an ErrorResponse frame.
///
/// Layout: `'E'`, big-endian i32 total length (including the four length
/// bytes, excluding the type byte), then `'S' severity NUL`,
/// `'C' sqlstate NUL`, `'M' message NUL`, and a final NUL terminator.
pub fn error_response(message: &str) -> Bytes {
    let fields_len = (1 + SEVERITY.len() + 1) + (1 + SQLSTATE.len() + 1) + (1 + message.len() + 1) + 1;
    let total_len = 4 + fields_len;

    let mut buf = BytesMut::with_capacity(1 + total_len);
    buf.put_u8(b'E');
    buf.put_i32(total_len as i32);

    buf.put_u8(b'S');
    buf.put_slice(SEVERITY.as_bytes());
    buf.put_u8(0);

    buf.put_u8(b'C');
    buf.put_slice(SQLSTATE.as_bytes());
    buf.put_u8(0);

    buf.put_u8(b'M');
    buf.put_slice(message.as_bytes());
    buf.put_u8(0);

    buf.put_u8(0);
    buf.freeze()
}

/// Best-effort write of an ErrorResponse to a client socket. Failures are
/// ignored; the caller closes the socket either way.
pub fn send_error(stream: &mut TcpStream, message: &str) {
    let frame = error_response(message);
    let _ = stream.write_all(&frame);
}
