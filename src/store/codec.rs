//! Wire codec for the minute store protocol
//!
//! Frames are length-prefixed. A request is an opcode plus a row key and a
//! column-qualifier prefix (scans add a minute count); a response is a status
//! byte followed by rows of `(qualifier, u64)` columns. Counter values travel
//! as fixed-width big-endian u64 cells.

use bytes::{Buf, BufMut, BytesMut};

use super::{RawRow, StoreError};

pub const OP_ROW: u8 = 1;
pub const OP_SCAN: u8 = 2;

const STATUS_OK: u8 = 0;

/// Upper bound on a sane response payload; anything larger means the stream
/// is out of sync.
pub const MAX_FRAME: u32 = 64 * 1024 * 1024;

/// Encode a single-minute row read. The returned buffer includes the frame
/// length prefix and is ready to write to the socket.
pub fn encode_row_request(row_key: &str, column_prefix: &str) -> BytesMut {
    let mut payload = BytesMut::new();
    payload.put_u8(OP_ROW);
    put_str(&mut payload, row_key);
    put_str(&mut payload, column_prefix);
    frame(payload)
}

/// Encode a scan over `count` consecutive minutes starting at `start_key`.
pub fn encode_scan_request(start_key: &str, column_prefix: &str, count: u32) -> BytesMut {
    let mut payload = BytesMut::new();
    payload.put_u8(OP_SCAN);
    put_str(&mut payload, start_key);
    put_str(&mut payload, column_prefix);
    payload.put_u32(count);
    frame(payload)
}

/// Decode a response payload (the bytes after the frame length prefix).
pub fn decode_response(mut payload: &[u8]) -> Result<Vec<RawRow>, StoreError> {
    let status = get_u8(&mut payload)?;
    if status != STATUS_OK {
        return Err(StoreError::Remote(get_str(&mut payload)?));
    }

    let row_count = get_u32(&mut payload)?;
    let mut rows = Vec::with_capacity(row_count as usize);
    for _ in 0..row_count {
        let key = get_str(&mut payload)?;
        let column_count = get_u32(&mut payload)?;
        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let qualifier = get_str(&mut payload)?;
            let value = get_u64(&mut payload)?;
            columns.push((qualifier, value));
        }
        rows.push(RawRow { key, columns });
    }
    if payload.has_remaining() {
        return Err(StoreError::Protocol("trailing bytes in response".into()));
    }
    Ok(rows)
}

fn frame(payload: BytesMut) -> BytesMut {
    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    buf
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, StoreError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, StoreError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, StoreError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_str(buf: &mut &[u8]) -> Result<String, StoreError> {
    let len = get_u16(buf)? as usize;
    ensure(buf, len)?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(bytes).map_err(|_| StoreError::Protocol("non-utf8 string".into()))
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, StoreError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

fn ensure(buf: &&[u8], needed: usize) -> Result<(), StoreError> {
    if buf.remaining() < needed {
        return Err(StoreError::Protocol("truncated response".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_request_layout() {
        let buf = encode_row_request("k", "loc:");
        // len(1 + 2+1 + 2+4) | op | keylen | 'k' | prefixlen | "loc:"
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 10, OP_ROW, 0, 1, b'k', 0, 4, b'l', b'o', b'c', b':']
        );
    }

    #[test]
    fn scan_request_carries_count() {
        let buf = encode_scan_request("k", "", 60);
        assert_eq!(buf[4], OP_SCAN);
        assert_eq!(&buf[buf.len() - 4..], &[0, 0, 0, 60]);
    }

    #[test]
    fn decodes_rows_and_big_endian_values() {
        let mut payload = BytesMut::new();
        payload.put_u8(STATUS_OK);
        payload.put_u32(1); // one row
        payload.put_u16(3);
        payload.put_slice(b"key");
        payload.put_u32(2); // two columns
        payload.put_u16(1);
        payload.put_slice(b"a");
        payload.put_u64(5);
        payload.put_u16(1);
        payload.put_slice(b"b");
        payload.put_u64(u64::MAX);

        let rows = decode_response(&payload).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "key");
        assert_eq!(rows[0].columns, vec![("a".into(), 5), ("b".into(), u64::MAX)]);
    }

    #[test]
    fn error_status_surfaces_the_remote_message() {
        let mut payload = BytesMut::new();
        payload.put_u8(1);
        payload.put_u16(4);
        payload.put_slice(b"boom");

        match decode_response(&payload) {
            Err(StoreError::Remote(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[test]
    fn truncated_payload_is_a_protocol_error() {
        let mut payload = BytesMut::new();
        payload.put_u8(STATUS_OK);
        payload.put_u32(1);
        payload.put_u16(10); // claims a 10-byte key, provides none

        assert!(matches!(decode_response(&payload), Err(StoreError::Protocol(_))));
    }
}
