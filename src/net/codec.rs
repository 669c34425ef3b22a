// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Big-endian integer framing.
//!
//! Every packet on the wire is `type:u32 | length:u32 | payload[length]`.
//! This module is the "small, well-tested serialize/deserialize layer"
//! every higher-level parser goes through; nothing above this module
//! reaches for raw byte indexing on a wire buffer.

use crate::error::FrameError;

/// Size of the fixed framing header: a 32-bit type followed by a 32-bit
/// payload length, both big-endian.
pub const HEADER_LEN: usize = 8;

/// Largest payload a single packet may declare.
pub const MAX_PACKET_SIZE: u32 = 1_500_000;

/// Largest single download block, in bytes.
pub const META_DL_BLOCK: u64 = 1_000_000;

/// Maximum number of retries for a single download block before the
/// download (not the connection) is abandoned.
pub const MAX_BLOCK_RETRIES: u8 = 5;

/// Protocol version this client registers with. The filtered original
/// source has no header defining the real numeric values (same gap as
/// the packet type codes in `net::types`), so these are self-consistent
/// placeholders.
pub const VERSMAJ: u16 = 1;
pub const VERSMID: u8 = 6;
pub const VERSMIN: u8 = 27;

#[inline]
pub fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

#[inline]
pub fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

#[inline]
pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

#[inline]
pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Reads a big-endian `u8` from the front of `buf`, advancing it.
pub fn get_u8(buf: &mut &[u8]) -> Option<u8> {
    let (head, rest) = buf.split_first()?;
    *buf = rest;
    Some(*head)
}

/// Reads a big-endian `u32` from the front of `buf`, advancing it.
pub fn get_u32(buf: &mut &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    let (head, rest) = buf.split_at(4);
    *buf = rest;
    Some(u32::from_be_bytes(head.try_into().ok()?))
}

/// Reads a big-endian `u64` from the front of `buf`, advancing it.
pub fn get_u64(buf: &mut &[u8]) -> Option<u64> {
    if buf.len() < 8 {
        return None;
    }
    let (head, rest) = buf.split_at(8);
    *buf = rest;
    Some(u64::from_be_bytes(head.try_into().ok()?))
}

/// Encodes the 8-byte frame header into `out`.
pub fn encode_header(out: &mut [u8; HEADER_LEN], packet_type: u32, length: u32) {
    out[0..4].copy_from_slice(&packet_type.to_be_bytes());
    out[4..8].copy_from_slice(&length.to_be_bytes());
}

/// First byte of a `MLTOMA_REGISTER` payload, tagging a new-connection
/// registration (the original also defines a re-register tag, unused by
/// this client).
const REGISTER_NEW: u8 = 1;

/// Builds the `MLTOMA_REGISTER` payload: registration tag, protocol
/// version, and the configured keep-alive `Timeout`, mirroring
/// `masterconn_sendregister`.
pub fn register_payload(timeout_secs: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(7);
    put_u8(&mut buf, REGISTER_NEW);
    put_u16(&mut buf, VERSMAJ);
    put_u8(&mut buf, VERSMID);
    put_u8(&mut buf, VERSMIN);
    put_u16(&mut buf, timeout_secs);
    buf
}

/// Decodes an 8-byte frame header into `(type, length)`, rejecting a
/// declared length above [`MAX_PACKET_SIZE`].
pub fn decode_header(buf: &[u8; HEADER_LEN]) -> Result<(u32, u32), FrameError> {
    let packet_type = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if length > MAX_PACKET_SIZE {
        return Err(FrameError::Oversized {
            size: length,
            max: MAX_PACKET_SIZE,
        });
    }
    Ok((packet_type, length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_is_exact_for_all_boundary_values() {
        for &(t, l) in &[
            (0u32, 0u32),
            (u32::MAX, MAX_PACKET_SIZE),
            (1, MAX_PACKET_SIZE),
            (0xDEAD_BEEF, 12345),
        ] {
            let mut buf = [0u8; HEADER_LEN];
            encode_header(&mut buf, t, l);
            let (dt, dl) = decode_header(&buf).expect("decodes");
            assert_eq!((dt, dl), (t, l));
        }
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = [0u8; HEADER_LEN];
        encode_header(&mut buf, 7, MAX_PACKET_SIZE + 1);
        assert_eq!(
            decode_header(&buf),
            Err(FrameError::Oversized {
                size: MAX_PACKET_SIZE + 1,
                max: MAX_PACKET_SIZE,
            })
        );
    }

    #[test]
    fn register_payload_encodes_tag_version_and_timeout() {
        let payload = register_payload(60);
        assert_eq!(payload.len(), 7);
        assert_eq!(payload[0], 1);
        assert_eq!(u16::from_be_bytes([payload[1], payload[2]]), VERSMAJ);
        assert_eq!(payload[3], VERSMID);
        assert_eq!(payload[4], VERSMIN);
        assert_eq!(u16::from_be_bytes([payload[5], payload[6]]), 60);
    }

    #[test]
    fn get_helpers_advance_the_cursor() {
        let mut buf: &[u8] = &[1, 0, 0, 0, 42, 9, 9];
        assert_eq!(get_u8(&mut buf), Some(1));
        assert_eq!(get_u32(&mut buf), Some(42));
        assert_eq!(buf, &[9, 9]);
        assert_eq!(get_u64(&mut buf), None);
    }
}
