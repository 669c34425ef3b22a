// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! An outgoing packet: a frame header plus payload, tracked with a write
//! cursor so a partial `try_write` can resume without reassembling
//! anything.

use bytes::Bytes;

use crate::net::codec::{self, HEADER_LEN};

/// One fully-framed packet, buffered and ready to be written to the
/// socket a chunk at a time.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: Bytes,
    written: usize,
}

impl Packet {
    /// Frames `payload` under `packet_type` and returns the packet ready
    /// for the output queue.
    pub fn new(packet_type: u32, payload: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        let mut header = [0u8; HEADER_LEN];
        codec::encode_header(&mut header, packet_type, payload.len() as u32);
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(payload);
        Packet {
            buf: Bytes::from(bytes),
            written: 0,
        }
    }

    /// A packet carrying no payload (e.g. a NOP keep-alive).
    pub fn empty(packet_type: u32) -> Self {
        Self::new(packet_type, &[])
    }

    /// Bytes not yet written to the socket.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.written..]
    }

    /// Records that `n` bytes were accepted by the socket.
    pub fn advance(&mut self, n: usize) {
        self.written = (self.written + n).min(self.buf.len());
    }

    /// Whether every byte of this packet has been written.
    pub fn is_complete(&self) -> bool {
        self.written >= self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_tracks_partial_writes() {
        let mut pkt = Packet::new(7, b"hello");
        assert!(!pkt.is_complete());
        let total = pkt.remaining().len();
        pkt.advance(3);
        assert_eq!(pkt.remaining().len(), total - 3);
        pkt.advance(total - 3);
        assert!(pkt.is_complete());
        assert!(pkt.remaining().is_empty());
    }

    #[test]
    fn advance_never_overruns_the_buffer() {
        let mut pkt = Packet::empty(0);
        pkt.advance(1000);
        assert!(pkt.is_complete());
    }
}
