// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! FIFO of outgoing packets drained onto the socket by `try_write`.
//!
//! Mirrors the original's `outputhead`/`outputtail` linked list: packets
//! are appended at the back and the front is written first, one
//! `try_write` call at a time, stopping at `WouldBlock` or an empty
//! queue.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};

use tokio::net::TcpStream;

use crate::net::packet::Packet;

/// Ordered buffer of packets awaiting transmission.
#[derive(Debug, Default)]
pub struct OutputQueue {
    packets: VecDeque<Packet>,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    pub fn is_empty(&self) -> bool {
        self.packets.iter().all(Packet::is_complete)
    }

    /// Writes as much of the front of the queue as the socket will
    /// currently accept, dropping fully-written packets. Returns the
    /// number of bytes written. A `WouldBlock` result is swallowed (it
    /// just means "stop for now", not a connection failure); any other
    /// I/O error is propagated to the caller, who treats it as fatal for
    /// the connection.
    pub fn drain_once(&mut self, stream: &TcpStream) -> io::Result<usize> {
        let mut total = 0;
        loop {
            let Some(front) = self.packets.front_mut() else {
                break;
            };
            match stream.try_write(front.remaining()) {
                Ok(n) => {
                    total += n;
                    front.advance(n);
                    if front.is_complete() {
                        self.packets.pop_front();
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_reports_empty() {
        let q = OutputQueue::new();
        assert!(q.is_empty());
    }

    #[test]
    fn pushed_packet_makes_queue_non_empty_until_complete() {
        let mut q = OutputQueue::new();
        q.push_back(Packet::new(1, b"x"));
        assert!(!q.is_empty());
    }
}
