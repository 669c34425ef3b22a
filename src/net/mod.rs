// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire-level building blocks: the framing codec, outgoing packet
//! buffers, and the FIFO output queue that drains them onto the socket.

pub mod codec;
pub mod output_queue;
pub mod packet;
pub mod types;

pub use codec::{HEADER_LEN, MAX_PACKET_SIZE};
pub use packet::Packet;
pub use types::PacketType;
