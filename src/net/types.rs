// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire packet type codes.
//!
//! Kept as plain `u32` constants rather than a closed enum: unrecognized
//! types must flow through to the connection's "ignore unknown packet"
//! path rather than fail to parse.

pub type PacketType = u32;

/// Bidirectional keep-alive with no payload.
pub const ANTOAN_NOP: PacketType = 0;

/// Metalogger -> master: register this connection as a metalogger.
pub const MLTOMA_REGISTER: PacketType = 1200;

/// Metalogger -> master: request the next chunk of a file download.
pub const MLTOMA_DOWNLOAD_START: PacketType = 1201;

/// Master -> metalogger: reply to a download start request.
pub const MATOML_DOWNLOAD_START: PacketType = 1202;

/// Metalogger -> master: request a block of download data.
pub const MLTOMA_DOWNLOAD_DATA: PacketType = 1203;

/// Master -> metalogger: a block of download data.
pub const MATOML_DOWNLOAD_DATA: PacketType = 1204;

/// Metalogger -> master: download finished, release resources.
pub const MLTOMA_DOWNLOAD_END: PacketType = 1205;

/// Master -> metalogger: a change-log record or rotation marker.
pub const MATOML_METACHANGES_LOG: PacketType = 1206;
