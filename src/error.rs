// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Small, well-tested error types for the framing layer.
//!
//! Everything above the codec uses `anyhow`; decode failures that the
//! connection FSM needs to distinguish (oversized vs. merely malformed)
//! get their own `thiserror` type so callers can match on them instead of
//! string-sniffing an `anyhow::Error`.

use thiserror::Error;

/// Failure decoding an 8-byte frame header or interpreting the declared
/// payload size against protocol limits.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("packet too long ({size}/{max})")]
    Oversized { size: u32, max: u32 },
}

/// Reason a download request could not be satisfied by the current state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DownloadError {
    #[error("unexpected file id {0}")]
    UnknownFileId(u8),
}
