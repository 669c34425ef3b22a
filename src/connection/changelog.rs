// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Change-log appender: rotates `changelog_ml.*.mfs` on request and
//! appends individual change records as they arrive.

use std::{
    fs::{self, OpenOptions},
    io::Write,
};

use anyhow::{Context, Result, bail};
use tracing::{error, warn};

use crate::connection::Connection;

/// First byte of a change-log packet that means "rotate the backlog",
/// as opposed to a record to append.
const ROTATE_MARKER: u8 = 0x55;

/// First byte of a change-log packet carrying an appendable record.
const RECORD_MARKER: u8 = 0xFF;

fn changelog_path(n: u32) -> String {
    format!("changelog_ml.{n}.mfs")
}

impl Connection {
    /// Dispatches a `MATOML_METACHANGES_LOG` payload: either a rotation
    /// request or a single record to append.
    pub(crate) fn changelog_record(&mut self, payload: &[u8]) -> Result<()> {
        match payload.first() {
            Some(&ROTATE_MARKER) => self.rotate_changelog(),
            Some(&RECORD_MARKER) => self.append_changelog_record(&payload[1..]),
            Some(other) => bail!("unknown changelog marker {other:#x}"),
            None => bail!("empty changelog packet"),
        }
    }

    /// Shifts `changelog_ml.{N-1}.mfs` to `changelog_ml.{N}.mfs` for `N`
    /// from `back_logs_number` down to 1, discarding the oldest, then
    /// closes the current log so the next record opens a fresh
    /// `changelog_ml.0.mfs`.
    fn rotate_changelog(&mut self) -> Result<()> {
        self.log_file = None;

        for n in (1..=self.back_logs_number).rev() {
            let from = changelog_path(n - 1);
            let to = changelog_path(n);
            match fs::rename(&from, &to) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(error = %e, from, to, "changelog rotation rename failed"),
            }
        }

        let _ = fs::remove_file(changelog_path(0));
        Ok(())
    }

    fn append_changelog_record(&mut self, rest: &[u8]) -> Result<()> {
        if rest.len() < 8 {
            bail!("truncated changelog record");
        }
        let (version_bytes, text_with_nul) = rest.split_at(8);
        let version = u64::from_be_bytes(version_bytes.try_into().context("version bytes")?);

        let Some(nul_pos) = text_with_nul.iter().position(|&b| b == 0) else {
            bail!("changelog record missing NUL terminator");
        };
        let text = std::str::from_utf8(&text_with_nul[..nul_pos])
            .context("changelog record is not valid UTF-8")?;

        let line = format!("{version}: {text}\n");

        if self.log_file.is_none() {
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(changelog_path(0))
            {
                Ok(f) => self.log_file = Some(f),
                Err(e) => {
                    error!(error = %e, line, "changelog file unavailable, dropping record");
                    return Ok(());
                }
            }
        }

        if let Some(f) = &mut self.log_file {
            if let Err(e) = f.write_all(line.as_bytes()) {
                error!(error = %e, "failed to append changelog record, dropping it");
                self.log_file = None;
            } else {
                self.stats.metachanges_appended += 1;
            }
        }
        Ok(())
    }

    /// Flushes the open change-log file to disk. Driven by the
    /// supervisor's 1-second flush timer.
    pub fn flush_changelog(&mut self) {
        if let Some(f) = &self.log_file {
            if let Err(e) = f.sync_data() {
                warn!(error = %e, "failed to fsync changelog");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;

    fn in_tempdir() -> TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    fn new_test_connection() -> Connection {
        Connection::new("localhost".to_string(), 9419, None, Duration::from_secs(10), 5)
    }

    fn record_payload(version: u64, text: &str) -> Vec<u8> {
        let mut payload = vec![RECORD_MARKER];
        payload.extend_from_slice(&version.to_be_bytes());
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
        payload
    }

    #[test]
    #[serial]
    fn appending_a_record_creates_and_writes_changelog_0() {
        let dir = in_tempdir();
        let guard = std::env::set_current_dir(dir.path());
        assert!(guard.is_ok());

        let mut conn = new_test_connection();
        conn.changelog_record(&record_payload(42, "SETGOAL(1,1,2)")).expect("append ok");

        let contents = fs::read_to_string("changelog_ml.0.mfs").expect("file exists");
        assert_eq!(contents, "42: SETGOAL(1,1,2)\n");
        assert_eq!(conn.stats.metachanges_appended, 1);
    }

    #[test]
    #[serial]
    fn rotation_shifts_existing_backlog_files() {
        let dir = in_tempdir();
        let guard = std::env::set_current_dir(dir.path());
        assert!(guard.is_ok());

        fs::write("changelog_ml.0.mfs", b"old\n").expect("seed file");

        let mut conn = new_test_connection();
        conn.changelog_record(&[ROTATE_MARKER]).expect("rotate ok");

        assert!(!std::path::Path::new("changelog_ml.0.mfs").exists());
        assert!(std::path::Path::new("changelog_ml.1.mfs").exists());
    }

    #[test]
    fn record_missing_nul_terminator_is_rejected() {
        let mut conn = new_test_connection();
        let mut payload = vec![RECORD_MARKER];
        payload.extend_from_slice(&1u64.to_be_bytes());
        payload.extend_from_slice(b"no terminator");
        assert!(conn.changelog_record(&payload).is_err());
    }
}
