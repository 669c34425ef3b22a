// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Metadata/session/changelog snapshot download: request a file by id,
//! pull it block by block with CRC-32 verification and bounded retry,
//! then chain into the next file the original always downloads
//! alongside it.

use std::{
    fs::{self, File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    time::Instant,
};

use anyhow::{Context, Result, bail};
use crc::{CRC_32_ISO_HDLC, Crc};
use tracing::{info, warn};

use crate::{
    connection::Connection,
    error::DownloadError,
    net::{
        codec::{MAX_BLOCK_RETRIES, META_DL_BLOCK, get_u32, get_u64},
        types,
    },
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Which snapshot file is being downloaded. Numbering matches the
/// on-wire ids the master expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileId {
    Metadata = 1,
    Sessions = 2,
    ChangelogBack0 = 11,
    ChangelogBack1 = 12,
}

impl FileId {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the two changelog-backup legs of the metadata chain;
    /// used to detect "old master" behavior when a connection is
    /// killed mid-chain.
    pub fn is_chained_step(self) -> bool {
        matches!(self, FileId::ChangelogBack0 | FileId::ChangelogBack1)
    }

    fn temp_path(self) -> &'static str {
        match self {
            FileId::Metadata => "metadata_ml.tmp",
            FileId::Sessions => "sessions_ml.tmp",
            FileId::ChangelogBack0 | FileId::ChangelogBack1 => "changelog_ml.tmp",
        }
    }

    fn final_path(self) -> &'static str {
        match self {
            FileId::Metadata => "metadata_ml.mfs.back",
            FileId::Sessions => "sessions_ml.mfs",
            FileId::ChangelogBack0 => "changelog_ml_back.0.mfs",
            FileId::ChangelogBack1 => "changelog_ml_back.1.mfs",
        }
    }

    /// The next file to request once this one finishes, or `None` at
    /// the end of the chain. `old_master_mode` skips straight from
    /// metadata to sessions, bypassing the changelog-backup legs,
    /// matching masters too old to serve them.
    fn next(self, old_master_mode: bool) -> Option<FileId> {
        match self {
            FileId::Metadata if old_master_mode => Some(FileId::Sessions),
            FileId::Metadata => Some(FileId::ChangelogBack0),
            FileId::ChangelogBack0 => Some(FileId::ChangelogBack1),
            FileId::ChangelogBack1 => Some(FileId::Sessions),
            FileId::Sessions => None,
        }
    }
}

impl TryFrom<u8> for FileId {
    type Error = DownloadError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FileId::Metadata),
            2 => Ok(FileId::Sessions),
            11 => Ok(FileId::ChangelogBack0),
            12 => Ok(FileId::ChangelogBack1),
            other => Err(DownloadError::UnknownFileId(other)),
        }
    }
}

/// In-flight download state, live from the `MATOML_DOWNLOAD_START`
/// reply that grants a file size until the file is fully written.
pub struct Downloading {
    pub(crate) file_id: FileId,
    file: File,
    file_size: u64,
    dl_offset: u64,
    retry_count: u8,
    #[allow(dead_code)]
    start_time: Instant,
}

impl Connection {
    /// Sends a `MLTOMA_DOWNLOAD_START` request for `file_id`. The
    /// caller (the supervisor, on its periodic download timers) is
    /// responsible for not issuing a second request while one is
    /// already in flight.
    pub fn request_download(&mut self, file_id: FileId) {
        if self.downloading.is_some() {
            warn!(
                in_progress = ?self.downloading_file_id(),
                "download already in progress, ignoring request"
            );
            return;
        }
        self.queue_download_start(file_id);
    }

    fn downloading_file_id(&self) -> Option<u8> {
        self.downloading.as_ref().map(|d| d.file_id.as_u8())
    }

    fn queue_download_start(&mut self, file_id: FileId) {
        self.pending_start = Some(file_id);
        self.queue_packet(types::MLTOMA_DOWNLOAD_START, &[file_id.as_u8()]);
    }

    pub(crate) fn handle_download_start(&mut self, payload: &[u8]) -> Result<()> {
        let Some(file_id) = self.pending_start.take() else {
            bail!("unexpected MATOML_DOWNLOAD_START with no request pending");
        };

        match payload.len() {
            1 => {
                info!(?file_id, reason = payload[0], "master refused download");
                Ok(())
            }
            8 => {
                let mut cursor = payload;
                let file_size =
                    get_u64(&mut cursor).context("truncated download-start reply")?;

                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(file_id.temp_path())
                    .with_context(|| format!("opening {}", file_id.temp_path()))?;

                self.downloading = Some(Downloading {
                    file_id,
                    file,
                    file_size,
                    dl_offset: 0,
                    retry_count: 0,
                    start_time: Instant::now(),
                });

                if file_size == 0 {
                    self.finish_download()
                } else {
                    self.request_next_block();
                    Ok(())
                }
            }
            other => bail!("MATOML_DOWNLOAD_START wrong size ({other}/1|8)"),
        }
    }

    /// Requests the next block: `offset:u64 | length:u32`, with `length`
    /// capped at `META_DL_BLOCK` so no single block exceeds it.
    fn request_next_block(&mut self) {
        let Some(dl) = &self.downloading else {
            return;
        };
        let remaining = dl.file_size - dl.dl_offset;
        let length = remaining.min(META_DL_BLOCK) as u32;
        let offset = dl.dl_offset;

        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&offset.to_be_bytes());
        payload.extend_from_slice(&length.to_be_bytes());
        self.queue_packet(types::MLTOMA_DOWNLOAD_DATA, &payload);
    }

    pub(crate) fn handle_download_data(&mut self, payload: &[u8]) -> Result<()> {
        let Some(dl) = &self.downloading else {
            bail!("download data with no download in progress");
        };
        if payload.len() < 16 {
            bail!("MATOML_DOWNLOAD_DATA wrong size ({}/16+data)", payload.len());
        }

        let mut cursor = payload;
        let offset = get_u64(&mut cursor).context("truncated download-data header")?;
        let declared_length = get_u32(&mut cursor).context("truncated download-data header")?;
        let crc_wire = get_u32(&mut cursor).context("truncated download-data header")?;

        if declared_length as usize + 16 != payload.len() {
            bail!(
                "MATOML_DOWNLOAD_DATA wrong size ({}/16+{declared_length})",
                payload.len()
            );
        }
        if offset != dl.dl_offset {
            bail!("download data offset {offset}, expected {}", dl.dl_offset);
        }
        if offset + u64::from(declared_length) > dl.file_size {
            bail!("download data overruns declared file size");
        }

        let data = cursor;

        match self.write_verified_block(offset, data, crc_wire) {
            Ok(()) => {
                let Some(dl) = &mut self.downloading else {
                    bail!("download state vanished mid-write");
                };
                dl.dl_offset += u64::from(declared_length);
                dl.retry_count = 0;
                if dl.dl_offset < dl.file_size {
                    self.request_next_block();
                } else {
                    self.finish_download()?;
                }
            }
            Err(e) => {
                warn!(error = %e, offset, "download block failed, retrying");
                let Some(dl) = &mut self.downloading else {
                    bail!("download state vanished mid-retry");
                };
                dl.retry_count += 1;
                if dl.retry_count >= MAX_BLOCK_RETRIES {
                    warn!(file_id = ?dl.file_id, "exceeded retry budget, aborting download");
                    self.abort_download();
                } else {
                    self.request_next_block();
                }
            }
        }
        Ok(())
    }

    /// Writes the block, then checks its CRC, then fsyncs — in that
    /// order, matching `masterconn_download_data`: any of the three can
    /// fail independently and each failure counts against the same
    /// retry budget.
    fn write_verified_block(&mut self, offset: u64, data: &[u8], crc_wire: u32) -> Result<()> {
        if data.len() as u64 > META_DL_BLOCK {
            bail!("block exceeds META_DL_BLOCK");
        }

        let Some(dl) = &mut self.downloading else {
            bail!("no download in progress");
        };
        dl.file.seek(SeekFrom::Start(offset))?;
        dl.file.write_all(data)?;

        let mut digest = CRC32.digest();
        digest.update(data);
        if digest.finalize() != crc_wire {
            bail!("crc mismatch");
        }

        let Some(dl) = &mut self.downloading else {
            bail!("no download in progress");
        };
        dl.file.sync_all()?;
        Ok(())
    }

    /// Finalizes a fully-received file: renames the temp file into
    /// place, advances to the next file in the chain if any, and
    /// unconditionally clears `downloading` — matching the original's
    /// `masterconn_download_end`, which zeroes the field regardless of
    /// how the download got here.
    fn finish_download(&mut self) -> Result<()> {
        let Some(dl) = self.downloading.take() else {
            bail!("finish_download called with no download in progress");
        };
        dl.file.sync_all().context("fsync before rename")?;
        drop(dl.file);
        fs::rename(dl.file_id.temp_path(), dl.file_id.final_path())
            .with_context(|| format!("renaming {}", dl.file_id.temp_path()))?;

        self.queue_packet(types::MLTOMA_DOWNLOAD_END, &[]);
        *self.downloads_completed_mut(dl.file_id) += 1;
        info!(file_id = ?dl.file_id, "download complete");

        if let Some(next) = dl.file_id.next(self.old_master_mode) {
            self.queue_download_start(next);
        }
        Ok(())
    }

    fn downloads_completed_mut(&mut self, file_id: FileId) -> &mut u64 {
        self.stats.downloads_completed_for(file_id)
    }

    /// Drops any in-flight download without finalizing it: the temp
    /// file is removed and `downloading` is cleared. Called on
    /// connection teardown or after exhausting the retry budget.
    pub(crate) fn abort_download(&mut self) {
        let Some(dl) = self.downloading.take() else {
            return;
        };
        drop(dl.file);
        let _ = fs::remove_file(dl.file_id.temp_path());
        self.queue_packet(types::MLTOMA_DOWNLOAD_END, &[]);
        self.stats.download_retries_abandoned += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;
    use crate::connection::Connection;

    fn in_tempdir() -> TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    fn new_test_connection() -> Connection {
        Connection::new("localhost".to_string(), 9419, None, Duration::from_secs(10), 50)
    }

    fn download_start_reply(size: u64) -> Vec<u8> {
        size.to_be_bytes().to_vec()
    }

    fn data_block(offset: u64, data: &[u8]) -> Vec<u8> {
        let crc = CRC32.checksum(data);
        let mut payload = Vec::with_capacity(16 + data.len());
        payload.extend_from_slice(&offset.to_be_bytes());
        payload.extend_from_slice(&(data.len() as u32).to_be_bytes());
        payload.extend_from_slice(&crc.to_be_bytes());
        payload.extend_from_slice(data);
        payload
    }

    #[test]
    #[serial]
    fn full_download_writes_file_and_chains_to_changelog_backup() {
        let dir = in_tempdir();
        assert!(std::env::set_current_dir(dir.path()).is_ok());

        let mut conn = new_test_connection();
        conn.request_download(FileId::Metadata);
        assert_eq!(conn.pending_start, Some(FileId::Metadata));

        let data = b"hello metadata";
        conn.handle_download_start(&download_start_reply(data.len() as u64))
            .expect("start accepted");
        conn.handle_download_data(&data_block(0, data)).expect("block accepted");

        assert!(conn.downloading.is_none());
        assert_eq!(conn.stats.downloads_completed(FileId::Metadata), 1);
        assert_eq!(
            fs::read("metadata_ml.mfs.back").expect("final file exists"),
            data
        );
        // the chain continues into the changelog backup leg
        assert_eq!(conn.pending_start, Some(FileId::ChangelogBack0));
    }

    #[test]
    #[serial]
    fn old_master_mode_skips_the_changelog_backup_legs() {
        let dir = in_tempdir();
        assert!(std::env::set_current_dir(dir.path()).is_ok());

        let mut conn = new_test_connection();
        conn.old_master_mode = true;
        conn.request_download(FileId::Metadata);

        let data = b"x";
        conn.handle_download_start(&download_start_reply(1)).expect("start ok");
        conn.handle_download_data(&data_block(0, data)).expect("block ok");

        assert_eq!(conn.pending_start, Some(FileId::Sessions));
    }

    #[test]
    #[serial]
    fn crc_mismatch_retries_the_same_offset_without_advancing() {
        let dir = in_tempdir();
        assert!(std::env::set_current_dir(dir.path()).is_ok());

        let mut conn = new_test_connection();
        conn.request_download(FileId::Metadata);
        conn.handle_download_start(&download_start_reply(4)).expect("start ok");

        let mut bad = data_block(0, b"abcd");
        // flip the crc so verification fails.
        let crc_start = bad.len() - 4 - 4;
        bad[crc_start] ^= 0xFF;
        conn.handle_download_data(&bad).expect("handled without fatal error");

        let dl = conn.downloading.as_ref().expect("still downloading");
        assert_eq!(dl.dl_offset, 0);
        assert_eq!(dl.retry_count, 1);
    }

    #[test]
    #[serial]
    fn exhausting_the_retry_budget_aborts_the_download() {
        let dir = in_tempdir();
        assert!(std::env::set_current_dir(dir.path()).is_ok());

        let mut conn = new_test_connection();
        conn.request_download(FileId::Metadata);
        conn.handle_download_start(&download_start_reply(4)).expect("start ok");

        let mut bad = data_block(0, b"abcd");
        let crc_start = bad.len() - 4 - 4;
        bad[crc_start] ^= 0xFF;

        for _ in 0..MAX_BLOCK_RETRIES {
            conn.handle_download_data(&bad).expect("handled without fatal error");
        }

        assert!(conn.downloading.is_none());
        assert_eq!(conn.stats.download_retries_abandoned, 1);
    }

    #[test]
    fn file_id_round_trips_through_try_from() {
        for id in [1u8, 2, 11, 12] {
            assert_eq!(FileId::try_from(id).expect("known id").as_u8(), id);
        }
        assert!(FileId::try_from(99).is_err());
    }
}
