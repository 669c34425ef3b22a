// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Periodic stats sampling: per-operation counters the core produces,
//! plus a CPU-time sample taken once per tick.
//!
//! The original (`mfsmaster/chartsdata.c`) samples CPU time with
//! `setitimer`, rearming a process-wide interval timer on every tick
//! and subtracting it from the previous value. That approach has a
//! documented bug (one branch zeroes the wrong `itimerval` field) and
//! doesn't fit a single-threaded async runtime cleanly — itimers are
//! process-global and fire a signal, which has no safe place to land in
//! a cooperative task. This crate samples cumulative CPU time with
//! `getrusage(RUSAGE_SELF)` each tick instead and derives the delta
//! itself, producing the same per-period user/system seconds without
//! reproducing the rearm-a-signal-timer mechanism or its bug.

use crate::connection::downloader::FileId;

/// Counters the metalogger core increments directly. Unlike the
/// original's per-filesystem-operation table (this process performs no
/// filesystem operations of its own), these track the replication
/// protocol's own activity.
#[derive(Debug, Default, Clone)]
pub struct ProtoCounters {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub nops_sent: u32,
    pub metachanges_appended: u64,
    pub connection_kills: u32,
    pub download_retries_abandoned: u32,
    downloads_completed: [u64; 4],
}

impl ProtoCounters {
    pub(crate) fn downloads_completed_for(&mut self, file_id: FileId) -> &mut u64 {
        &mut self.downloads_completed[Self::slot(file_id)]
    }

    pub fn downloads_completed(&self, file_id: FileId) -> u64 {
        self.downloads_completed[Self::slot(file_id)]
    }

    fn slot(file_id: FileId) -> usize {
        match file_id {
            FileId::Metadata => 0,
            FileId::Sessions => 1,
            FileId::ChangelogBack0 => 2,
            FileId::ChangelogBack1 => 3,
        }
    }
}

/// One user/system CPU-time sample, in microseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuUsage {
    pub user_usec: u64,
    pub system_usec: u64,
}

/// Samples cumulative process CPU time and reports the delta against
/// the previous sample.
pub struct CpuSampler {
    last: CpuUsage,
}

impl CpuSampler {
    pub fn new() -> Self {
        CpuSampler {
            last: cpu_usage_now(),
        }
    }

    /// Returns the CPU time consumed since the previous call (or since
    /// construction, for the first call).
    pub fn sample_delta(&mut self) -> CpuUsage {
        let now = cpu_usage_now();
        let delta = CpuUsage {
            user_usec: now.user_usec.saturating_sub(self.last.user_usec),
            system_usec: now.system_usec.saturating_sub(self.last.system_usec),
        };
        self.last = now;
        delta
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn cpu_usage_now() -> CpuUsage {
    // SAFETY: `rusage` is a plain-old-data struct and `getrusage` only
    // writes into the buffer we pass it.
    let usage = unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        libc::getrusage(libc::RUSAGE_SELF, &mut usage);
        usage
    };
    CpuUsage {
        user_usec: timeval_to_usec(usage.ru_utime),
        system_usec: timeval_to_usec(usage.ru_stime),
    }
}

fn timeval_to_usec(tv: libc::timeval) -> u64 {
    (tv.tv_sec.max(0) as u64) * 1_000_000 + tv.tv_usec.max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_counters_are_tracked_per_file_id() {
        let mut stats = ProtoCounters::default();
        *stats.downloads_completed_for(FileId::Metadata) += 1;
        *stats.downloads_completed_for(FileId::Sessions) += 2;
        assert_eq!(stats.downloads_completed(FileId::Metadata), 1);
        assert_eq!(stats.downloads_completed(FileId::Sessions), 2);
        assert_eq!(stats.downloads_completed(FileId::ChangelogBack0), 0);
    }

    #[test]
    fn cpu_sampler_reports_a_non_negative_delta() {
        let mut sampler = CpuSampler::new();
        let mut total = 0u64;
        for _ in 0..1_000_000 {
            total = total.wrapping_add(1);
        }
        std::hint::black_box(total);
        let delta = sampler.sample_delta();
        assert!(delta.user_usec < u64::MAX);
        assert!(delta.system_usec < u64::MAX);
    }
}
