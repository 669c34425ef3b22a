// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Owns the one [`Connection`] and drives it from a single
//! `tokio::select!` loop: no locks, no spawned subtasks, no reentrant
//! entry into the connection state machine.

use std::time::Duration;

use anyhow::Result;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::Config,
    connection::{Connection, ConnectionMode, downloader::FileId},
    stats::CpuSampler,
};

/// Offset, in seconds, into the first metadata-download period before
/// the first download fires. Matches the original's
/// `main_timeregister(TIMEMODE_RUNONCE, MetaDLFreq*3600, 630, ...)`.
const META_DOWNLOAD_OFFSET_SECS: u64 = 630;
const SESSIONS_DOWNLOAD_PERIOD_SECS: u64 = 60;
const CHANGELOG_FLUSH_PERIOD_SECS: u64 = 1;
const STATS_SAMPLE_PERIOD_SECS: u64 = 60;

pub struct Supervisor {
    connection: Connection,
    reconnect_timer: Interval,
    meta_download_timer: Interval,
    sessions_download_timer: Interval,
    flush_timer: Interval,
    stats_timer: Interval,
    cpu_sampler: CpuSampler,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(cfg: &Config) -> Self {
        let connection = Connection::new(
            cfg.master.host.clone(),
            cfg.master.port,
            cfg.master.bind_host,
            cfg.master.timeout,
            cfg.retention.back_logs_number,
        );

        let meta_download_period =
            Duration::from_secs(u64::from(cfg.retention.meta_download_freq) * 3600);

        let reconnect_timer = interval_with_delay(cfg.master.reconnection_delay);
        let meta_download_timer = delayed_interval(
            meta_download_period.max(Duration::from_secs(1)),
            Duration::from_secs(META_DOWNLOAD_OFFSET_SECS),
        );
        let sessions_download_timer =
            interval_with_delay(Duration::from_secs(SESSIONS_DOWNLOAD_PERIOD_SECS));
        let flush_timer = interval_with_delay(Duration::from_secs(CHANGELOG_FLUSH_PERIOD_SECS));
        let stats_timer = interval_with_delay(Duration::from_secs(STATS_SAMPLE_PERIOD_SECS));

        Supervisor {
            connection,
            reconnect_timer,
            meta_download_timer,
            sessions_download_timer,
            flush_timer,
            stats_timer,
            cpu_sampler: CpuSampler::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// A handle that, when cancelled, causes [`Supervisor::run`] to
    /// shut the connection down cleanly and return.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Clears the cached master address, forcing the next connect to
    /// re-resolve it. Intended for a future SIGHUP handler.
    pub fn reload(&mut self) {
        self.connection.reload();
    }

    /// Runs until cancelled. Exactly one branch (`io_tick`) ever borrows
    /// `&mut self.connection` as its scrutinee future; every other
    /// branch borrows only its own timer and touches the connection
    /// only in its body, after `select!` has already resolved and
    /// dropped the other futures.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if matches!(self.connection.mode, ConnectionMode::Free) {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.reconnect_timer.tick() => {
                        if let Err(e) = self.connection.begin_connect() {
                            warn!(error = %e, "failed to start connecting, will retry");
                        }
                    }
                }
                continue;
            }

            if matches!(self.connection.mode, ConnectionMode::Kill) {
                self.connection.finish_kill();
                continue;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = self.connection.io_tick() => {
                    if let Err(e) = res {
                        warn!(error = %e, "io_tick failed, killing connection");
                        self.connection.mode = ConnectionMode::Kill;
                    }
                }
                _ = self.meta_download_timer.tick() => {
                    self.connection.request_download(FileId::Metadata);
                }
                _ = self.sessions_download_timer.tick() => {
                    self.connection.request_download(FileId::Sessions);
                }
                _ = self.flush_timer.tick() => {
                    self.connection.flush_changelog();
                    self.connection.check_timeouts();
                }
                _ = self.stats_timer.tick() => {
                    let usage = self.cpu_sampler.sample_delta();
                    info!(
                        user_usec = usage.user_usec,
                        system_usec = usage.system_usec,
                        bytes_in = self.connection.stats.bytes_in,
                        bytes_out = self.connection.stats.bytes_out,
                        "stats tick"
                    );
                }
            }
        }

        self.shutdown_connection();
        Ok(())
    }

    fn shutdown_connection(&mut self) {
        info!("shutting down");
        self.connection.finish_kill();
    }
}

fn interval_with_delay(period: Duration) -> Interval {
    let mut interval = time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// An interval whose first tick fires after `offset` instead of
/// immediately, matching the original's `TIMEMODE_RUNONCE` one-shot
/// delay ahead of the recurring period.
fn delayed_interval(period: Duration, offset: Duration) -> Interval {
    let start = time::Instant::now() + offset.min(period);
    let mut interval = time::interval_at(start, period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::config::{LoggerConfig, MasterConfig, RetentionConfig};

    fn test_config() -> Config {
        Config {
            master: MasterConfig {
                host: "localhost".to_string(),
                port: 9419,
                bind_host: None,
                reconnection_delay: Duration::from_secs(1),
                timeout: Duration::from_secs(10),
            },
            retention: RetentionConfig {
                back_logs_number: 50,
                meta_download_freq: 1,
            },
            logger: LoggerConfig::default(),
        }
    }

    #[tokio::test]
    async fn new_supervisor_starts_with_a_free_connection() {
        let cfg = test_config();
        let supervisor = Supervisor::new(&cfg);
        assert!(matches!(supervisor.connection.mode, ConnectionMode::Free));
    }

    #[tokio::test]
    async fn cancelling_the_shutdown_handle_ends_run() {
        let cfg = test_config();
        let mut supervisor = Supervisor::new(&cfg);
        let handle = supervisor.shutdown_handle();
        handle.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), supervisor.run()).await;
        assert!(result.is_ok(), "run() should return promptly once cancelled");
    }
}
