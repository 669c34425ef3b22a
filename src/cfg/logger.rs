// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cfg::config::{LogOutput, LoggerConfig, RotationFrequency};

/// Initializes the global `tracing` subscriber from `cfg`. The returned
/// guard must be held for the lifetime of the process: dropping it
/// stops the non-blocking writer from flushing.
pub fn init_logger(cfg: &LoggerConfig) -> Result<WorkerGuard> {
    let (writer, guard) = make_writer(cfg)?;

    let env_filter = EnvFilter::try_new(&cfg.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("failed to parse log level from config or env")?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false).json())
        .try_init()
        .context("failed to set global default subscriber")?;

    Ok(guard)
}

fn make_writer(cfg: &LoggerConfig) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    match cfg.output {
        LogOutput::Stdout => Ok(tracing_appender::non_blocking(std::io::stdout())),
        LogOutput::Stderr => Ok(tracing_appender::non_blocking(std::io::stderr())),
        LogOutput::File => {
            let path = cfg
                .file
                .as_deref()
                .context("logger.file is required when logger.output = file")?;
            let path = PathBuf::from(path);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));

            let rotation = match cfg.rotation_frequency {
                RotationFrequency::Minutely => Rotation::MINUTELY,
                RotationFrequency::Hourly => Rotation::HOURLY,
                RotationFrequency::Daily => Rotation::DAILY,
                RotationFrequency::Never => Rotation::NEVER,
            };

            let file_appender =
                RollingFileAppender::new(rotation, dir, path.file_name().unwrap_or_default());
            Ok(tracing_appender::non_blocking(file_appender))
        }
    }
}
