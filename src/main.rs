// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use metalogger_rs::{
    cfg::{cli, config::Config, logger::init_logger},
    supervisor::Supervisor,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config_arg = cli::config_path_from_args(std::env::args());
    let config_path = cli::resolve_config_path(&config_arg)
        .context("failed to resolve config path")?;

    let cfg = Config::load_from_file(&config_path)
        .with_context(|| format!("failed to load config from {config_path:?}"))?;

    let _logger_guard = init_logger(&cfg.logger)?;

    info!(master = %cfg.master.host, port = cfg.master.port, "starting metalogger");

    let mut supervisor = Supervisor::new(&cfg);
    let shutdown = supervisor.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    supervisor.run().await
}
