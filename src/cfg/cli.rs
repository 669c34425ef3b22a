// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const DEFAULT_CONFIG_PATH: &str = "metalogger.yaml";

pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// Picks the config path off argv, falling back to [`DEFAULT_CONFIG_PATH`].
pub fn config_path_from_args<I: IntoIterator<Item = String>>(args: I) -> String {
    args.into_iter()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_argv_falls_back_to_default() {
        let args: Vec<String> = vec!["metalogger".to_string()];
        assert_eq!(config_path_from_args(args), DEFAULT_CONFIG_PATH);
    }

    #[test]
    fn explicit_argv_wins() {
        let args: Vec<String> =
            vec!["metalogger".to_string(), "/etc/metalogger.yaml".to_string()];
        assert_eq!(config_path_from_args(args), "/etc/metalogger.yaml");
    }
}
