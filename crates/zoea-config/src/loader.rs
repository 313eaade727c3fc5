// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::{Config, Credentials};

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/zoea/config.toml"));

    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("zoea/config.toml"));
    }

    paths.push(PathBuf::from(".zoea.toml"));
    paths.push(PathBuf::from("config.toml"));

    paths
}

/// `ZOEA_<PROVIDER>_<FIELD>` overrides only apply to these two default
/// config keys (spec.md §6).
const ENV_OVERRIDE_PROVIDERS: &[&str] = &["ollama", "opencode_zen"];
const ENV_OVERRIDE_FIELDS: &[&str] = &["endpoint", "model", "temperature", "rate_limit", "rate_burst"];

/// Overlay `ZOEA_<PROVIDER>_<FIELD>` environment variables onto
/// `[providers.ollama]`/`[providers.opencode_zen]`, creating either table
/// if a var is set but the file layers never defined it.
fn apply_env_overrides(merged: &mut toml::Value) {
    for provider in ENV_OVERRIDE_PROVIDERS {
        for field in ENV_OVERRIDE_FIELDS {
            let var = format!("ZOEA_{}_{}", provider.to_uppercase(), field.to_uppercase());
            let Ok(raw) = std::env::var(&var) else {
                continue;
            };
            debug!(var = %var, "applying config env override");

            let providers = merged
                .as_table_mut()
                .expect("merged config root is always a table")
                .entry("providers")
                .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
            let provider_table = providers
                .as_table_mut()
                .expect("providers is always a table")
                .entry(*provider)
                .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
            let table = provider_table
                .as_table_mut()
                .expect("provider entry is always a table");

            let value = match *field {
                "temperature" => raw
                    .parse::<f64>()
                    .map(toml::Value::Float)
                    .unwrap_or(toml::Value::String(raw)),
                "rate_limit" | "rate_burst" => raw
                    .parse::<i64>()
                    .map(toml::Value::Integer)
                    .unwrap_or(toml::Value::String(raw)),
                _ => toml::Value::String(raw),
            };
            table.insert((*field).to_string(), value);
        }
    }
}

/// Load configuration by merging all discovered TOML files, then the
/// `ZOEA_<PROVIDER>_<FIELD>` environment overrides, then finally the
/// explicit `--config` path, which always wins.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = toml::Value::Table(toml::map::Map::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: toml::Value = toml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_toml(&mut merged, layer);
        }
    }

    apply_env_overrides(&mut merged);

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: toml::Value =
            toml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_toml(&mut merged, layer);
    }

    let config: Config = if matches!(merged, toml::Value::Table(ref t) if t.is_empty()) {
        Config::default()
    } else {
        merged.try_into().unwrap_or_default()
    };
    Ok(config)
}

/// Load the credentials file, if present. Missing file is not an error —
/// it simply yields an empty credential set (all providers must then rely
/// on environment overrides or be unauthenticated, e.g. local Ollama).
pub fn load_credentials(path: Option<&Path>) -> anyhow::Result<Credentials> {
    let default_path = dirs::config_dir().map(|d| d.join("zoea/credentials.toml"));
    let path = path.map(Path::to_path_buf).or(default_path);

    let Some(path) = path else {
        return Ok(Credentials::default());
    };
    if !path.is_file() {
        return Ok(Credentials::default());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(&path) {
            let mode = meta.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                tracing::warn!(path = %path.display(), mode = format!("{mode:o}"), "credentials file is readable by group/other");
            }
        }
    }

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let creds: Credentials =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(creds)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_toml(dst: &mut toml::Value, src: toml::Value) {
    match (dst, src) {
        (toml::Value::Table(d), toml::Value::Table(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(toml::Value::Table(toml::map::Map::new()));
                merge_toml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}
