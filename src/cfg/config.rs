// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Optional YAML configuration file, merged under CLI flags: any flag the
//! user sets on the command line wins over the corresponding file value,
//! which in turn wins over the built-in default.

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cfg::cli::{LocalArgs, RemoteArgs};

const DEFAULT_REMOTE: &str = "127.0.0.1:18443";
const DEFAULT_SOCKS5_PORT: u16 = 3127;
const DEFAULT_HTTP_PORT: u16 = 3128;
const DEFAULT_REMOTE_PORT: u16 = 18443;

/// Raw file contents; every field is optional so a partial config is valid.
#[derive(Debug, Default, Deserialize, Serialize, Clone)]
pub struct Config {
    pub remote: Option<String>,
    pub socks5_port: Option<u16>,
    pub http_port: Option<u16>,
    pub port: Option<u16>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub no_tls: Option<bool>,
}

impl Config {
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing config file {path:?}"))
    }

    /// Loads `path` if given, else falls back to an all-`None` default.
    pub fn load_optional(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from_file(p),
            None => Ok(Self::default()),
        }
    }
}

/// Fully resolved settings for the local endpoint, CLI > file > built-in
/// default.
#[derive(Debug, Clone)]
pub struct LocalSettings {
    pub remote: String,
    pub socks5_port: u16,
    pub http_port: u16,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub use_tls: bool,
    pub verbose: u8,
}

impl LocalSettings {
    pub fn resolve(args: &LocalArgs, file: &Config) -> Result<Self> {
        let remote = args
            .remote
            .clone()
            .or_else(|| file.remote.clone())
            .unwrap_or_else(|| DEFAULT_REMOTE.to_string());
        let socks5_port = args.socks5.or(file.socks5_port).unwrap_or(DEFAULT_SOCKS5_PORT);
        let http_port = args.http.or(file.http_port).unwrap_or(DEFAULT_HTTP_PORT);
        let use_tls = !(args.no_tls || file.no_tls.unwrap_or(false));
        let cert = args.cert.clone().or_else(|| file.cert.clone());
        let key = args.key.clone().or_else(|| file.key.clone());
        if use_tls {
            cert.as_ref().context("--cert is required unless --no-tls is set")?;
            key.as_ref().context("--key is required unless --no-tls is set")?;
        }
        Ok(Self {
            remote,
            socks5_port,
            http_port,
            cert,
            key,
            use_tls,
            verbose: args.verbose,
        })
    }
}

/// Fully resolved settings for the remote endpoint, CLI > file > built-in
/// default.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub port: u16,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub use_tls: bool,
    pub verbose: u8,
}

impl RemoteSettings {
    pub fn resolve(args: &RemoteArgs, file: &Config) -> Result<Self> {
        let port = args.port.or(file.port).unwrap_or(DEFAULT_REMOTE_PORT);
        let use_tls = !(args.no_tls || file.no_tls.unwrap_or(false));
        let cert = args.cert.clone().or_else(|| file.cert.clone());
        let key = args.key.clone().or_else(|| file.key.clone());
        let ca = args.ca.clone().or_else(|| file.ca.clone());
        if use_tls {
            cert.as_ref().context("--cert is required unless --no-tls is set")?;
            key.as_ref().context("--key is required unless --no-tls is set")?;
            ca.as_ref().context("--ca is required unless --no-tls is set")?;
        }
        Ok(Self {
            port,
            cert,
            key,
            ca,
            use_tls,
            verbose: args.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_settings_apply_defaults_when_nothing_set() {
        let args = LocalArgs {
            config: None,
            remote: None,
            socks5: None,
            http: None,
            cert: None,
            key: None,
            no_tls: true,
            verbose: 0,
        };
        let settings = LocalSettings::resolve(&args, &Config::default()).expect("resolve");
        assert_eq!(settings.remote, DEFAULT_REMOTE);
        assert_eq!(settings.socks5_port, DEFAULT_SOCKS5_PORT);
        assert_eq!(settings.http_port, DEFAULT_HTTP_PORT);
        assert!(!settings.use_tls);
    }

    #[test]
    fn cli_flag_overrides_file_value() {
        let args = LocalArgs {
            config: None,
            remote: Some("10.0.0.1:9000".to_string()),
            socks5: None,
            http: None,
            cert: None,
            key: None,
            no_tls: true,
            verbose: 0,
        };
        let file = Config {
            remote: Some("127.0.0.1:1".to_string()),
            ..Config::default()
        };
        let settings = LocalSettings::resolve(&args, &file).expect("resolve");
        assert_eq!(settings.remote, "10.0.0.1:9000");
    }

    #[test]
    fn tls_requires_cert_and_key() {
        let args = LocalArgs {
            config: None,
            remote: None,
            socks5: None,
            http: None,
            cert: None,
            key: None,
            no_tls: false,
            verbose: 0,
        };
        assert!(LocalSettings::resolve(&args, &Config::default()).is_err());
    }
}
