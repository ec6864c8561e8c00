// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Command-line surface for the two endpoint binaries, via `clap`'s derive
//! API. Flags always win over a value loaded from `--config`; see
//! `cfg::config::LocalSettings::resolve`/`RemoteSettings::resolve`.

use std::path::PathBuf;

use clap::Parser;

/// The local endpoint: exposes SOCKS5 and HTTP proxy ports, dials the
/// remote endpoint through a session pool.
#[derive(Debug, Parser, Clone)]
#[command(name = "tunnelmux-local", about = "Local multiplexer endpoint (SOCKS5/HTTP proxy)")]
pub struct LocalArgs {
    /// Optional YAML config file; CLI flags override values it sets.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Remote endpoint address to dial.
    #[arg(long)]
    pub remote: Option<String>,

    /// Local port to accept SOCKS5 connections on.
    #[arg(long)]
    pub socks5: Option<u16>,

    /// Local port to accept HTTP proxy connections on.
    #[arg(long)]
    pub http: Option<u16>,

    /// Client certificate presented to the remote endpoint during the TLS
    /// handshake.
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Private key matching `--cert`.
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Dial the remote endpoint over plaintext TCP instead of TLS.
    #[arg(long)]
    pub no_tls: bool,

    /// Increase log verbosity; repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// The remote endpoint: accepts sessions from the local endpoint and dials
/// the destinations announced by each stream's Hello.
#[derive(Debug, Parser, Clone)]
#[command(name = "tunnelmux-remote", about = "Remote multiplexer endpoint")]
pub struct RemoteArgs {
    /// Optional YAML config file; CLI flags override values it sets.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Port to accept multiplexed sessions on.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Server certificate presented to local endpoints.
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Private key matching `--cert`.
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// CA certificate used to verify connecting local endpoints' client
    /// certificates.
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Accept plaintext TCP instead of TLS.
    #[arg(long)]
    pub no_tls: bool,

    /// Increase log verbosity; repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
