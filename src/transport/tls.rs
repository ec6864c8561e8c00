// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TLS 1.3 mutual authentication, matching the deployment model in
//! spec.md §6: the remote endpoint requires and verifies a client
//! certificate; the local endpoint presents a client certificate but
//! accepts any server certificate (`InsecureSkipVerify` — trust flows from
//! the remote side verifying the client, not the other way around).
//!
//! The `pki_types`-based builder API this module uses is the same shape as
//! `other_examples`' wind-tuic inbound listener
//! (`ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])`),
//! generalized here to also build the client side and to require a client
//! certificate on the server side.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use anyhow::{Context, Result};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    server::WebPkiClientVerifier,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Installs the process-wide default crypto provider (`ring`) if one isn't
/// already installed. Idempotent; call once at each binary's startup before
/// building any `rustls` config.
pub fn install_default_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening certificate file {path:?}"))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates from {path:?}"))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening key file {path:?}"))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parsing private key from {path:?}"))?
        .with_context(|| format!("no private key found in {path:?}"))
}

/// Builds the remote endpoint's TLS acceptor: presents `cert_path`/
/// `key_path`, requires and verifies a client certificate chaining to
/// `ca_path` (the local endpoint's own certificate, per this deployment's
/// single-peer trust model).
pub fn server_acceptor(cert_path: &Path, key_path: &Path, ca_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots.add(cert).context("adding CA certificate to root store")?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("building client certificate verifier")?;

    let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("building server TLS config")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds the local endpoint's TLS connector: presents `cert_path`/
/// `key_path` as the client certificate and does not verify the server's
/// certificate at all.
pub fn client_connector(cert_path: &Path, key_path: &Path) -> Result<TlsConnector> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_client_auth_cert(certs, key)
        .context("building client TLS config")?;

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any server certificate unconditionally. This is the
/// `InsecureSkipVerify` side of the trust model spec.md §6 describes: the
/// remote verifies the client's certificate, so the local side doesn't need
/// to verify the remote's.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
