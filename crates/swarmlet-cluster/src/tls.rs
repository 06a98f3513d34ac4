//! Optional transport TLS for the membership TCP channel.
//!
//! Loads operator-provided PEM material into a rustls acceptor and
//! connector. Payload encryption (the AES-GCM seal) is orthogonal and
//! applies regardless of whether transport TLS is configured.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

use crate::error::{ClusterError, ClusterResult};

/// PEM file locations for the cluster TLS material.
#[derive(Debug, Clone, Default)]
pub struct TlsFiles {
    pub cert_file: String,
    pub key_file: String,
    /// CA bundle peers are verified against. Required.
    pub ca_file: String,
}

/// Loaded TLS state for the membership TCP channel.
#[derive(Clone)]
pub struct TlsMaterial {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
}

/// Load certificate, key and CA bundle into server and client configs.
pub fn load(files: &TlsFiles) -> ClusterResult<TlsMaterial> {
    let certs = read_certs(&files.cert_file)?;
    let key = read_key(&files.key_file)?;

    let mut roots = RootCertStore::empty();
    for ca in read_certs(&files.ca_file)? {
        roots
            .add(ca)
            .map_err(|e| ClusterError::Tls(format!("bad CA certificate: {e}")))?;
    }

    let server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs.clone(), key.clone_key())
        .map_err(|e| ClusterError::Tls(format!("server config: {e}")))?;

    let client = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| ClusterError::Tls(format!("client config: {e}")))?;

    info!(cert = %files.cert_file, ca = %files.ca_file, "cluster transport TLS enabled");

    Ok(TlsMaterial {
        acceptor: TlsAcceptor::from(Arc::new(server)),
        connector: TlsConnector::from(Arc::new(client)),
    })
}

fn read_certs(path: &str) -> ClusterResult<Vec<CertificateDer<'static>>> {
    let file = File::open(Path::new(path))
        .map_err(|e| ClusterError::Tls(format!("cannot open {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClusterError::Tls(format!("cannot parse {path}: {e}")))
}

fn read_key(path: &str) -> ClusterResult<PrivateKeyDer<'static>> {
    let file = File::open(Path::new(path))
        .map_err(|e| ClusterError::Tls(format!("cannot open {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ClusterError::Tls(format!("cannot parse {path}: {e}")))?
        .ok_or_else(|| ClusterError::Tls(format!("no private key in {path}")))
}
