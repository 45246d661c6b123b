//! Self-signed TLS shim
//!
//! When the mirror binds the standard HTTPS port it serves a
//! certificate generated fresh at startup and never persisted. The
//! SANs cover `localhost`, the intercepted registry hostname, and
//! every non-loopback IPv4 of the host, so a client redirected here by
//! DNS completes the handshake. Clients that pin certificates will
//! refuse it and bypass the cache.

use anyhow::{Context, Result};
use axum::Router;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rsa::RsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// An in-memory certificate and private key
pub struct SelfSignedCert {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

/// Generate a fresh RSA-2048 self-signed certificate valid for one
/// year, with SANs for `localhost`, the intercepted hostname, and the
/// given host addresses.
pub fn self_signed_certificate(
    intercept_host: &str,
    host_addresses: &[Ipv4Addr],
) -> Result<SelfSignedCert> {
    // rcgen cannot generate RSA keys itself, so the key comes from the
    // rsa crate and is handed over as PKCS#8.
    let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
        .context("Failed to generate RSA key")?;
    let key_pkcs8 = key
        .to_pkcs8_der()
        .context("Failed to encode private key")?;
    let key_pair = KeyPair::try_from(key_pkcs8.as_bytes())
        .context("Failed to load private key for signing")?;

    let mut params =
        CertificateParams::new(vec!["localhost".to_string(), intercept_host.to_string()])
            .context("Invalid certificate names")?;
    for ip in host_addresses {
        params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(*ip)));
    }

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, intercept_host);
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(365);

    let cert = params
        .self_signed(&key_pair)
        .context("Failed to self-sign certificate")?;

    info!(
        "Generated self-signed certificate for {} (+{} host addresses, 1 year validity)",
        intercept_host,
        host_addresses.len()
    );

    Ok(SelfSignedCert {
        cert_der: cert.der().clone(),
        key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pkcs8.as_bytes().to_vec())),
    })
}

/// Serve the router over TLS until the shutdown signal flips.
///
/// Each accepted connection gets its own worker; handshake failures
/// only drop that connection.
pub async fn serve_https(
    addr: SocketAddr,
    app: Router,
    cert: SelfSignedCert,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert_der], cert.key_der)
        .context("Failed to build TLS config")?;
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTPS listener on {}", addr))?;
    info!("HTTPS listening on {} (self-signed)", addr);

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => {
                info!("HTTPS listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("HTTPS accept failed")?;
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(e) => {
                            debug!("TLS handshake with {} failed: {}", peer, e);
                            return;
                        }
                    };
                    let service = hyper_util::service::TowerToHyperService::new(app);
                    if let Err(e) = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    )
                    .serve_connection_with_upgrades(hyper_util::rt::TokioIo::new(tls_stream), service)
                    .await
                    {
                        debug!("Connection from {} ended with error: {}", peer, e);
                    }
                });
            }
        }
    }
}
