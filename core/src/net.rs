/*
 * net.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Traghetto, a cross-platform file transfer client.
 *
 * Traghetto is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Traghetto is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Traghetto.  If not, see <http://www.gnu.org/licenses/>.
 */

//! TLS connection helpers: wrap TcpStream with rustls (implicit TLS, AUTH
//! TLS upgrade mid-session).
//!
//! FTP needs an interactive trust decision: the handshake completes with a
//! capturing verifier that records the presented chain and the out-of-band
//! webpki verdict, the engine raises its certificate prompt before any
//! credentials are sent, and an accepted fingerprint is pinned for the data
//! connections of the same session.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as TokioTlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

/// Build a root certificate store: platform native certs first, then
/// webpki-roots as fallback.
fn build_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    let result = rustls_native_certs::load_native_certs();
    for cert in result.certs {
        let _ = root_store.add(cert);
    }
    if root_store.is_empty() {
        root_store.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    root_store
}

/// What the verifier saw during the most recent handshake.
#[derive(Debug, Clone)]
pub struct CapturedCert {
    /// DER of the presented chain, leaf first.
    pub chain: Vec<Vec<u8>>,
    /// SHA-256 of the leaf, lowercase hex.
    pub fingerprint: String,
    /// The chain verified against the system roots.
    pub system_trust: bool,
}

/// Per-session trust state shared between control and data connections.
#[derive(Clone)]
pub struct SessionTls {
    connector: TlsConnector,
    captured: Arc<Mutex<Option<CapturedCert>>>,
    pinned: Arc<Mutex<Vec<String>>>,
}

impl SessionTls {
    pub fn new() -> Self {
        let captured = Arc::new(Mutex::new(None));
        let pinned = Arc::new(Mutex::new(Vec::new()));
        let roots = Arc::new(build_root_store());
        let webpki = WebPkiServerVerifier::builder(roots)
            .build()
            .expect("root store is never empty");
        let verifier = CapturingVerifier {
            inner: webpki,
            captured: captured.clone(),
        };
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        SessionTls {
            connector: TlsConnector::from(Arc::new(config)),
            captured,
            pinned,
        }
    }

    /// The chain from the most recent handshake.
    pub fn last_captured(&self) -> Option<CapturedCert> {
        self.captured.lock().unwrap().clone()
    }

    /// Record the user's verdict for the current certificate.
    pub fn trust_current_cert(&self, trusted: bool) {
        if !trusted {
            return;
        }
        if let Some(c) = self.last_captured() {
            let mut pinned = self.pinned.lock().unwrap();
            if !pinned.contains(&c.fingerprint) {
                pinned.push(c.fingerprint);
            }
        }
    }

    /// True when the current certificate needs no prompt: either the system
    /// roots vouch for it or the user already accepted it this session.
    pub fn is_trusted(&self, cert: &CapturedCert) -> bool {
        cert.system_trust || self.pinned.lock().unwrap().contains(&cert.fingerprint)
    }

    /// Run the handshake on an established TCP stream.
    pub async fn handshake(
        &self,
        host: &str,
        tcp: TcpStream,
    ) -> io::Result<TokioTlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid host name"))?;
        self.connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))
    }
}

impl Default for SessionTls {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts the handshake cryptographically and records the chain plus the
/// webpki verdict; the trust decision is made by the engine afterwards,
/// before anything sensitive crosses the wire.
#[derive(Debug)]
struct CapturingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    captured: Arc<Mutex<Option<CapturedCert>>>,
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        let verdict = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );
        let mut chain = Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.as_ref().to_vec());
        chain.extend(intermediates.iter().map(|c| c.as_ref().to_vec()));
        let mut hasher = Sha256::new();
        hasher.update(end_entity.as_ref());
        let fingerprint = hex_encode(&hasher.finalize());
        *self.captured.lock().unwrap() = Some(CapturedCert {
            chain,
            fingerprint,
            system_trust: verdict.is_ok(),
        });
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// A control or data stream: plain TCP or TLS over it.
pub enum FtpStream {
    Plain(TcpStream),
    Tls(Box<TokioTlsStream<TcpStream>>),
}

impl FtpStream {
    pub async fn connect(host: &str, port: u16) -> io::Result<Self> {
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;
        Ok(FtpStream::Plain(tcp))
    }

    /// Upgrade a plain stream to TLS. Consumes self; a failed handshake
    /// leaves nothing usable behind.
    pub async fn upgrade_to_tls(self, tls: &SessionTls, host: &str) -> io::Result<Self> {
        match self {
            FtpStream::Plain(tcp) => {
                let stream = tls.handshake(host, tcp).await?;
                Ok(FtpStream::Tls(Box::new(stream)))
            }
            FtpStream::Tls(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream is already TLS",
            )),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, FtpStream::Tls(_))
    }

    pub fn tcp(&self) -> &TcpStream {
        match self {
            FtpStream::Plain(s) => s,
            FtpStream::Tls(t) => t.get_ref().0,
        }
    }
}

impl AsyncRead for FtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FtpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            FtpStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            FtpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            FtpStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FtpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            FtpStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FtpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            FtpStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encoding() {
        assert_eq!(hex_encode(&[0x00, 0xab, 0xff]), "00abff");
    }
}
