//! Upstream connection handling and the proxy exchange.

use super::config::MtlsConfig;
use super::error::{UpstreamError, UpstreamResult};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// URL scheme of a backend origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain HTTP.
    Http,
    /// HTTP over TLS.
    Https,
}

impl Scheme {
    /// Default port for the scheme.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

/// Parsed backend origin: scheme, host, and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// URL scheme.
    pub scheme: Scheme,
    /// Host name or address.
    pub host: String,
    /// Port (explicit or scheme default).
    pub port: u16,
}

impl Origin {
    /// Parse an origin from a backend URL such as `http://localhost:8081`.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::InvalidUrl`] when the URL has no host or a
    /// malformed port.
    pub fn parse(url: &str) -> UpstreamResult<Self> {
        let (scheme, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else {
            (Scheme::Http, url)
        };

        let authority = rest.split('/').next().unwrap_or("");
        if authority.is_empty() {
            return Err(UpstreamError::InvalidUrl(url.to_string()));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| UpstreamError::InvalidUrl(url.to_string()))?;
                (host, port)
            },
            None => (authority, scheme.default_port()),
        };

        if host.is_empty() {
            return Err(UpstreamError::InvalidUrl(url.to_string()));
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    /// `host:port` used for TCP connects and liveness probing.
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value for the `Host` header; elides the scheme-default port.
    #[must_use]
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            self.authority()
        }
    }

    /// Whether this origin requires a TLS connection.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }
}

/// The transport a backend is proxied through, fixed at construction.
pub enum Transport {
    /// Plain TCP.
    Plain,
    /// TLS with an mTLS client identity.
    MutualTls(TlsConnector),
}

impl Clone for Transport {
    fn clone(&self) -> Self {
        match self {
            Self::Plain => Self::Plain,
            Self::MutualTls(connector) => Self::MutualTls(connector.clone()),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain => write!(f, "Transport::Plain"),
            Self::MutualTls(_) => write!(f, "Transport::MutualTls"),
        }
    }
}

impl Transport {
    /// Build a transport from the mTLS configuration. Disabled mTLS yields
    /// the plain transport.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::TlsConfig`] when PEM files are missing or
    /// malformed.
    pub fn from_config(config: &MtlsConfig) -> UpstreamResult<Self> {
        if !config.enabled {
            return Ok(Self::Plain);
        }

        config.validate().map_err(UpstreamError::TlsConfig)?;

        let cert_file = config.cert_file.as_deref().unwrap_or_default();
        let key_file = config.key_file.as_deref().unwrap_or_default();

        let certs = load_certs(cert_file)?;
        let key = load_key(key_file)?;

        let builder = ClientConfig::builder();
        let client_config = if config.insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification))
                .with_client_auth_cert(certs, key)
        } else {
            let mut roots = RootCertStore::empty();
            let ca_file = config.ca_file.as_deref().unwrap_or_default();
            for cert in load_certs(ca_file)? {
                roots
                    .add(cert)
                    .map_err(|e| UpstreamError::TlsConfig(format!("bad CA certificate: {e}")))?;
            }
            builder
                .with_root_certificates(roots)
                .with_client_auth_cert(certs, key)
        }
        .map_err(|e| UpstreamError::TlsConfig(format!("client identity rejected: {e}")))?;

        Ok(Self::MutualTls(TlsConnector::from(Arc::new(client_config))))
    }
}

fn load_certs(path: &str) -> UpstreamResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| UpstreamError::TlsConfig(format!("cannot read {path}: {e}")))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| UpstreamError::TlsConfig(format!("bad PEM in {path}: {e}")))
}

fn load_key(path: &str) -> UpstreamResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| UpstreamError::TlsConfig(format!("cannot read {path}: {e}")))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| UpstreamError::TlsConfig(format!("bad PEM in {path}: {e}")))?
        .ok_or_else(|| UpstreamError::TlsConfig(format!("no private key in {path}")))
}

/// Certificate verifier that accepts anything. Testing only, gated behind
/// `insecure_skip_verify`.
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Forward `req` to `origin` over a fresh upstream connection.
///
/// The request URI is rewritten to origin-form, the `Host` header is set
/// for the backend, and the client address is appended to
/// `X-Forwarded-For`. The caller bounds the whole call with its deadline.
///
/// # Errors
///
/// Returns a classified [`UpstreamError`] on connect, TLS, or HTTP
/// failure.
pub async fn proxy_request<B>(
    transport: &Transport,
    origin: &Origin,
    req: Request<B>,
    client_ip: &str,
) -> UpstreamResult<Response<Incoming>>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let addr = origin.authority();
    let req = rewrite_request(origin, req, client_ip)?;

    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| UpstreamError::Connect {
            addr: addr.clone(),
            source,
        })?;

    match transport {
        Transport::Plain => exchange(stream, req).await,
        Transport::MutualTls(connector) => {
            let server_name = ServerName::try_from(origin.host.clone())
                .map_err(|_| UpstreamError::InvalidUrl(origin.host.clone()))?;
            let tls = connector
                .connect(server_name, stream)
                .await
                .map_err(|source| UpstreamError::Tls { addr, source })?;
            exchange(tls, req).await
        },
    }
}

/// Rewrite a proxied request for the backend origin.
fn rewrite_request<B>(
    origin: &Origin,
    req: Request<B>,
    client_ip: &str,
) -> UpstreamResult<Request<B>> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());
    parts.uri = path_and_query
        .parse()
        .map_err(|_| UpstreamError::Transport(format!("bad request target {path_and_query}")))?;

    let host = HeaderValue::from_str(&origin.host_header())
        .map_err(|_| UpstreamError::InvalidUrl(origin.host.clone()))?;
    parts.headers.insert(HOST, host);

    let forwarded = match parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        parts.headers.insert("x-forwarded-for", value);
    }

    Ok(Request::from_parts(parts, body))
}

/// Run one HTTP/1.1 exchange over an established stream.
async fn exchange<T, B>(io: T, req: Request<B>) -> UpstreamResult<Response<Incoming>>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| UpstreamError::Transport(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Upstream connection closed with error");
        }
    });

    sender
        .send_request(req)
        .await
        .map_err(|e| UpstreamError::Transport(e.to_string()))
}
