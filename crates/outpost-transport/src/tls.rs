//! Outbound WebSocket dialing with rustls

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{TransportError, TransportResult};
use crate::transport::Transport;

pub type ClientWebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client-side WebSocket configuration
#[derive(Debug, Clone, Default)]
pub struct WebSocketConfig {
    /// Skip server certificate verification (INSECURE)
    pub insecure: bool,

    /// `User-Agent` sent with the handshake
    pub user_agent: Option<String>,
}

impl WebSocketConfig {
    /// Create a client configuration with defaults
    pub fn client_default() -> Self {
        Self::default()
    }

    /// Create a client configuration for local development (skip cert verification)
    pub fn client_insecure() -> Self {
        Self::client_default().with_insecure_skip_verify()
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.insecure = true;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Build the rustls client configuration
    pub fn build_tls_config(&self) -> rustls::ClientConfig {
        ensure_crypto_provider();

        if self.insecure {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
    }

    /// Perform a WebSocket handshake with `request`
    pub async fn dial(&self, mut request: Request) -> TransportResult<(ClientWebSocket, Response)> {
        if let Some(user_agent) = &self.user_agent {
            let value = HeaderValue::from_str(user_agent)
                .map_err(|e| TransportError::InvalidUrl(format!("bad user agent: {}", e)))?;
            request.headers_mut().insert("User-Agent", value);
        }

        let connector = Connector::Rustls(Arc::new(self.build_tls_config()));
        let (socket, response) = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            false,
            Some(connector),
        )
        .await?;

        debug!("WebSocket connected, status {}", response.status());
        Ok((socket, response))
    }

    /// Dial `url` and wrap the connection as a [`Transport`]
    pub async fn connect(&self, url: &str) -> TransportResult<Transport> {
        let request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", url, e)))?;
        let (socket, _) = self.dial(request).await?;
        Ok(Transport::from_websocket(socket, url.to_string()))
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

// Certificate verifier that accepts any server certificate (INSECURE)
#[derive(Debug)]
struct SkipVerification(rustls::crypto::WebPkiSupportedAlgorithms);

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(
            rustls::crypto::ring::default_provider().signature_verification_algorithms,
        ))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.supported_schemes()
    }
}
