//! QUIC implementation of [`Transport`]: one connection per dispatch attempt,
//! one unidirectional stream per connection.

use {
    super::{
        backend_tpu_client::{Result, TpuSenderError},
        transport::{DispatchError, OutboundStream, Transport, TransportConnection},
    },
    async_trait::async_trait,
    log::*,
    quinn::{
        crypto::rustls::QuicClientConfig, ClientConfig, Connection, Endpoint, IdleTimeout,
        SendStream, TransportConfig, VarInt,
    },
    rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
        DigitallySignedStruct, SignatureScheme,
    },
    solana_sdk::signature::Keypair,
    solana_streamer::{
        nonblocking::quic::ALPN_TPU_PROTOCOL_ID, tls_certificates::new_dummy_x509_certificate,
    },
    std::{
        net::{Ipv4Addr, SocketAddr},
        sync::Arc,
    },
    tokio::time::{timeout, Duration},
};

const QUIC_MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const QUIC_KEEP_ALIVE: Duration = Duration::from_secs(1);
const CLOSE_CODE_DONE: u32 = 0;

/// Translate a SocketAddr into a valid SNI for the purposes of QUIC connection.
///
/// Leaders are not addressed by DNS name and the server certificate is not
/// checked against it, but a unique name per peer keeps QUIC tokens apart.
pub fn socket_addr_to_quic_server_name(peer: SocketAddr) -> String {
    format!("{}.{}.sol", peer.ip(), peer.port())
}

pub struct QuicTransport {
    endpoint: Endpoint,
    client_config: ClientConfig,
    connect_timeout: Duration,
}

impl QuicTransport {
    /// Build a client endpoint that authenticates with a self-signed
    /// certificate derived from `identity`. Must be called within a Tokio
    /// runtime.
    pub fn new(identity: &Keypair, connect_timeout: Duration) -> Result<Self> {
        let (certificate, key) = new_dummy_x509_certificate(identity);

        let mut crypto = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|err| TpuSenderError::Transport(err.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_client_auth_cert(vec![certificate], key)
        .map_err(|err| TpuSenderError::Transport(err.to_string()))?;
        crypto.enable_early_data = true;
        crypto.alpn_protocols = vec![ALPN_TPU_PROTOCOL_ID.to_vec()];

        let mut transport_config = TransportConfig::default();
        transport_config.max_idle_timeout(Some(
            IdleTimeout::try_from(QUIC_MAX_IDLE_TIMEOUT)
                .map_err(|err| TpuSenderError::Transport(err.to_string()))?,
        ));
        transport_config.keep_alive_interval(Some(QUIC_KEEP_ALIVE));

        let mut client_config = ClientConfig::new(Arc::new(
            QuicClientConfig::try_from(crypto)
                .map_err(|err| TpuSenderError::Transport(err.to_string()))?,
        ));
        client_config.transport_config(Arc::new(transport_config));

        let endpoint = Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        debug!("QUIC client endpoint bound to {:?}", endpoint.local_addr());

        Ok(Self {
            endpoint,
            client_config,
            connect_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }
}

#[async_trait]
impl Transport for QuicTransport {
    type Connection = QuicConnection;

    async fn connect(&self, addr: SocketAddr) -> std::result::Result<QuicConnection, DispatchError> {
        let server_name = socket_addr_to_quic_server_name(addr);
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, &server_name)?;
        let connection = timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| DispatchError::Timeout)??;
        Ok(QuicConnection { connection })
    }
}

pub struct QuicConnection {
    connection: Connection,
}

#[async_trait]
impl TransportConnection for QuicConnection {
    type Stream = QuicStream;

    async fn open_outbound_stream(&self) -> std::result::Result<QuicStream, DispatchError> {
        Ok(QuicStream(self.connection.open_uni().await?))
    }

    fn close(&self) {
        self.connection
            .close(VarInt::from_u32(CLOSE_CODE_DONE), b"done");
    }
}

pub struct QuicStream(SendStream);

#[async_trait]
impl OutboundStream for QuicStream {
    async fn write_all(&mut self, buf: &[u8]) -> std::result::Result<(), DispatchError> {
        Ok(self.0.write_all(buf).await?)
    }

    fn finish(&mut self) -> std::result::Result<(), DispatchError> {
        self.0.finish().map_err(|_| DispatchError::StreamClosed)
    }
}

/// Leaders present self-signed certificates, so there is nothing to verify
/// them against.
#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
