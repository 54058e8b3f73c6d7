//! Async transport for SMTP dialogues
//!
//! Plain TCP for port 25/587, implicit TLS for port 465. Peer certificates
//! are not verified on the TLS path: probe targets routinely present
//! self-signed or mismatched certificates and the probe carries no payload.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::smtp::machine::SmtpReply;
use crate::tags;

/// Hard cap on the bytes of a single server reply.
const MAX_REPLY_BYTES: usize = 1024;

/// Transport-level failures, each mapped onto a closed-set error tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    Connect,
    Timeout,
    Closed,
    Overflow,
    Protocol,
}

impl SessionError {
    pub fn tag(self) -> &'static str {
        match self {
            SessionError::Connect => tags::SMTP_CONNECTION_FAILED,
            SessionError::Timeout => tags::TIMEOUT,
            SessionError::Closed => tags::SMTP_CONNECTION_CLOSED,
            SessionError::Overflow => tags::SMTP_RESPONSE_OVERFLOW,
            SessionError::Protocol => tags::SMTP_UNEXPECTED_REPLY,
        }
    }
}

enum ProbeStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// One connection to a mail exchange.
///
/// The connection is owned by a single probe and dropped at its end; replies
/// never leak between probes.
pub struct SmtpConnection {
    stream: ProbeStream,
    buffer: Vec<u8>,
}

impl SmtpConnection {
    /// Connect to `host:port`, optionally binding `local_ip` as the source
    /// address and optionally wrapping the stream in implicit TLS.
    pub async fn connect(
        host: &str,
        port: u16,
        local_ip: Option<IpAddr>,
        tls: bool,
        op_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let addrs: Vec<SocketAddr> = timeout(op_timeout, lookup_host((host, port)))
            .await
            .map_err(|_| SessionError::Timeout)?
            .map_err(|_| SessionError::Connect)?
            .collect();
        if addrs.is_empty() {
            return Err(SessionError::Connect);
        }

        let mut last = SessionError::Connect;
        for addr in addrs {
            match timeout(op_timeout, dial(addr, local_ip)).await {
                Ok(Ok(stream)) => {
                    debug!("Connected to {} ({})", host, addr);
                    let stream = if tls {
                        wrap_tls(host, stream, op_timeout).await?
                    } else {
                        ProbeStream::Plain(stream)
                    };
                    return Ok(Self {
                        stream,
                        buffer: Vec::new(),
                    });
                }
                Ok(Err(_)) => last = SessionError::Connect,
                Err(_) => last = SessionError::Timeout,
            }
        }
        Err(last)
    }

    /// Read one complete (possibly multi-line) reply.
    pub async fn read_reply(&mut self, op_timeout: Duration) -> Result<SmtpReply, SessionError> {
        let mut lines = Vec::new();
        let mut consumed = 0usize;
        loop {
            let line = timeout(op_timeout, self.read_line(&mut consumed))
                .await
                .map_err(|_| SessionError::Timeout)??;
            trace!("S: {}", line);
            let done = SmtpReply::is_final_line(&line);
            lines.push(line);
            if done {
                break;
            }
        }
        SmtpReply::from_lines(&lines).map_err(|_| SessionError::Protocol)
    }

    /// Write one command line.
    pub async fn send_line(&mut self, command: &str) -> Result<(), SessionError> {
        trace!("C: {}", command);
        let mut data = command.as_bytes().to_vec();
        data.extend_from_slice(b"\r\n");
        match &mut self.stream {
            ProbeStream::Plain(stream) => {
                stream.write_all(&data).await.map_err(|_| SessionError::Closed)?;
                stream.flush().await.map_err(|_| SessionError::Closed)
            }
            ProbeStream::Tls(stream) => {
                stream.write_all(&data).await.map_err(|_| SessionError::Closed)?;
                stream.flush().await.map_err(|_| SessionError::Closed)
            }
        }
    }

    /// Tear the connection down without the closing dialogue.
    pub async fn destroy(mut self) {
        let _ = match &mut self.stream {
            ProbeStream::Plain(stream) => stream.shutdown().await,
            ProbeStream::Tls(stream) => stream.shutdown().await,
        };
    }

    async fn read_line(&mut self, consumed: &mut usize) -> Result<String, SessionError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                *consumed += line.len();
                if *consumed > MAX_REPLY_BYTES {
                    return Err(SessionError::Overflow);
                }
                if line.ends_with(b"\r\n") {
                    line.truncate(line.len() - 2);
                } else {
                    line.truncate(line.len() - 1);
                }
                return String::from_utf8(line).map_err(|_| SessionError::Protocol);
            }
            if self.buffer.len() + *consumed > MAX_REPLY_BYTES {
                return Err(SessionError::Overflow);
            }

            let mut chunk = [0u8; 256];
            let read = match &mut self.stream {
                ProbeStream::Plain(stream) => stream.read(&mut chunk).await,
                ProbeStream::Tls(stream) => stream.read(&mut chunk).await,
            }
            .map_err(|_| SessionError::Closed)?;
            if read == 0 {
                return Err(SessionError::Closed);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

async fn dial(addr: SocketAddr, local_ip: Option<IpAddr>) -> std::io::Result<TcpStream> {
    let bind_ip = local_ip.filter(|ip| !ip.is_unspecified());
    match bind_ip {
        Some(ip) if ip.is_ipv4() == addr.is_ipv4() => {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(SocketAddr::new(ip, 0))?;
            socket.connect(addr).await
        }
        _ => TcpStream::connect(addr).await,
    }
}

async fn wrap_tls(
    host: &str,
    stream: TcpStream,
    op_timeout: Duration,
) -> Result<ProbeStream, SessionError> {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification))
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name =
        ServerName::try_from(host.to_string()).map_err(|_| SessionError::Connect)?;
    let tls = timeout(op_timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| SessionError::Timeout)?
        .map_err(|_| SessionError::Connect)?;
    Ok(ProbeStream::Tls(Box::new(tls)))
}

/// Certificate verifier that accepts everything, per probe policy.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
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
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
