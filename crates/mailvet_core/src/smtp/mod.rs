//! SMTP mailbox probing
//!
//! Opens a connection to a mail exchange, runs the dialogue far enough to
//! classify one recipient, and closes. Accept and reject get a best-effort
//! `QUIT`; anything inconclusive tears the socket down immediately.

pub mod machine;
pub mod session;

use std::net::IpAddr;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use tokio::time::timeout;
use tracing::{debug, warn};

use machine::{ProbeMachine, Step};
use session::{SessionError, SmtpConnection};

use crate::tags;

/// One port to try, with or without implicit TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePort {
    pub port: u16,
    pub tls: bool,
}

/// Probe configuration: identity for the envelope, ports, and timeouts.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Hostname announced in `HELO`.
    pub helo_host: String,
    /// Neutral sender identity for `MAIL FROM`.
    pub mail_from: String,
    /// Ports tried in order until one connects.
    pub ports: Vec<ProbePort>,
    /// Per-operation timeout (connect, one read, one write).
    pub op_timeout: Duration,
    /// Ceiling over the whole dialogue, enforced independently.
    pub ceiling: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            helo_host: "mailvet.local".to_string(),
            mail_from: "postmaster@mailvet.local".to_string(),
            ports: vec![ProbePort { port: 25, tls: false }],
            op_timeout: Duration::from_secs(10),
            ceiling: Duration::from_secs(15),
        }
    }
}

impl ProbeConfig {
    /// Add the submission fallbacks: 587 plaintext, 465 implicit TLS.
    pub fn with_fallback_ports(mut self) -> Self {
        self.ports.push(ProbePort { port: 587, tls: false });
        self.ports.push(ProbePort { port: 465, tls: true });
        self
    }
}

/// Terminal classification of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Accepted,
    Rejected,
    Inconclusive(&'static str),
}

/// Drives SMTP dialogues against mail exchanges.
pub struct SmtpProbe {
    config: ProbeConfig,
}

impl SmtpProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Probe `rcpt_to` against `mx_host`.
    ///
    /// Deterministic servers yield the same outcome for the same
    /// `(mx_host, rcpt_to)` pair; each call uses a fresh connection.
    ///
    /// # Arguments
    /// * `mx_host` - exchange hostname, usually the lowest-priority MX
    /// * `rcpt_to` - full address handed to `RCPT TO`
    /// * `local_ip` - source address to bind, if any
    pub async fn probe(
        &self,
        mx_host: &str,
        rcpt_to: &str,
        local_ip: Option<IpAddr>,
    ) -> ProbeOutcome {
        match timeout(self.config.ceiling, self.dialogue(mx_host, rcpt_to, local_ip)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Probe of {} via {} hit the global ceiling", rcpt_to, mx_host);
                ProbeOutcome::Inconclusive(tags::TIMEOUT)
            }
        }
    }

    async fn dialogue(
        &self,
        mx_host: &str,
        rcpt_to: &str,
        local_ip: Option<IpAddr>,
    ) -> ProbeOutcome {
        let mut conn = match self.open(mx_host, local_ip).await {
            Ok(conn) => conn,
            Err(e) => return ProbeOutcome::Inconclusive(e.tag()),
        };

        let mut machine = ProbeMachine::new(&self.config.helo_host, &self.config.mail_from, rcpt_to);
        loop {
            let reply = match conn.read_reply(self.config.op_timeout).await {
                Ok(reply) => reply,
                Err(e) => {
                    conn.destroy().await;
                    return ProbeOutcome::Inconclusive(e.tag());
                }
            };
            match machine.on_reply(&reply) {
                Step::Send(command) => {
                    if let Err(e) = conn.send_line(&command).await {
                        conn.destroy().await;
                        return ProbeOutcome::Inconclusive(e.tag());
                    }
                }
                Step::Accept => {
                    quit(conn, self.config.op_timeout).await;
                    debug!("{} accepted by {}", rcpt_to, mx_host);
                    return ProbeOutcome::Accepted;
                }
                Step::Reject => {
                    quit(conn, self.config.op_timeout).await;
                    debug!("{} rejected by {}", rcpt_to, mx_host);
                    return ProbeOutcome::Rejected;
                }
                Step::Fail(tag) => {
                    conn.destroy().await;
                    return ProbeOutcome::Inconclusive(tag);
                }
            }
        }
    }

    async fn open(
        &self,
        mx_host: &str,
        local_ip: Option<IpAddr>,
    ) -> Result<SmtpConnection, SessionError> {
        let mut last = SessionError::Connect;
        for probe_port in &self.config.ports {
            match SmtpConnection::connect(
                mx_host,
                probe_port.port,
                local_ip,
                probe_port.tls,
                self.config.op_timeout,
            )
            .await
            {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!("Connect to {}:{} failed", mx_host, probe_port.port);
                    last = e;
                }
            }
        }
        Err(last)
    }
}

async fn quit(mut conn: SmtpConnection, op_timeout: Duration) {
    if conn.send_line("QUIT").await.is_ok() {
        let _ = conn.read_reply(op_timeout).await;
    }
    conn.destroy().await;
}

/// Random lowercase local part for catch-all probing, drawn from the OS
/// entropy source. Logged so a transcript can be replayed.
pub fn random_local_part() -> String {
    let local: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    debug!("Catch-all probe local part: {}", local);
    local
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal scripted exchange: greets, answers HELO/MAIL, and replies to
    /// RCPT with the given line.
    async fn scripted_server(rcpt_reply: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 fixture ESMTP\r\n").await.unwrap();
            let mut buf = [0u8; 512];
            loop {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                let line = String::from_utf8_lossy(&buf[..n]);
                let reply = if line.starts_with("HELO") {
                    "250 fixture\r\n".to_string()
                } else if line.starts_with("MAIL") {
                    "250 2.1.0 Ok\r\n".to_string()
                } else if line.starts_with("RCPT") {
                    format!("{}\r\n", rcpt_reply)
                } else if line.starts_with("QUIT") {
                    let _ = socket.write_all(b"221 Bye\r\n").await;
                    break;
                } else {
                    "250 Ok\r\n".to_string()
                };
                if socket.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        port
    }

    fn probe_on(port: u16) -> SmtpProbe {
        SmtpProbe::new(ProbeConfig {
            ports: vec![ProbePort { port, tls: false }],
            op_timeout: Duration::from_secs(2),
            ceiling: Duration::from_secs(5),
            ..ProbeConfig::default()
        })
    }

    #[tokio::test]
    async fn test_accepting_server() {
        let port = scripted_server("250 2.1.5 Ok").await;
        let outcome = probe_on(port)
            .probe("127.0.0.1", "user@example.com", None)
            .await;
        assert_eq!(outcome, ProbeOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_rejecting_server() {
        let port = scripted_server("550 5.1.1 no such user").await;
        let outcome = probe_on(port)
            .probe("127.0.0.1", "ghost@example.com", None)
            .await;
        assert_eq!(outcome, ProbeOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_greylisting_server() {
        let port = scripted_server("451 4.7.1 try again later").await;
        let outcome = probe_on(port)
            .probe("127.0.0.1", "user@example.com", None)
            .await;
        assert_eq!(outcome, ProbeOutcome::Inconclusive(tags::SMTP_DEFERRED));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        // Nothing listens on the reserved port.
        let probe = probe_on(9);
        let outcome = probe.probe("127.0.0.1", "user@example.com", None).await;
        assert!(matches!(outcome, ProbeOutcome::Inconclusive(_)));
    }

    #[tokio::test]
    async fn test_server_that_closes_early() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });
        let outcome = probe_on(port)
            .probe("127.0.0.1", "user@example.com", None)
            .await;
        assert_eq!(
            outcome,
            ProbeOutcome::Inconclusive(tags::SMTP_CONNECTION_CLOSED)
        );
    }

    #[test]
    fn test_random_local_part_shape() {
        let a = random_local_part();
        let b = random_local_part();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(a, b);
    }
}
