//! Batch completion notification
//!
//! Best-effort by contract: the executor logs a failed notification and
//! moves on, it never affects job state.

use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};
use lettre::message::Mailbox;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Delivery hook for "your batch finished" messages.
pub trait Notifier: Send + Sync {
    fn send_batch_complete<'a>(
        &'a self,
        email: &'a str,
        batch_id: &'a str,
        processed: u64,
    ) -> NotifyFuture<'a>;
}

/// SMTP-backed notifier using a relay that accepts unauthenticated
/// submissions from this host.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(relay_host: &str, from: &str) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(relay_host).build();
        let from = from.parse::<Mailbox>().context("invalid sender mailbox")?;
        Ok(Self { transport, from })
    }
}

impl Notifier for SmtpNotifier {
    fn send_batch_complete<'a>(
        &'a self,
        email: &'a str,
        batch_id: &'a str,
        processed: u64,
    ) -> NotifyFuture<'a> {
        Box::pin(async move {
            let message = Message::builder()
                .from(self.from.clone())
                .to(email.parse::<Mailbox>().context("invalid recipient")?)
                .subject(format!("Verification batch {} complete", batch_id))
                .body(format!(
                    "Your verification batch {} has finished. {} addresses were processed.",
                    batch_id, processed
                ))
                .context("failed to build notification message")?;
            self.transport
                .send(message)
                .await
                .context("failed to send notification")?;
            info!("Sent completion notification for batch {} to {}", batch_id, email);
            Ok(())
        })
    }
}

/// Notifier that only logs. Default wiring for deployments without a relay.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn send_batch_complete<'a>(
        &'a self,
        email: &'a str,
        batch_id: &'a str,
        processed: u64,
    ) -> NotifyFuture<'a> {
        Box::pin(async move {
            info!(
                "Notification suppressed (no relay configured): batch {} complete, {} processed, recipient {}",
                batch_id, processed, email
            );
            Ok(())
        })
    }
}
