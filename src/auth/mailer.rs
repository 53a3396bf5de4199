use async_trait::async_trait;
use parking_lot::Mutex;

use super::AuthError;

#[derive(Debug, Clone, PartialEq)]
pub struct Mail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outbound mail collaborator used by password resets.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: Mail) -> Result<(), AuthError>;
}

/// Writes mails to the log instead of delivering them.
pub struct LogMailer {
    server: Option<String>,
}

impl LogMailer {
    pub fn new(server: Option<String>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: Mail) -> Result<(), AuthError> {
        match &self.server {
            Some(server) => tracing::info!(
                "mail to {} via {}: {}",
                mail.to,
                server,
                mail.subject
            ),
            None => tracing::info!("mail to {} (no smtp server configured): {}", mail.to, mail.subject),
        }
        Ok(())
    }
}

/// Keeps every mail in memory.
#[derive(Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<Mail>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Mail> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, mail: Mail) -> Result<(), AuthError> {
        self.sent.lock().push(mail);
        Ok(())
    }
}
