use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;
use uuid::Uuid;

use super::model::{MailboxAccess, sender_domain};

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub from: MailboxAccess,
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Message-ID being answered; sets both In-Reply-To and References.
    pub in_reply_to: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Freshly generated `<uuid@sender-domain>` identifier.
    pub message_id: String,
    pub accepted: Vec<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, request: SendRequest) -> Result<SendReceipt>;
}

/// Sends over SMTP submission with a single-use transport per message; the
/// connection is dropped on every exit path.
pub struct SmtpMailer;

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, request: SendRequest) -> Result<SendReceipt> {
        let message_id = generate_message_id(&request.from.email);
        let message = build_message(&request, &message_id)?;

        let endpoint = &request.from.endpoint;
        let credentials = Credentials::new(
            request.from.email.clone(),
            endpoint.password.clone(),
        );

        let builder = if endpoint.secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&endpoint.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(
                &endpoint.host,
            )
        }
        .with_context(|| {
            format!("failed to create smtp transport: host={}", endpoint.host)
        })?;

        let transport =
            builder.port(endpoint.port).credentials(credentials).build();

        transport.send(message).await.with_context(|| {
            format!(
                "smtp send failed: host={}, port={}, from={}, to={}",
                endpoint.host, endpoint.port, request.from.email, request.to
            )
        })?;

        debug!(
            "smtp message accepted: from={}, to={}, message_id={}",
            request.from.email, request.to, message_id
        );

        Ok(SendReceipt {
            message_id,
            accepted: vec![request.to],
        })
    }
}

fn generate_message_id(sender: &str) -> String {
    format!("<{}@{}>", Uuid::new_v4(), sender_domain(sender))
}

fn build_message(
    request: &SendRequest,
    message_id: &str,
) -> Result<Message> {
    let from: Mailbox =
        format!("{} <{}>", request.from.name.trim(), request.from.email)
            .parse()
            .with_context(|| {
                format!("invalid sender mailbox: {}", request.from.email)
            })?;
    let to: Mailbox = request.to.parse().with_context(|| {
        format!("invalid recipient address: {}", request.to)
    })?;

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(&request.subject)
        .message_id(Some(message_id.to_string()))
        .header(ContentType::TEXT_PLAIN);

    if let Some(in_reply_to) = &request.in_reply_to {
        builder = builder
            .in_reply_to(in_reply_to.clone())
            .references(in_reply_to.clone());
    }

    builder.body(request.body.clone()).context("failed to build message")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::MailEndpoint;

    fn request(in_reply_to: Option<&str>) -> SendRequest {
        SendRequest {
            from: MailboxAccess {
                email: "warm@corp.example".to_string(),
                name: "Warm Sender".to_string(),
                endpoint: MailEndpoint {
                    host: "smtp.corp.example".to_string(),
                    port: 587,
                    secure: false,
                    password: "secret".to_string(),
                },
            },
            to: "lead@pool.example".to_string(),
            subject: "Quick hello".to_string(),
            body: "Hi there".to_string(),
            in_reply_to: in_reply_to.map(str::to_string),
        }
    }

    #[test]
    fn message_id_uses_uuid_at_sender_domain() {
        let mid = generate_message_id("warm@corp.example");
        assert!(mid.starts_with('<'));
        assert!(mid.ends_with("@corp.example>"));
        let uuid_part = &mid[1..mid.len() - "@corp.example>".len()];
        assert!(Uuid::parse_str(uuid_part).is_ok());
    }

    #[test]
    fn reply_carries_threading_headers() {
        let message =
            build_message(&request(Some("<orig@corp.example>")), "<m@d>")
                .unwrap();
        let rendered = String::from_utf8(message.formatted()).unwrap();
        assert!(rendered.contains("In-Reply-To: <orig@corp.example>"));
        assert!(rendered.contains("References: <orig@corp.example>"));
        assert!(rendered.contains("Message-ID: <m@d>"));
    }

    #[test]
    fn plain_outbound_has_no_threading_headers() {
        let message = build_message(&request(None), "<m@d>").unwrap();
        let rendered = String::from_utf8(message.formatted()).unwrap();
        assert!(!rendered.contains("In-Reply-To"));
        assert!(!rendered.contains("References"));
    }
}
