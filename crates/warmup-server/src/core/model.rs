use std::fmt;

use serde::Serialize;
use time::{Date, OffsetDateTime};

pub type AccountId = u64;
pub type SessionId = u64;

/// One half of a mailbox's transport configuration (SMTP or IMAP).
///
/// `secure` selects implicit TLS; otherwise the connection upgrades via
/// STARTTLS. The password is held decrypted in memory and must never be
/// logged.
#[derive(Clone)]
pub struct MailEndpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub password: String,
}

impl fmt::Debug for MailEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The mailbox under warm-up.
#[derive(Debug, Clone)]
pub struct DomainAccount {
    pub id: AccountId,
    pub name: String,
    pub email: String,
    pub smtp: MailEndpoint,
    pub imap: MailEndpoint,
    pub status: DomainStatus,
}

/// A cooperating responder mailbox. Same shape as a domain account minus
/// the operational status.
#[derive(Debug, Clone)]
pub struct LeadAccount {
    pub id: AccountId,
    pub name: String,
    pub email: String,
    pub smtp: MailEndpoint,
    pub imap: MailEndpoint,
}

/// Login identity plus endpoint, as handed to a transport adapter.
#[derive(Debug, Clone)]
pub struct MailboxAccess {
    pub email: String,
    pub name: String,
    pub endpoint: MailEndpoint,
}

impl DomainAccount {
    pub fn smtp_access(&self) -> MailboxAccess {
        MailboxAccess {
            email: self.email.clone(),
            name: self.name.clone(),
            endpoint: self.smtp.clone(),
        }
    }

    pub fn imap_access(&self) -> MailboxAccess {
        MailboxAccess {
            email: self.email.clone(),
            name: self.name.clone(),
            endpoint: self.imap.clone(),
        }
    }
}

impl LeadAccount {
    pub fn smtp_access(&self) -> MailboxAccess {
        MailboxAccess {
            email: self.email.clone(),
            name: self.name.clone(),
            endpoint: self.smtp.clone(),
        }
    }

    pub fn imap_access(&self) -> MailboxAccess {
        MailboxAccess {
            email: self.email.clone(),
            name: self.name.clone(),
            endpoint: self.imap.clone(),
        }
    }
}

/// Denormalised view of whether an orchestrator currently owns the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    Idle,
    Running,
    Paused,
}

impl DomainStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Sending,
    WaitingReply,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::WaitingReply => "waiting_reply",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "sending" => Some(Self::Sending),
            "waiting_reply" => Some(Self::WaitingReply),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Edges of the session state machine. `failed` is reachable from every
    /// non-terminal state; `completed -> sending` is the appended-leads
    /// resume edge.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        match self {
            Self::Pending => {
                matches!(next, Self::Sending | Self::Paused | Self::Failed)
            }
            Self::Sending => matches!(
                next,
                Self::WaitingReply
                    | Self::Completed
                    | Self::Paused
                    | Self::Failed
            ),
            Self::WaitingReply => {
                matches!(next, Self::Sending | Self::Paused | Self::Failed)
            }
            Self::Paused => matches!(next, Self::Sending | Self::Failed),
            Self::Completed => matches!(next, Self::Sending),
            Self::Failed => false,
        }
    }
}

/// One calendar day of warm-up progress for one domain account.
#[derive(Debug, Clone, Serialize)]
pub struct WarmupSession {
    pub id: SessionId,
    pub domain_account_id: AccountId,
    pub session_date: Date,
    pub current_lead_index: u32,
    pub status: SessionStatus,
    pub last_message_id: Option<String>,
    pub error_message: Option<String>,
    pub started_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

impl WarmupSession {
    /// True when the roster has grown past the point this session completed
    /// at, meaning a same-day restart may continue from the stored index.
    pub fn has_appended_leads(&self, total_leads: usize) -> bool {
        self.status == SessionStatus::Completed
            && (self.current_lead_index as usize) < total_leads
    }
}

/// Field patch applied together with a status write.
#[derive(Debug, Clone)]
pub struct SessionUpdate {
    pub status: SessionStatus,
    pub current_lead_index: Option<u32>,
    pub last_message_id: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: Option<OffsetDateTime>,
    /// Clears `completed_at` and `error_message` (appended-leads resume).
    pub reopen: bool,
}

impl SessionUpdate {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status,
            current_lead_index: None,
            last_message_id: None,
            error_message: None,
            completed_at: None,
            reopen: false,
        }
    }

    pub fn index(mut self, index: u32) -> Self {
        self.current_lead_index = Some(index);
        self
    }

    pub fn message_id(mut self, message_id: impl Into<String>) -> Self {
        self.last_message_id = Some(message_id.into());
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn completed_at(mut self, at: OffsetDateTime) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn reopen(mut self) -> Self {
        self.reopen = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
    Replied,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
            Self::Replied => "replied",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(Self::Sent),
            "received" => Some(Self::Received),
            "replied" => Some(Self::Replied),
            _ => None,
        }
    }
}

/// Append-only audit record of one observed message.
#[derive(Debug, Clone, Serialize)]
pub struct MailLogEntry {
    pub id: u64,
    pub session_id: Option<SessionId>,
    pub from_email: String,
    pub to_email: String,
    pub subject: String,
    pub body: String,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub direction: Direction,
    pub lead_index: u32,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewMailLog {
    pub session_id: Option<SessionId>,
    pub from_email: String,
    pub to_email: String,
    pub subject: String,
    pub body: String,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub direction: Direction,
    pub lead_index: u32,
}

/// Subject and body produced by the text generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailDraft {
    pub subject: String,
    pub body: String,
}

/// Structured view of a message fetched from an inbox.
#[derive(Debug, Clone)]
pub struct IncomingEmail {
    pub message_id: Option<String>,
    pub from: String,
    pub to: Option<String>,
    pub subject: String,
    pub body: String,
    pub in_reply_to: Option<String>,
    pub date: Option<OffsetDateTime>,
}

/// Lowercased addr-spec with surrounding whitespace and angle brackets
/// stripped. `"Ada L." <Ada@Example.COM>` and `ada@example.com` compare
/// equal.
pub fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(open), Some(close)) if open < close => &trimmed[open + 1..close],
        _ => trimmed,
    };
    inner.trim().trim_matches(|c| c == '<' || c == '>').to_ascii_lowercase()
}

pub fn same_address(a: &str, b: &str) -> bool {
    normalize_address(a) == normalize_address(b)
}

/// Domain part of an address, used for Message-ID generation.
pub fn sender_domain(address: &str) -> &str {
    let normalized = address.trim().trim_end_matches('>');
    match normalized.rsplit_once('@') {
        Some((_, domain)) => domain,
        None => "localhost",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_display_name_and_case() {
        assert_eq!(
            normalize_address("\"Ada L.\" <Ada@Example.COM>"),
            "ada@example.com"
        );
        assert_eq!(normalize_address("  ada@example.com  "), "ada@example.com");
        assert!(same_address("<ADA@example.com>", "ada@Example.Com"));
        assert!(!same_address("ada@example.com", "grace@example.com"));
    }

    #[test]
    fn sender_domain_falls_back_without_at() {
        assert_eq!(sender_domain("warm@corp.example"), "corp.example");
        assert_eq!(sender_domain("<warm@corp.example>"), "corp.example");
        assert_eq!(sender_domain("not-an-address"), "localhost");
    }

    #[test]
    fn terminal_states_only_allow_documented_edges() {
        use SessionStatus::*;

        assert!(Pending.can_transition_to(Sending));
        assert!(Sending.can_transition_to(WaitingReply));
        assert!(WaitingReply.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Completed));
        assert!(WaitingReply.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Sending));
        // Appended-leads resume.
        assert!(Completed.can_transition_to(Sending));

        assert!(!Completed.can_transition_to(WaitingReply));
        assert!(!Failed.can_transition_to(Sending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!WaitingReply.can_transition_to(Completed));
    }

    #[test]
    fn appended_leads_requires_completed_status() {
        let session = WarmupSession {
            id: 1,
            domain_account_id: 7,
            session_date: Date::from_ordinal_date(2026, 100).unwrap(),
            current_lead_index: 1,
            status: SessionStatus::Completed,
            last_message_id: None,
            error_message: None,
            started_at: OffsetDateTime::UNIX_EPOCH,
            completed_at: Some(OffsetDateTime::UNIX_EPOCH),
        };

        assert!(session.has_appended_leads(2));
        assert!(!session.has_appended_leads(1));

        let paused = WarmupSession {
            status: SessionStatus::Paused,
            ..session
        };
        assert!(!paused.has_appended_leads(2));
    }
}
