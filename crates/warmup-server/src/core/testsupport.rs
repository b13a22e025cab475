//! In-process doubles for the store, the transports and the generator,
//! shared by the orchestrator and facade test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::imap::{InboxEvent, InboxListener, InboxSubscription, WatchOptions};
use super::model::{
    AccountId, Direction, DomainAccount, DomainStatus, EmailDraft,
    IncomingEmail, LeadAccount, MailEndpoint, MailLogEntry, NewMailLog,
    SessionId, SessionStatus, SessionUpdate, WarmupSession, sender_domain,
};
use super::orchestrator::WarmupTiming;
use super::smtp::{Mailer, SendReceipt, SendRequest};
use super::store::WarmupStore;
use super::textgen::TextGenerator;

pub fn test_timing() -> WarmupTiming {
    WarmupTiming {
        inter_lead_min: Duration::ZERO,
        inter_lead_max: Duration::ZERO,
        imap_wait_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(10),
        human_delay_min: Duration::ZERO,
        human_delay_max: Duration::ZERO,
        skip_delay: Duration::ZERO,
        connect_timeout: Duration::from_secs(1),
    }
}

pub fn endpoint(host: &str) -> MailEndpoint {
    MailEndpoint {
        host: host.to_string(),
        port: 993,
        secure: true,
        password: "test-password".to_string(),
    }
}

pub fn domain_account(id: AccountId, email: &str, name: &str) -> DomainAccount {
    DomainAccount {
        id,
        name: name.to_string(),
        email: email.to_string(),
        smtp: endpoint("smtp.test"),
        imap: endpoint("imap.test"),
        status: DomainStatus::Idle,
    }
}

pub fn lead_account(id: AccountId, email: &str, name: &str) -> LeadAccount {
    LeadAccount {
        id,
        name: name.to_string(),
        email: email.to_string(),
        smtp: endpoint("smtp.test"),
        imap: endpoint("imap.test"),
    }
}

pub fn incoming(
    from: &str,
    message_id: &str,
    in_reply_to: Option<&str>,
) -> IncomingEmail {
    IncomingEmail {
        message_id: Some(message_id.to_string()),
        from: from.to_string(),
        to: None,
        subject: "Quick hello".to_string(),
        body: "Hi there".to_string(),
        in_reply_to: in_reply_to.map(str::to_string),
        date: Some(OffsetDateTime::UNIX_EPOCH),
    }
}

/// Polls the store until the session reaches `status`; panics after two
/// seconds with the last observed row.
pub async fn wait_for_session_status(
    store: &Arc<MemoryStore>,
    session_id: SessionId,
    status: SessionStatus,
) -> WarmupSession {
    let deadline = Duration::from_secs(2);
    let poll = async {
        loop {
            let row = store
                .session(session_id)
                .await
                .unwrap()
                .expect("session row missing");
            if row.status == status {
                return row;
            }
            sleep(Duration::from_millis(5)).await;
        }
    };

    match timeout(deadline, poll).await {
        Ok(row) => row,
        Err(_) => {
            let last = store.session(session_id).await.unwrap();
            panic!("session never reached {status:?}, last row: {last:?}");
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    domains: Vec<DomainAccount>,
    leads: Vec<LeadAccount>,
    sessions: Vec<WarmupSession>,
    mail_log: Vec<MailLogEntry>,
    next_session_id: SessionId,
    next_log_id: u64,
}

/// Store double with the same atomicity contract as the MySQL
/// implementation: illegal status edges leave the stored row unchanged.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_domain(&self, account: DomainAccount) {
        self.inner.lock().unwrap().domains.push(account);
    }

    pub fn add_lead(&self, account: LeadAccount) {
        self.inner.lock().unwrap().leads.push(account);
    }

    pub fn domain_status(&self, id: AccountId) -> DomainStatus {
        self.inner
            .lock()
            .unwrap()
            .domains
            .iter()
            .find(|account| account.id == id)
            .map(|account| account.status)
            .expect("unknown domain account")
    }

    pub fn log_shape(&self, session_id: SessionId) -> Vec<(Direction, u32)> {
        self.inner
            .lock()
            .unwrap()
            .mail_log
            .iter()
            .filter(|entry| entry.session_id == Some(session_id))
            .map(|entry| (entry.direction, entry.lead_index))
            .collect()
    }
}

#[async_trait]
impl WarmupStore for MemoryStore {
    async fn domain_account(
        &self,
        id: AccountId,
    ) -> Result<Option<DomainAccount>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.domains.iter().find(|account| account.id == id).cloned())
    }

    async fn lead_accounts(&self) -> Result<Vec<LeadAccount>> {
        Ok(self.inner.lock().unwrap().leads.clone())
    }

    async fn set_domain_status(
        &self,
        id: AccountId,
        status: DomainStatus,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(account) =
            inner.domains.iter_mut().find(|account| account.id == id)
        {
            account.status = status;
        }
        Ok(())
    }

    async fn session(&self, id: SessionId) -> Result<Option<WarmupSession>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sessions.iter().find(|session| session.id == id).cloned())
    }

    async fn active_session_on(
        &self,
        domain_id: AccountId,
        date: Date,
    ) -> Result<Option<WarmupSession>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sessions
            .iter()
            .find(|session| {
                session.domain_account_id == domain_id
                    && session.session_date == date
                    && !session.status.is_terminal()
            })
            .cloned())
    }

    async fn completed_session_on(
        &self,
        domain_id: AccountId,
        date: Date,
    ) -> Result<Option<WarmupSession>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sessions
            .iter()
            .find(|session| {
                session.domain_account_id == domain_id
                    && session.session_date == date
                    && session.status == SessionStatus::Completed
            })
            .cloned())
    }

    async fn create_or_reset_session(
        &self,
        domain_id: AccountId,
        date: Date,
    ) -> Result<WarmupSession> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(session) = inner.sessions.iter_mut().find(|session| {
            session.domain_account_id == domain_id
                && session.session_date == date
        }) {
            session.status = SessionStatus::Pending;
            session.current_lead_index = 0;
            session.last_message_id = None;
            session.error_message = None;
            session.completed_at = None;
            session.started_at = OffsetDateTime::now_utc();
            return Ok(session.clone());
        }

        inner.next_session_id += 1;
        let session = WarmupSession {
            id: inner.next_session_id,
            domain_account_id: domain_id,
            session_date: date,
            current_lead_index: 0,
            status: SessionStatus::Pending,
            last_message_id: None,
            error_message: None,
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
        };
        inner.sessions.push(session.clone());
        Ok(session)
    }

    async fn update_session(
        &self,
        id: SessionId,
        update: SessionUpdate,
    ) -> Result<WarmupSession> {
        let mut inner = self.inner.lock().unwrap();
        let Some(session) =
            inner.sessions.iter_mut().find(|session| session.id == id)
        else {
            bail!("session not found: id={id}");
        };

        if !session.status.can_transition_to(update.status) {
            return Ok(session.clone());
        }

        session.status = update.status;
        if let Some(index) = update.current_lead_index {
            session.current_lead_index = index;
        }
        if let Some(message_id) = update.last_message_id {
            session.last_message_id = Some(message_id);
        }
        if let Some(error) = update.error_message {
            session.error_message = Some(error);
        }
        if let Some(completed_at) = update.completed_at {
            session.completed_at = Some(completed_at);
        }
        if update.reopen {
            session.completed_at = None;
            session.error_message = None;
        }

        Ok(session.clone())
    }

    async fn sessions(
        &self,
        domain_id: Option<AccountId>,
    ) -> Result<Vec<WarmupSession>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sessions
            .iter()
            .filter(|session| {
                domain_id.is_none_or(|id| session.domain_account_id == id)
            })
            .cloned()
            .collect())
    }

    async fn append_mail_log(&self, entry: NewMailLog) -> Result<MailLogEntry> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_log_id += 1;
        let entry = MailLogEntry {
            id: inner.next_log_id,
            session_id: entry.session_id,
            from_email: entry.from_email,
            to_email: entry.to_email,
            subject: entry.subject,
            body: entry.body,
            message_id: entry.message_id,
            in_reply_to: entry.in_reply_to,
            direction: entry.direction,
            lead_index: entry.lead_index,
            created_at: OffsetDateTime::now_utc(),
        };
        inner.mail_log.push(entry.clone());
        Ok(entry)
    }

    async fn session_mail_log(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<MailLogEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .mail_log
            .iter()
            .filter(|entry| entry.session_id == Some(session_id))
            .cloned()
            .collect())
    }

    async fn mail_log_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<MailLogEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .mail_log
            .iter()
            .find(|entry| entry.message_id.as_deref() == Some(message_id))
            .cloned())
    }

    async fn recent_mail_log(&self, limit: u32) -> Result<Vec<MailLogEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.mail_log.iter().rev().take(limit as usize).cloned().collect())
    }
}

/// Records sends and mints deterministic `<warm-{n}@{domain}>` ids.
#[derive(Default)]
pub struct ScriptedMailer {
    sent: Mutex<Vec<SendRequest>>,
    counter: AtomicU64,
    failure: Mutex<Option<String>>,
}

impl ScriptedMailer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn sent(&self) -> Vec<SendRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for ScriptedMailer {
    async fn send(&self, request: SendRequest) -> Result<SendReceipt> {
        if let Some(message) = self.failure.lock().unwrap().clone() {
            bail!("{message}");
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let message_id =
            format!("<warm-{n}@{}>", sender_domain(&request.from.email));
        let to = request.to.clone();
        self.sent.lock().unwrap().push(request);

        Ok(SendReceipt { message_id, accepted: vec![to] })
    }
}

/// Per-subscription behaviour, consumed in subscribe order.
pub enum InboxScript {
    /// Push these messages immediately after subscribe.
    Deliver(Vec<IncomingEmail>),
    /// Fire the single timeout event straight away.
    TimeoutNow,
    /// Deliver nothing and keep the channel open until disconnect.
    Silent,
}

#[derive(Default)]
pub struct ScriptedListener {
    scripts: Mutex<VecDeque<InboxScript>>,
}

impl ScriptedListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, script: InboxScript) {
        self.scripts.lock().unwrap().push_back(script);
    }
}

impl InboxListener for ScriptedListener {
    fn subscribe(
        &self,
        _mailbox: &super::model::MailboxAccess,
        _from_filter: Option<&str>,
        _options: &WatchOptions,
    ) -> InboxSubscription {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(InboxScript::TimeoutNow);

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        match script {
            InboxScript::Deliver(messages) => {
                tokio::spawn(async move {
                    for message in messages {
                        if tx.send(InboxEvent::Message(message)).await.is_err()
                        {
                            return;
                        }
                    }
                });
            }
            InboxScript::TimeoutNow => {
                tokio::spawn(async move {
                    let _ = tx.send(InboxEvent::Timeout).await;
                });
            }
            InboxScript::Silent => {
                let cancelled = cancel.clone();
                tokio::spawn(async move {
                    cancelled.cancelled().await;
                    drop(tx);
                });
            }
        }

        InboxSubscription::new(rx, cancel)
    }
}

/// Deterministic generator; `fail_with` turns every call into an error.
#[derive(Default)]
pub struct CannedGenerator {
    counter: AtomicU64,
    failure: Mutex<Option<String>>,
}

impl CannedGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    fn check_failure(&self) -> Result<()> {
        if let Some(message) = self.failure.lock().unwrap().clone() {
            bail!("{message}");
        }
        Ok(())
    }
}

#[async_trait]
impl TextGenerator for CannedGenerator {
    async fn outbound(
        &self,
        _sender_name: &str,
        recipient_name: &str,
        _sender_address: &str,
    ) -> Result<EmailDraft> {
        self.check_failure()?;
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(EmailDraft {
            subject: format!("Checking in #{n}"),
            body: format!("Hi {recipient_name}, quick note."),
        })
    }

    async fn reply(
        &self,
        _replier_name: &str,
        original_sender_name: &str,
        original_subject: &str,
        _original_body: &str,
    ) -> Result<EmailDraft> {
        self.check_failure()?;
        Ok(EmailDraft {
            subject: format!("Re: {original_subject}"),
            body: format!("Thanks {original_sender_name}, sounds good."),
        })
    }
}
