use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{MySqlPool, Row};
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::warn;

use super::crypto::CredentialCipher;
use super::model::{
    AccountId, Direction, DomainAccount, DomainStatus, LeadAccount,
    MailEndpoint, MailLogEntry, NewMailLog, SessionId, SessionStatus,
    SessionUpdate, WarmupSession,
};

/// Session date for "today" in the server's time zone; falls back to UTC
/// when the local offset cannot be determined (multi-threaded processes on
/// some unixes).
pub fn local_today() -> Date {
    OffsetDateTime::now_local()
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .date()
}

/// Durable record of accounts, per-day sessions and the mail audit log.
///
/// `update_session` is atomic with respect to concurrent readers; an update
/// whose status edge is not legal from the stored row returns the stored
/// row unchanged (callers treat a racing update as "already advanced").
#[async_trait]
pub trait WarmupStore: Send + Sync {
    async fn domain_account(
        &self,
        id: AccountId,
    ) -> Result<Option<DomainAccount>>;

    /// Full responder roster under its stable total order (creation time
    /// ascending). Appending a lead never reorders earlier entries.
    async fn lead_accounts(&self) -> Result<Vec<LeadAccount>>;

    async fn set_domain_status(
        &self,
        id: AccountId,
        status: DomainStatus,
    ) -> Result<()>;

    async fn session(&self, id: SessionId) -> Result<Option<WarmupSession>>;

    /// Row for (domain, date) with status outside {completed, failed}.
    async fn active_session_on(
        &self,
        domain_id: AccountId,
        date: Date,
    ) -> Result<Option<WarmupSession>>;

    async fn completed_session_on(
        &self,
        domain_id: AccountId,
        date: Date,
    ) -> Result<Option<WarmupSession>>;

    /// Atomic upsert on the (domain, date) uniqueness key: an existing row
    /// is reset to pending/index 0 with message-id, error and completion
    /// cleared and `started_at` bumped; otherwise a fresh row is inserted.
    async fn create_or_reset_session(
        &self,
        domain_id: AccountId,
        date: Date,
    ) -> Result<WarmupSession>;

    async fn update_session(
        &self,
        id: SessionId,
        update: SessionUpdate,
    ) -> Result<WarmupSession>;

    async fn sessions(
        &self,
        domain_id: Option<AccountId>,
    ) -> Result<Vec<WarmupSession>>;

    async fn append_mail_log(&self, entry: NewMailLog) -> Result<MailLogEntry>;

    async fn session_mail_log(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<MailLogEntry>>;

    async fn mail_log_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<MailLogEntry>>;

    async fn recent_mail_log(&self, limit: u32) -> Result<Vec<MailLogEntry>>;
}

pub struct MySqlStore {
    pool: MySqlPool,
    cipher: CredentialCipher,
}

impl MySqlStore {
    pub async fn connect(
        database_url: &str,
        cipher: CredentialCipher,
    ) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("failed to open mysql pool")?;

        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&pool)
            .await
            .context("database ping failed")?;

        Ok(Self { pool, cipher })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn map_endpoint(
        &self,
        row: &MySqlRow,
        prefix: &str,
    ) -> Result<MailEndpoint> {
        let host: String = row.try_get(format!("{prefix}_host").as_str())?;
        let port: u16 = row.try_get(format!("{prefix}_port").as_str())?;
        let secure: bool = row.try_get(format!("{prefix}_secure").as_str())?;
        let sealed: String =
            row.try_get(format!("{prefix}_password_enc").as_str())?;
        let password = self
            .cipher
            .decrypt(&sealed)
            .with_context(|| format!("failed to decrypt {prefix} credential"))?;

        Ok(MailEndpoint { host, port, secure, password })
    }

    fn map_domain_account(&self, row: &MySqlRow) -> Result<DomainAccount> {
        let status_raw: String = row.try_get("status")?;
        let status = DomainStatus::parse(&status_raw).with_context(|| {
            format!("unknown domain account status: {status_raw}")
        })?;

        Ok(DomainAccount {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            smtp: self.map_endpoint(row, "smtp")?,
            imap: self.map_endpoint(row, "imap")?,
            status,
        })
    }

    fn map_lead_account(&self, row: &MySqlRow) -> Result<LeadAccount> {
        Ok(LeadAccount {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            smtp: self.map_endpoint(row, "smtp")?,
            imap: self.map_endpoint(row, "imap")?,
        })
    }

    async fn session_by_key(
        &self,
        domain_id: AccountId,
        date: Date,
    ) -> Result<Option<WarmupSession>> {
        let row = sqlx::query(
            "SELECT * FROM warmup_sessions WHERE domain_account_id = ? AND session_date = ? LIMIT 1",
        )
        .bind(domain_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query warmup_sessions by key")?;

        row.as_ref().map(map_session).transpose()
    }
}

#[async_trait]
impl WarmupStore for MySqlStore {
    async fn domain_account(
        &self,
        id: AccountId,
    ) -> Result<Option<DomainAccount>> {
        let row = sqlx::query(
            "SELECT * FROM domain_accounts WHERE id = ? LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query domain_accounts")?;

        row.as_ref().map(|row| self.map_domain_account(row)).transpose()
    }

    async fn lead_accounts(&self) -> Result<Vec<LeadAccount>> {
        let rows = sqlx::query(
            "SELECT * FROM lead_accounts ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to query lead_accounts")?;

        rows.iter().map(|row| self.map_lead_account(row)).collect()
    }

    async fn set_domain_status(
        &self,
        id: AccountId,
        status: DomainStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE domain_accounts SET status = ?, updated_at = NOW() WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to update domain account status")?;

        if result.rows_affected() == 0 {
            warn!("domain status update matched no row: id={}", id);
        }
        Ok(())
    }

    async fn session(&self, id: SessionId) -> Result<Option<WarmupSession>> {
        let row = sqlx::query(
            "SELECT * FROM warmup_sessions WHERE id = ? LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query warmup_sessions")?;

        row.as_ref().map(map_session).transpose()
    }

    async fn active_session_on(
        &self,
        domain_id: AccountId,
        date: Date,
    ) -> Result<Option<WarmupSession>> {
        let row = sqlx::query(
            "SELECT * FROM warmup_sessions WHERE domain_account_id = ? AND session_date = ? AND status NOT IN ('completed', 'failed') LIMIT 1",
        )
        .bind(domain_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query active session")?;

        row.as_ref().map(map_session).transpose()
    }

    async fn completed_session_on(
        &self,
        domain_id: AccountId,
        date: Date,
    ) -> Result<Option<WarmupSession>> {
        let row = sqlx::query(
            "SELECT * FROM warmup_sessions WHERE domain_account_id = ? AND session_date = ? AND status = 'completed' LIMIT 1",
        )
        .bind(domain_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query completed session")?;

        row.as_ref().map(map_session).transpose()
    }

    async fn create_or_reset_session(
        &self,
        domain_id: AccountId,
        date: Date,
    ) -> Result<WarmupSession> {
        sqlx::query(
            "INSERT INTO warmup_sessions \
             (domain_account_id, session_date, current_lead_index, status, last_message_id, error_message, started_at, completed_at) \
             VALUES (?, ?, 0, 'pending', NULL, NULL, NOW(), NULL) \
             ON DUPLICATE KEY UPDATE \
             current_lead_index = 0, status = 'pending', last_message_id = NULL, \
             error_message = NULL, started_at = NOW(), completed_at = NULL",
        )
        .bind(domain_id)
        .bind(date)
        .execute(&self.pool)
        .await
        .context("failed to upsert warmup session")?;

        self.session_by_key(domain_id, date)
            .await?
            .context("session row missing after upsert")
    }

    async fn update_session(
        &self,
        id: SessionId,
        update: SessionUpdate,
    ) -> Result<WarmupSession> {
        let mut tx =
            self.pool.begin().await.context("failed to begin tx")?;

        let row = sqlx::query(
            "SELECT * FROM warmup_sessions WHERE id = ? FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to lock session row")?;

        let Some(row) = row else {
            bail!("session not found: id={id}");
        };
        let stored = map_session(&row)?;

        if !stored.status.can_transition_to(update.status) {
            tx.commit().await.context("failed to commit tx")?;
            warn!(
                "session update rejected by state machine: id={}, stored={}, requested={}",
                id,
                stored.status.as_str(),
                update.status.as_str()
            );
            return Ok(stored);
        }

        sqlx::query(
            "UPDATE warmup_sessions SET \
             status = ?, \
             current_lead_index = COALESCE(?, current_lead_index), \
             last_message_id = COALESCE(?, last_message_id), \
             error_message = IF(?, NULL, COALESCE(?, error_message)), \
             completed_at = IF(?, NULL, COALESCE(?, completed_at)) \
             WHERE id = ?",
        )
        .bind(update.status.as_str())
        .bind(update.current_lead_index)
        .bind(update.last_message_id.as_deref())
        .bind(update.reopen)
        .bind(update.error_message.as_deref())
        .bind(update.reopen)
        .bind(update.completed_at.map(to_primitive))
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed to update warmup session")?;

        let row = sqlx::query(
            "SELECT * FROM warmup_sessions WHERE id = ? LIMIT 1",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to re-read warmup session")?;
        let updated = map_session(&row)?;

        tx.commit().await.context("failed to commit tx")?;
        Ok(updated)
    }

    async fn sessions(
        &self,
        domain_id: Option<AccountId>,
    ) -> Result<Vec<WarmupSession>> {
        let rows = match domain_id {
            Some(domain_id) => {
                sqlx::query(
                    "SELECT * FROM warmup_sessions WHERE domain_account_id = ? ORDER BY session_date DESC, id DESC",
                )
                .bind(domain_id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM warmup_sessions ORDER BY session_date DESC, id DESC",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("failed to list warmup sessions")?;

        rows.iter().map(map_session).collect()
    }

    async fn append_mail_log(&self, entry: NewMailLog) -> Result<MailLogEntry> {
        let result = sqlx::query(
            "INSERT INTO mail_logs \
             (session_id, from_email, to_email, subject, body, message_id, in_reply_to, direction, lead_index, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NOW())",
        )
        .bind(entry.session_id)
        .bind(&entry.from_email)
        .bind(&entry.to_email)
        .bind(&entry.subject)
        .bind(&entry.body)
        .bind(entry.message_id.as_deref())
        .bind(entry.in_reply_to.as_deref())
        .bind(entry.direction.as_str())
        .bind(entry.lead_index)
        .execute(&self.pool)
        .await
        .context("failed to insert mail log entry")?;

        let row = sqlx::query("SELECT * FROM mail_logs WHERE id = ? LIMIT 1")
            .bind(result.last_insert_id())
            .fetch_one(&self.pool)
            .await
            .context("failed to re-read mail log entry")?;

        map_mail_log(&row)
    }

    async fn session_mail_log(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<MailLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM mail_logs WHERE session_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to query session mail log")?;

        rows.iter().map(map_mail_log).collect()
    }

    async fn mail_log_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<MailLogEntry>> {
        let row = sqlx::query(
            "SELECT * FROM mail_logs WHERE message_id = ? LIMIT 1",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query mail log by message id")?;

        row.as_ref().map(map_mail_log).transpose()
    }

    async fn recent_mail_log(&self, limit: u32) -> Result<Vec<MailLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM mail_logs ORDER BY id DESC LIMIT ?",
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await
        .context("failed to query recent mail log")?;

        rows.iter().map(map_mail_log).collect()
    }
}

fn map_session(row: &MySqlRow) -> Result<WarmupSession> {
    let status_raw: String = row.try_get("status")?;
    let status = SessionStatus::parse(&status_raw)
        .with_context(|| format!("unknown session status: {status_raw}"))?;

    Ok(WarmupSession {
        id: row.try_get("id")?,
        domain_account_id: row.try_get("domain_account_id")?,
        session_date: row.try_get("session_date")?,
        current_lead_index: row.try_get("current_lead_index")?,
        status,
        last_message_id: row.try_get("last_message_id")?,
        error_message: row.try_get("error_message")?,
        started_at: row
            .try_get::<PrimitiveDateTime, _>("started_at")?
            .assume_utc(),
        completed_at: row
            .try_get::<Option<PrimitiveDateTime>, _>("completed_at")?
            .map(PrimitiveDateTime::assume_utc),
    })
}

fn map_mail_log(row: &MySqlRow) -> Result<MailLogEntry> {
    let direction_raw: String = row.try_get("direction")?;
    let direction = Direction::parse(&direction_raw).with_context(|| {
        format!("unknown mail log direction: {direction_raw}")
    })?;

    Ok(MailLogEntry {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        from_email: row.try_get("from_email")?,
        to_email: row.try_get("to_email")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        message_id: row.try_get("message_id")?,
        in_reply_to: row.try_get("in_reply_to")?,
        direction,
        lead_index: row.try_get("lead_index")?,
        created_at: row
            .try_get::<PrimitiveDateTime, _>("created_at")?
            .assume_utc(),
    })
}

fn to_primitive(at: OffsetDateTime) -> PrimitiveDateTime {
    let utc = at.to_offset(UtcOffset::UTC);
    PrimitiveDateTime::new(utc.date(), utc.time())
}
