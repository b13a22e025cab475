use std::collections::HashMap;

use anyhow::anyhow;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::model::{
    AccountId, DomainAccount, DomainStatus, MailLogEntry, SessionId,
    SessionStatus, SessionUpdate, WarmupSession,
};
use super::orchestrator::{
    MANUAL_STOP_MESSAGE, Orchestrator, OrchestratorDeps, StopReason,
    WarmupHandle, WarmupTiming,
};
use super::store::{WarmupStore, local_today};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("domain account not found: {0}")]
    DomainNotFound(AccountId),
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("no lead accounts configured")]
    NoLeads,
    #[error("warm-up already running for this domain account")]
    AlreadyRunning,
    #[error("warm-up already completed for today")]
    CompletedToday,
    #[error("warm-up session already exists with status {0}")]
    SessionExists(String),
    #[error("no active warm-up for this domain account")]
    NotRunning,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStatus {
    pub current_lead_index: usize,
    pub total_leads: usize,
    pub is_paused: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupStatus {
    pub active: Option<ActiveStatus>,
    pub session: Option<WarmupSession>,
    /// False while a completed session can still be restarted with
    /// appended leads.
    pub completed_today: bool,
}

/// Control facade: the single entry point for start/pause/resume/stop and
/// the owner of the live-orchestrator registry (at most one per domain
/// account). Registry mutations happen only here; sessions left
/// non-terminal by a crash are not revived at boot and wait for an
/// explicit start.
pub struct WarmupControl {
    deps: OrchestratorDeps,
    timing: WarmupTiming,
    registry: Mutex<HashMap<AccountId, WarmupHandle>>,
}

impl WarmupControl {
    pub fn new(deps: OrchestratorDeps, timing: WarmupTiming) -> Self {
        Self { deps, timing, registry: Mutex::new(HashMap::new()) }
    }

    /// Starts (or resumes) today's warm-up for the domain account. The
    /// registry lock is held across session resolution so racing starts
    /// serialize and exactly one wins.
    pub async fn start(
        &self,
        domain_id: AccountId,
    ) -> Result<WarmupSession, ControlError> {
        let mut registry = self.registry.lock().await;
        reap_finished(&mut registry);

        if registry.contains_key(&domain_id) {
            return Err(ControlError::AlreadyRunning);
        }

        let domain = self
            .deps
            .store
            .domain_account(domain_id)
            .await?
            .ok_or(ControlError::DomainNotFound(domain_id))?;

        let leads = self.deps.store.lead_accounts().await?;
        if leads.is_empty() {
            return Err(ControlError::NoLeads);
        }

        let session = self.resolve_session(&domain, leads.len()).await?;

        self.deps
            .store
            .set_domain_status(domain_id, DomainStatus::Running)
            .await?;

        let handle = Orchestrator::launch(
            self.deps.clone(),
            self.timing.clone(),
            domain,
            leads,
            session.clone(),
        );
        registry.insert(domain_id, handle);

        info!(
            "warmup started: domain_id={}, session={}, index={}, status={}",
            domain_id,
            session.id,
            session.current_lead_index,
            session.status.as_str()
        );
        Ok(session)
    }

    /// Initial session state, resolved in the documented order: completed
    /// today with appended leads resumes, completed without rejects, a
    /// paused row resumes from its stored index, any other non-terminal
    /// row rejects, and a missing row is created (or reset) for today.
    async fn resolve_session(
        &self,
        domain: &DomainAccount,
        total_leads: usize,
    ) -> Result<WarmupSession, ControlError> {
        let today = local_today();

        if let Some(completed) = self
            .deps
            .store
            .completed_session_on(domain.id, today)
            .await?
        {
            if completed.has_appended_leads(total_leads) {
                info!(
                    "resuming completed session with appended leads: session={}, index={}, leads={}",
                    completed.id, completed.current_lead_index, total_leads
                );
                let row = self
                    .deps
                    .store
                    .update_session(
                        completed.id,
                        SessionUpdate::status(SessionStatus::Sending)
                            .reopen(),
                    )
                    .await?;
                return Ok(row);
            }
            return Err(ControlError::CompletedToday);
        }

        if let Some(active) =
            self.deps.store.active_session_on(domain.id, today).await?
        {
            return match active.status {
                SessionStatus::Paused => {
                    let row = self
                        .deps
                        .store
                        .update_session(
                            active.id,
                            SessionUpdate::status(SessionStatus::Sending),
                        )
                        .await?;
                    Ok(row)
                }
                status => Err(ControlError::SessionExists(
                    status.as_str().to_string(),
                )),
            };
        }

        Ok(self
            .deps
            .store
            .create_or_reset_session(domain.id, today)
            .await?)
    }

    /// Pauses the live run; the orchestrator finishes its in-flight send,
    /// persists the paused row and is deregistered. Pausing an
    /// already-paused session returns its row unchanged.
    pub async fn pause(
        &self,
        domain_id: AccountId,
    ) -> Result<WarmupSession, ControlError> {
        let mut registry = self.registry.lock().await;
        reap_finished(&mut registry);

        let Some(handle) = registry.remove(&domain_id) else {
            drop(registry);
            if let Some(row) = self
                .deps
                .store
                .active_session_on(domain_id, local_today())
                .await?
            {
                if row.status == SessionStatus::Paused {
                    return Ok(row);
                }
            }
            return Err(ControlError::NotRunning);
        };

        let session_id = handle.session_id();
        handle.shutdown(StopReason::Pause).await;

        info!("warmup paused: domain_id={}, session={}", domain_id, session_id);
        self.session_row(session_id).await
    }

    /// Alias for start; a paused row resumes via the start path.
    pub async fn resume(
        &self,
        domain_id: AccountId,
    ) -> Result<WarmupSession, ControlError> {
        self.start(domain_id).await
    }

    /// Stops the live run, or fails today's stale non-terminal row when no
    /// orchestrator is registered. Returns None when there is nothing to
    /// stop.
    pub async fn stop(
        &self,
        domain_id: AccountId,
    ) -> Result<Option<WarmupSession>, ControlError> {
        let mut registry = self.registry.lock().await;
        reap_finished(&mut registry);

        if let Some(handle) = registry.remove(&domain_id) {
            let session_id = handle.session_id();
            handle.shutdown(StopReason::Stop).await;
            info!(
                "warmup stopped: domain_id={}, session={}",
                domain_id, session_id
            );
            return Ok(Some(self.session_row(session_id).await?));
        }
        drop(registry);

        if let Some(active) = self
            .deps
            .store
            .active_session_on(domain_id, local_today())
            .await?
        {
            let row = self
                .deps
                .store
                .update_session(
                    active.id,
                    SessionUpdate::status(SessionStatus::Failed)
                        .error(MANUAL_STOP_MESSAGE),
                )
                .await?;
            self.deps
                .store
                .set_domain_status(domain_id, DomainStatus::Idle)
                .await?;
            info!(
                "stale warmup session stopped: domain_id={}, session={}",
                domain_id, row.id
            );
            return Ok(Some(row));
        }

        Ok(None)
    }

    pub async fn status(
        &self,
        domain_id: AccountId,
    ) -> Result<WarmupStatus, ControlError> {
        self.deps
            .store
            .domain_account(domain_id)
            .await?
            .ok_or(ControlError::DomainNotFound(domain_id))?;

        let active = {
            let mut registry = self.registry.lock().await;
            reap_finished(&mut registry);
            registry.get(&domain_id).map(|handle| {
                let state = handle.run_state();
                ActiveStatus {
                    current_lead_index: state.current_lead_index(),
                    total_leads: state.total_leads(),
                    is_paused: state.is_paused(),
                }
            })
        };

        let today = local_today();
        let total_leads = self.deps.store.lead_accounts().await?.len();
        let active_row =
            self.deps.store.active_session_on(domain_id, today).await?;
        let completed_row =
            self.deps.store.completed_session_on(domain_id, today).await?;

        let completed_today = completed_row
            .as_ref()
            .is_some_and(|row| !row.has_appended_leads(total_leads));
        let session = active_row.or(completed_row);

        Ok(WarmupStatus { active, session, completed_today })
    }

    pub async fn sessions(
        &self,
        domain_id: Option<AccountId>,
    ) -> Result<Vec<WarmupSession>, ControlError> {
        Ok(self.deps.store.sessions(domain_id).await?)
    }

    pub async fn session_logs(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<MailLogEntry>, ControlError> {
        self.deps
            .store
            .session(session_id)
            .await?
            .ok_or(ControlError::SessionNotFound(session_id))?;
        Ok(self.deps.store.session_mail_log(session_id).await?)
    }

    pub async fn recent_logs(
        &self,
        limit: u32,
    ) -> Result<Vec<MailLogEntry>, ControlError> {
        Ok(self.deps.store.recent_mail_log(limit).await?)
    }

    /// Pauses every live orchestrator; part of graceful shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<(AccountId, WarmupHandle)> = {
            let mut registry = self.registry.lock().await;
            registry.drain().collect()
        };

        for (domain_id, handle) in handles {
            info!("pausing warmup for shutdown: domain_id={}", domain_id);
            handle.shutdown(StopReason::Pause).await;
        }
    }

    async fn session_row(
        &self,
        session_id: SessionId,
    ) -> Result<WarmupSession, ControlError> {
        self.deps
            .store
            .session(session_id)
            .await?
            .ok_or_else(|| {
                ControlError::Store(anyhow!(
                    "session row disappeared: id={session_id}"
                ))
            })
    }
}

fn reap_finished(registry: &mut HashMap<AccountId, WarmupHandle>) {
    registry.retain(|domain_id, handle| {
        let finished = handle.is_finished();
        if finished {
            debug!("reaping finished orchestrator: domain_id={}", domain_id);
        }
        !finished
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::model::Direction;
    use crate::core::orchestrator::OrchestratorDeps;
    use crate::core::testsupport::{
        CannedGenerator, InboxScript, MemoryStore, ScriptedListener,
        ScriptedMailer, domain_account, incoming, lead_account, test_timing,
        wait_for_session_status,
    };

    const DOMAIN: &str = "warm@corp.example";
    const LEAD_1: &str = "lead1@pool.example";
    const LEAD_2: &str = "lead2@pool.example";

    struct Harness {
        store: Arc<MemoryStore>,
        mailer: Arc<ScriptedMailer>,
        listener: Arc<ScriptedListener>,
        generator: Arc<CannedGenerator>,
        control: WarmupControl,
    }

    fn harness() -> Harness {
        let store = MemoryStore::new();
        let mailer = ScriptedMailer::new();
        let listener = ScriptedListener::new();
        let generator = CannedGenerator::new();

        let deps = OrchestratorDeps {
            store: store.clone(),
            mailer: mailer.clone(),
            listener: listener.clone(),
            generator: generator.clone(),
        };
        let control = WarmupControl::new(deps, test_timing());

        Harness { store, mailer, listener, generator, control }
    }

    fn seed_domain(harness: &Harness) {
        harness.store.add_domain(domain_account(1, DOMAIN, "Warm Sender"));
    }

    /// Scripts one full round-trip for a lead: the warm-up message lands
    /// on the lead inbox, then the reply lands on the domain inbox.
    fn script_round_trip(
        harness: &Harness,
        lead_email: &str,
        outbound_mid: &str,
        reply_mid: &str,
    ) {
        harness.listener.push(InboxScript::Deliver(vec![incoming(
            DOMAIN,
            outbound_mid,
            None,
        )]));
        harness.listener.push(InboxScript::Deliver(vec![incoming(
            lead_email,
            reply_mid,
            Some(outbound_mid),
        )]));
    }

    #[tokio::test]
    async fn happy_path_two_leads_completes_with_full_log() {
        let harness = harness();
        seed_domain(&harness);
        harness.store.add_lead(lead_account(10, LEAD_1, "Lead One"));
        harness.store.add_lead(lead_account(11, LEAD_2, "Lead Two"));

        // Deterministic mailer ids: send order is outbound L1, reply L1,
        // outbound L2, reply L2.
        script_round_trip(
            &harness,
            LEAD_1,
            "<warm-1@corp.example>",
            "<reply-1@pool.example>",
        );
        script_round_trip(
            &harness,
            LEAD_2,
            "<warm-3@corp.example>",
            "<reply-2@pool.example>",
        );

        let session = harness.control.start(1).await.unwrap();
        let row = wait_for_session_status(
            &harness.store,
            session.id,
            SessionStatus::Completed,
        )
        .await;

        assert_eq!(row.current_lead_index, 2);
        assert!(row.completed_at.is_some());
        assert!(row.error_message.is_none());
        assert_eq!(
            harness.store.domain_status(1),
            crate::core::model::DomainStatus::Idle
        );

        assert_eq!(
            harness.store.log_shape(session.id),
            vec![
                (Direction::Sent, 0),
                (Direction::Received, 0),
                (Direction::Replied, 0),
                (Direction::Received, 0),
                (Direction::Sent, 1),
                (Direction::Received, 1),
                (Direction::Replied, 1),
                (Direction::Received, 1),
            ]
        );

        // Every replied entry threads back to a sent entry.
        let log = harness.store.session_mail_log(session.id).await.unwrap();
        let sent_ids: Vec<_> = log
            .iter()
            .filter(|entry| entry.direction == Direction::Sent)
            .filter_map(|entry| entry.message_id.clone())
            .collect();
        for replied in
            log.iter().filter(|entry| entry.direction == Direction::Replied)
        {
            let in_reply_to =
                replied.in_reply_to.as_ref().expect("reply without thread");
            assert!(sent_ids.contains(in_reply_to));
        }

        assert_eq!(harness.mailer.sent().len(), 4);
    }

    #[tokio::test]
    async fn lead_that_never_receives_is_skipped() {
        let harness = harness();
        seed_domain(&harness);
        harness.store.add_lead(lead_account(10, LEAD_1, "Lead One"));
        harness.listener.push(InboxScript::TimeoutNow);

        let session = harness.control.start(1).await.unwrap();
        let row = wait_for_session_status(
            &harness.store,
            session.id,
            SessionStatus::Completed,
        )
        .await;

        assert_eq!(row.current_lead_index, 1);
        let shape = harness.store.log_shape(session.id);
        assert_eq!(shape, vec![(Direction::Sent, 0)]);
    }

    #[tokio::test]
    async fn duplicate_deliveries_are_accepted_once() {
        let harness = harness();
        seed_domain(&harness);
        harness.store.add_lead(lead_account(10, LEAD_1, "Lead One"));

        let message = incoming(DOMAIN, "<warm-1@corp.example>", None);
        harness.listener.push(InboxScript::Deliver(vec![
            message.clone(),
            message,
        ]));
        harness.listener.push(InboxScript::Deliver(vec![incoming(
            LEAD_1,
            "<reply-1@pool.example>",
            Some("<warm-1@corp.example>"),
        )]));

        let session = harness.control.start(1).await.unwrap();
        let row = wait_for_session_status(
            &harness.store,
            session.id,
            SessionStatus::Completed,
        )
        .await;

        assert_eq!(row.current_lead_index, 1);
        assert_eq!(harness.store.log_shape(session.id).len(), 4);
    }

    #[tokio::test]
    async fn pause_mid_wait_then_resume_completes() {
        let harness = harness();
        seed_domain(&harness);
        harness.store.add_lead(lead_account(10, LEAD_1, "Lead One"));
        harness.store.add_lead(lead_account(11, LEAD_2, "Lead Two"));
        harness.listener.push(InboxScript::Silent);

        let session = harness.control.start(1).await.unwrap();
        wait_for_session_status(
            &harness.store,
            session.id,
            SessionStatus::WaitingReply,
        )
        .await;

        let paused = harness.control.pause(1).await.unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);
        assert_eq!(paused.current_lead_index, 0);
        assert_eq!(
            harness.store.domain_status(1),
            crate::core::model::DomainStatus::Paused
        );

        let status = harness.control.status(1).await.unwrap();
        assert!(status.active.is_none());
        assert!(!status.completed_today);

        // Resume restarts the interrupted lead from step one.
        harness.listener.push(InboxScript::Deliver(vec![incoming(
            DOMAIN,
            "<warm-2@corp.example>",
            None,
        )]));
        harness.listener.push(InboxScript::Deliver(vec![incoming(
            LEAD_1,
            "<reply-1@pool.example>",
            None,
        )]));
        harness.listener.push(InboxScript::Deliver(vec![incoming(
            DOMAIN,
            "<warm-4@corp.example>",
            None,
        )]));
        harness.listener.push(InboxScript::Deliver(vec![incoming(
            LEAD_2,
            "<reply-2@pool.example>",
            None,
        )]));

        let resumed = harness.control.resume(1).await.unwrap();
        assert_eq!(resumed.id, session.id);

        let row = wait_for_session_status(
            &harness.store,
            session.id,
            SessionStatus::Completed,
        )
        .await;
        assert_eq!(row.current_lead_index, 2);
    }

    #[tokio::test]
    async fn pause_is_idempotent() {
        let harness = harness();
        seed_domain(&harness);
        harness.store.add_lead(lead_account(10, LEAD_1, "Lead One"));
        harness.listener.push(InboxScript::Silent);

        let session = harness.control.start(1).await.unwrap();
        wait_for_session_status(
            &harness.store,
            session.id,
            SessionStatus::WaitingReply,
        )
        .await;

        let first = harness.control.pause(1).await.unwrap();
        let second = harness.control.pause(1).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn stop_marks_session_manually_stopped() {
        let harness = harness();
        seed_domain(&harness);
        harness.store.add_lead(lead_account(10, LEAD_1, "Lead One"));
        harness.listener.push(InboxScript::Silent);

        let session = harness.control.start(1).await.unwrap();
        wait_for_session_status(
            &harness.store,
            session.id,
            SessionStatus::WaitingReply,
        )
        .await;

        let stopped = harness.control.stop(1).await.unwrap().unwrap();
        assert_eq!(stopped.status, SessionStatus::Failed);
        assert_eq!(
            stopped.error_message.as_deref(),
            Some(MANUAL_STOP_MESSAGE)
        );
        assert_eq!(
            harness.store.domain_status(1),
            crate::core::model::DomainStatus::Idle
        );

        // Stop with nothing left to stop is a no-op.
        assert!(harness.control.stop(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn appended_leads_resume_a_completed_session() {
        let harness = harness();
        seed_domain(&harness);
        harness.store.add_lead(lead_account(10, LEAD_1, "Lead One"));
        script_round_trip(
            &harness,
            LEAD_1,
            "<warm-1@corp.example>",
            "<reply-1@pool.example>",
        );

        let session = harness.control.start(1).await.unwrap();
        wait_for_session_status(
            &harness.store,
            session.id,
            SessionStatus::Completed,
        )
        .await;
        assert!(harness.control.status(1).await.unwrap().completed_today);

        // A second start without new leads is rejected outright.
        assert!(matches!(
            harness.control.start(1).await,
            Err(ControlError::CompletedToday)
        ));

        harness.store.add_lead(lead_account(11, LEAD_2, "Lead Two"));
        let status = harness.control.status(1).await.unwrap();
        assert!(!status.completed_today, "restart should be available");

        script_round_trip(
            &harness,
            LEAD_2,
            "<warm-3@corp.example>",
            "<reply-2@pool.example>",
        );

        let resumed = harness.control.start(1).await.unwrap();
        assert_eq!(resumed.id, session.id);
        assert_eq!(resumed.current_lead_index, 1);
        assert!(resumed.completed_at.is_none());

        let row = wait_for_session_status(
            &harness.store,
            session.id,
            SessionStatus::Completed,
        )
        .await;
        assert_eq!(row.current_lead_index, 2);

        // Lead-one history is preserved alongside the new entries.
        let shape = harness.store.log_shape(session.id);
        assert_eq!(shape.len(), 8);
        assert_eq!(shape[0], (Direction::Sent, 0));
        assert_eq!(shape[4], (Direction::Sent, 1));
    }

    #[tokio::test]
    async fn concurrent_starts_race_to_one_winner() {
        let harness = harness();
        seed_domain(&harness);
        harness.store.add_lead(lead_account(10, LEAD_1, "Lead One"));
        harness.listener.push(InboxScript::Silent);
        harness.listener.push(InboxScript::Silent);

        let (a, b) =
            tokio::join!(harness.control.start(1), harness.control.start(1));
        let winners = [a.is_ok(), b.is_ok()];
        assert_eq!(winners.iter().filter(|ok| **ok).count(), 1);
        assert!(
            matches!(a, Err(ControlError::AlreadyRunning))
                || matches!(b, Err(ControlError::AlreadyRunning))
        );

        let status = harness.control.status(1).await.unwrap();
        assert!(status.active.is_some());

        harness.control.stop(1).await.unwrap();
    }

    #[tokio::test]
    async fn start_without_leads_creates_no_session() {
        let harness = harness();
        seed_domain(&harness);

        assert!(matches!(
            harness.control.start(1).await,
            Err(ControlError::NoLeads)
        ));
        assert!(harness.control.sessions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_rejects_unknown_domain_and_stale_active_rows() {
        let harness = harness();
        seed_domain(&harness);
        harness.store.add_lead(lead_account(10, LEAD_1, "Lead One"));

        assert!(matches!(
            harness.control.start(99).await,
            Err(ControlError::DomainNotFound(99))
        ));

        // A stale waiting_reply row (e.g. left by a crash) blocks start
        // until it is stopped.
        let stale = harness
            .store
            .create_or_reset_session(1, local_today())
            .await
            .unwrap();
        harness
            .store
            .update_session(
                stale.id,
                SessionUpdate::status(SessionStatus::Sending),
            )
            .await
            .unwrap();
        harness
            .store
            .update_session(
                stale.id,
                SessionUpdate::status(SessionStatus::WaitingReply),
            )
            .await
            .unwrap();

        match harness.control.start(1).await {
            Err(ControlError::SessionExists(status)) => {
                assert_eq!(status, "waiting_reply");
            }
            other => panic!("expected SessionExists, got {other:?}"),
        }

        // Stop clears the stale row, after which start succeeds.
        let stopped = harness.control.stop(1).await.unwrap().unwrap();
        assert_eq!(stopped.status, SessionStatus::Failed);

        harness.listener.push(InboxScript::TimeoutNow);
        let session = harness.control.start(1).await.unwrap();
        assert_eq!(session.id, stale.id, "same-day row is reused");
        wait_for_session_status(
            &harness.store,
            session.id,
            SessionStatus::Completed,
        )
        .await;
    }

    #[tokio::test]
    async fn smtp_failure_fails_the_session() {
        let harness = harness();
        seed_domain(&harness);
        harness.store.add_lead(lead_account(10, LEAD_1, "Lead One"));
        harness.mailer.fail_with("relay rejected sender");

        let session = harness.control.start(1).await.unwrap();
        let row = wait_for_session_status(
            &harness.store,
            session.id,
            SessionStatus::Failed,
        )
        .await;

        let error = row.error_message.unwrap();
        assert!(error.contains("relay rejected sender"), "error: {error}");
        assert_eq!(
            harness.store.domain_status(1),
            crate::core::model::DomainStatus::Idle
        );
    }

    #[tokio::test]
    async fn generator_failure_fails_the_session() {
        let harness = harness();
        seed_domain(&harness);
        harness.store.add_lead(lead_account(10, LEAD_1, "Lead One"));
        harness.generator.fail_with("empty completion");

        let session = harness.control.start(1).await.unwrap();
        let row = wait_for_session_status(
            &harness.store,
            session.id,
            SessionStatus::Failed,
        )
        .await;
        assert!(row.error_message.unwrap().contains("empty completion"));
    }

    #[tokio::test]
    async fn create_or_reset_is_idempotent_within_a_day() {
        let harness = harness();
        seed_domain(&harness);

        let today = local_today();
        let first =
            harness.store.create_or_reset_session(1, today).await.unwrap();
        harness
            .store
            .update_session(
                first.id,
                SessionUpdate::status(SessionStatus::Sending).index(3),
            )
            .await
            .unwrap();

        let second =
            harness.store.create_or_reset_session(1, today).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.domain_account_id, 1);
        assert_eq!(second.session_date, today);
        assert_eq!(second.status, SessionStatus::Pending);
        assert_eq!(second.current_lead_index, 0);
    }

    #[tokio::test]
    async fn shutdown_pauses_every_live_run() {
        let harness = harness();
        seed_domain(&harness);
        harness.store.add_domain(domain_account(2, "warm2@corp.example", "Second"));
        harness.store.add_lead(lead_account(10, LEAD_1, "Lead One"));
        harness.listener.push(InboxScript::Silent);
        harness.listener.push(InboxScript::Silent);

        let first = harness.control.start(1).await.unwrap();
        let second = harness.control.start(2).await.unwrap();
        wait_for_session_status(
            &harness.store,
            first.id,
            SessionStatus::WaitingReply,
        )
        .await;
        wait_for_session_status(
            &harness.store,
            second.id,
            SessionStatus::WaitingReply,
        )
        .await;

        harness.control.shutdown().await;

        let first_row =
            harness.store.session(first.id).await.unwrap().unwrap();
        let second_row =
            harness.store.session(second.id).await.unwrap().unwrap();
        assert_eq!(first_row.status, SessionStatus::Paused);
        assert_eq!(second_row.status, SessionStatus::Paused);
    }
}
