use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rand::Rng;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::imap::{InboxEvent, InboxListener, InboxSubscription, WatchOptions};
use super::model::{
    Direction, DomainAccount, DomainStatus, LeadAccount, NewMailLog,
    SessionId, SessionStatus, SessionUpdate, WarmupSession, same_address,
};
use super::smtp::{Mailer, SendRequest};
use super::store::WarmupStore;
use super::textgen::TextGenerator;

pub const MANUAL_STOP_MESSAGE: &str = "Manually stopped by user";

/// Pacing knobs for one warm-up run. Tests collapse the delays to zero.
#[derive(Debug, Clone)]
pub struct WarmupTiming {
    /// Pause between finishing one lead's round-trip and starting the next.
    pub inter_lead_min: Duration,
    pub inter_lead_max: Duration,
    /// Wait budget granted to each inbox subscription.
    pub imap_wait_timeout: Duration,
    pub poll_interval: Duration,
    /// Pause between receiving the warm-up message and sending the reply.
    pub human_delay_min: Duration,
    pub human_delay_max: Duration,
    /// Fixed pause after a lead is skipped on timeout.
    pub skip_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for WarmupTiming {
    fn default() -> Self {
        Self {
            inter_lead_min: Duration::from_secs(180),
            inter_lead_max: Duration::from_secs(300),
            imap_wait_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(30),
            human_delay_min: Duration::from_secs(180),
            human_delay_max: Duration::from_secs(300),
            skip_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl WarmupTiming {
    fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            wait_timeout: self.imap_wait_timeout,
            poll_interval: self.poll_interval,
            connect_timeout: self.connect_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Pause,
    Stop,
}

/// Shared view of a live run, read by the status endpoint and written by
/// the owning task and the facade's pause/stop signalling.
pub struct RunState {
    current_lead_index: AtomicUsize,
    total_leads: usize,
    paused: AtomicBool,
    stop_reason: Mutex<Option<StopReason>>,
}

impl RunState {
    fn new(current_lead_index: usize, total_leads: usize) -> Arc<Self> {
        Arc::new(Self {
            current_lead_index: AtomicUsize::new(current_lead_index),
            total_leads,
            paused: AtomicBool::new(false),
            stop_reason: Mutex::new(None),
        })
    }

    pub fn current_lead_index(&self) -> usize {
        self.current_lead_index.load(Ordering::Relaxed)
    }

    pub fn total_leads(&self) -> usize {
        self.total_leads
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn request_stop(&self, reason: StopReason) {
        if reason == StopReason::Pause {
            self.paused.store(true, Ordering::Relaxed);
        }
        let mut slot = self.stop_reason.lock().expect("stop reason poisoned");
        slot.get_or_insert(reason);
    }

    fn stop_reason(&self) -> Option<StopReason> {
        *self.stop_reason.lock().expect("stop reason poisoned")
    }
}

/// Everything an orchestrator composes: durable store, the two transport
/// adapters and the text generator.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub store: Arc<dyn WarmupStore>,
    pub mailer: Arc<dyn Mailer>,
    pub listener: Arc<dyn InboxListener>,
    pub generator: Arc<dyn TextGenerator>,
}

/// Registry entry for one live run. Dropping the handle does not stop the
/// task; `shutdown` signals a reason, cancels and waits for the task to
/// persist its final row.
pub struct WarmupHandle {
    session_id: SessionId,
    state: Arc<RunState>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WarmupHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn run_state(&self) -> &RunState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn shutdown(self, reason: StopReason) {
        self.state.request_stop(reason);
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            warn!(
                "orchestrator task join failed: session={}, error={err}",
                self.session_id
            );
        }
    }
}

enum Outcome {
    Completed,
    Interrupted,
    Failed(anyhow::Error),
}

enum Cycle {
    Advanced,
    Skipped,
    Interrupted,
}

enum Wait {
    Message(super::model::IncomingEmail),
    TimedOut,
    Interrupted,
}

/// Drives one domain account through the lead roster as a single
/// sequential task: send, wait for delivery on the lead inbox, reply, wait
/// for the reply on the domain inbox, advance. The task is the only writer
/// of its session row; the facade signals pause/stop and waits.
pub struct Orchestrator {
    deps: OrchestratorDeps,
    timing: WarmupTiming,
    domain: DomainAccount,
    leads: Vec<LeadAccount>,
    session: WarmupSession,
    state: Arc<RunState>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn launch(
        deps: OrchestratorDeps,
        timing: WarmupTiming,
        domain: DomainAccount,
        leads: Vec<LeadAccount>,
        session: WarmupSession,
    ) -> WarmupHandle {
        let state =
            RunState::new(session.current_lead_index as usize, leads.len());
        let cancel = CancellationToken::new();
        let session_id = session.id;

        let orchestrator = Orchestrator {
            deps,
            timing,
            domain,
            leads,
            session,
            state: state.clone(),
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(orchestrator.run());

        WarmupHandle { session_id, state, cancel, join }
    }

    async fn run(mut self) {
        info!(
            "warmup session starting: domain={}, session={}, leads={}, start_index={}",
            self.domain.email,
            self.session.id,
            self.leads.len(),
            self.session.current_lead_index
        );

        let outcome = self.drive().await;
        self.finish(outcome).await;
    }

    async fn drive(&mut self) -> Outcome {
        if let Err(err) =
            self.persist(SessionUpdate::status(SessionStatus::Sending)).await
        {
            return Outcome::Failed(err);
        }

        loop {
            if self.cancel.is_cancelled() {
                return Outcome::Interrupted;
            }

            let index = self.session.current_lead_index as usize;
            if index >= self.leads.len() {
                return Outcome::Completed;
            }

            let lead = self.leads[index].clone();
            let cycle = match self.run_lead_cycle(index, &lead).await {
                Ok(cycle) => cycle,
                Err(err) => return Outcome::Failed(err),
            };

            match cycle {
                Cycle::Interrupted => return Outcome::Interrupted,
                Cycle::Advanced => {
                    if self.session.current_lead_index as usize
                        >= self.leads.len()
                    {
                        return Outcome::Completed;
                    }
                    let delay = draw_delay(
                        self.timing.inter_lead_min,
                        self.timing.inter_lead_max,
                    );
                    debug!(
                        "inter-lead delay: domain={}, delay={:?}",
                        self.domain.email, delay
                    );
                    if !self.interruptible_sleep(delay).await {
                        return Outcome::Interrupted;
                    }
                }
                Cycle::Skipped => {
                    if !self.interruptible_sleep(self.timing.skip_delay).await
                    {
                        return Outcome::Interrupted;
                    }
                }
            }
        }
    }

    /// One full round-trip with the lead at `index`.
    async fn run_lead_cycle(
        &mut self,
        index: usize,
        lead: &LeadAccount,
    ) -> Result<Cycle> {
        info!(
            "lead cycle starting: domain={}, lead={}, index={}",
            self.domain.email, lead.email, index
        );

        let draft = self
            .deps
            .generator
            .outbound(&self.domain.name, &lead.name, &self.domain.email)
            .await
            .context("text generator failed for outbound message")?;

        let receipt = self
            .deps
            .mailer
            .send(SendRequest {
                from: self.domain.smtp_access(),
                to: lead.email.clone(),
                subject: draft.subject.clone(),
                body: draft.body.clone(),
                in_reply_to: None,
            })
            .await
            .context("smtp send to lead failed")?;

        self.append_log(NewMailLog {
            session_id: Some(self.session.id),
            from_email: self.domain.email.clone(),
            to_email: lead.email.clone(),
            subject: draft.subject,
            body: draft.body,
            message_id: Some(receipt.message_id.clone()),
            in_reply_to: None,
            direction: Direction::Sent,
            lead_index: index as u32,
        })
        .await?;

        self.persist(
            SessionUpdate::status(SessionStatus::WaitingReply)
                .message_id(receipt.message_id),
        )
        .await?;

        if self.cancel.is_cancelled() {
            return Ok(Cycle::Interrupted);
        }

        // Wait on the lead's inbox for the warm-up message to arrive.
        let mut lead_watch = self.deps.listener.subscribe(
            &lead.imap_access(),
            Some(&self.domain.email),
            &self.timing.watch_options(),
        );

        let incoming = match self
            .await_matching(&mut lead_watch, &self.domain.email)
            .await
        {
            Wait::Message(email) => email,
            Wait::Interrupted => {
                lead_watch.disconnect();
                return Ok(Cycle::Interrupted);
            }
            Wait::TimedOut => {
                lead_watch.disconnect();
                warn!(
                    "warm-up message never arrived on lead inbox: lead={}, index={}",
                    lead.email, index
                );
                return self.skip_lead(index).await;
            }
        };

        self.append_log(NewMailLog {
            session_id: Some(self.session.id),
            from_email: incoming.from.clone(),
            to_email: lead.email.clone(),
            subject: incoming.subject.clone(),
            body: incoming.body.clone(),
            message_id: incoming.message_id.clone(),
            in_reply_to: incoming.in_reply_to.clone(),
            direction: Direction::Received,
            lead_index: index as u32,
        })
        .await?;
        lead_watch.disconnect();

        let human_delay = draw_delay(
            self.timing.human_delay_min,
            self.timing.human_delay_max,
        );
        debug!(
            "human reply delay: lead={}, delay={:?}",
            lead.email, human_delay
        );
        if !self.interruptible_sleep(human_delay).await {
            return Ok(Cycle::Interrupted);
        }

        // Reply from the lead back to the domain, threaded on the incoming
        // message.
        let reply = self
            .deps
            .generator
            .reply(
                &lead.name,
                &self.domain.name,
                &incoming.subject,
                &incoming.body,
            )
            .await
            .context("text generator failed for reply")?;

        let reply_receipt = self
            .deps
            .mailer
            .send(SendRequest {
                from: lead.smtp_access(),
                to: self.domain.email.clone(),
                subject: reply.subject.clone(),
                body: reply.body.clone(),
                in_reply_to: incoming.message_id.clone(),
            })
            .await
            .context("smtp reply send failed")?;

        self.append_log(NewMailLog {
            session_id: Some(self.session.id),
            from_email: lead.email.clone(),
            to_email: self.domain.email.clone(),
            subject: reply.subject,
            body: reply.body,
            message_id: Some(reply_receipt.message_id),
            in_reply_to: incoming.message_id.clone(),
            direction: Direction::Replied,
            lead_index: index as u32,
        })
        .await?;

        if self.cancel.is_cancelled() {
            return Ok(Cycle::Interrupted);
        }

        // Wait on the domain's inbox for the reply to land.
        let mut domain_watch = self.deps.listener.subscribe(
            &self.domain.imap_access(),
            Some(&lead.email),
            &self.timing.watch_options(),
        );

        let reply_incoming = match self
            .await_matching(&mut domain_watch, &lead.email)
            .await
        {
            Wait::Message(email) => email,
            Wait::Interrupted => {
                domain_watch.disconnect();
                return Ok(Cycle::Interrupted);
            }
            Wait::TimedOut => {
                domain_watch.disconnect();
                warn!(
                    "reply never arrived on domain inbox: lead={}, index={}",
                    lead.email, index
                );
                return self.skip_lead(index).await;
            }
        };

        self.append_log(NewMailLog {
            session_id: Some(self.session.id),
            from_email: reply_incoming.from.clone(),
            to_email: self.domain.email.clone(),
            subject: reply_incoming.subject.clone(),
            body: reply_incoming.body.clone(),
            message_id: reply_incoming.message_id.clone(),
            in_reply_to: reply_incoming.in_reply_to.clone(),
            direction: Direction::Received,
            lead_index: index as u32,
        })
        .await?;
        domain_watch.disconnect();

        self.persist(
            SessionUpdate::status(SessionStatus::Sending)
                .index(index as u32 + 1),
        )
        .await?;

        info!(
            "lead cycle finished: domain={}, lead={}, next_index={}",
            self.domain.email, lead.email, self.session.current_lead_index
        );
        Ok(Cycle::Advanced)
    }

    /// Drains subscription events until a message from `expected_from`
    /// arrives. Messages from anyone else are ignored; duplicates are
    /// harmless because the caller disconnects after the first accept.
    async fn await_matching(
        &self,
        watch: &mut InboxSubscription,
        expected_from: &str,
    ) -> Wait {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Wait::Interrupted,
                event = watch.next_event() => event,
            };

            match event {
                Some(InboxEvent::Message(email)) => {
                    if same_address(&email.from, expected_from) {
                        return Wait::Message(email);
                    }
                    debug!(
                        "ignoring message from unexpected sender: from={}, expected={}",
                        email.from, expected_from
                    );
                }
                Some(InboxEvent::Timeout) | None => return Wait::TimedOut,
            }
        }
    }

    /// Skips the lead after a wait-budget timeout; skips are not retried.
    async fn skip_lead(&mut self, index: usize) -> Result<Cycle> {
        warn!(
            "skipping lead after wait budget: domain={}, index={}",
            self.domain.email, index
        );
        self.persist(
            SessionUpdate::status(SessionStatus::Sending)
                .index(index as u32 + 1),
        )
        .await?;
        Ok(Cycle::Skipped)
    }

    async fn append_log(&self, entry: NewMailLog) -> Result<()> {
        self.deps
            .store
            .append_mail_log(entry)
            .await
            .context("mail log append failed")?;
        Ok(())
    }

    async fn persist(&mut self, update: SessionUpdate) -> Result<()> {
        let row = self
            .deps
            .store
            .update_session(self.session.id, update)
            .await
            .context("session update failed")?;
        self.state
            .current_lead_index
            .store(row.current_lead_index as usize, Ordering::Relaxed);
        self.session = row;
        Ok(())
    }

    /// Returns false when the sleep was interrupted by pause/stop.
    async fn interruptible_sleep(&self, delay: Duration) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    async fn finish(&mut self, outcome: Outcome) {
        let result = match outcome {
            Outcome::Completed => self.finish_completed().await,
            Outcome::Interrupted => match self.state.stop_reason() {
                Some(StopReason::Stop) => self.finish_stopped().await,
                // Pause and bare cancellation both leave a resumable row.
                _ => self.finish_paused().await,
            },
            Outcome::Failed(err) => {
                error!(
                    "warmup session failed: domain={}, session={}, error={err:#}",
                    self.domain.email, self.session.id
                );
                self.finish_failed(format!("{err:#}")).await
            }
        };

        if let Err(err) = result {
            warn!(
                "failed to persist session outcome: session={}, error={err:#}",
                self.session.id
            );
        }
    }

    async fn finish_completed(&mut self) -> Result<()> {
        self.persist(
            SessionUpdate::status(SessionStatus::Completed)
                .index(self.leads.len() as u32)
                .completed_at(OffsetDateTime::now_utc()),
        )
        .await?;
        self.deps
            .store
            .set_domain_status(self.domain.id, DomainStatus::Idle)
            .await?;
        info!(
            "warmup session completed: domain={}, session={}, leads={}",
            self.domain.email,
            self.session.id,
            self.leads.len()
        );
        Ok(())
    }

    async fn finish_paused(&mut self) -> Result<()> {
        self.persist(SessionUpdate::status(SessionStatus::Paused)).await?;
        self.deps
            .store
            .set_domain_status(self.domain.id, DomainStatus::Paused)
            .await?;
        info!(
            "warmup session paused: domain={}, session={}, index={}",
            self.domain.email, self.session.id, self.session.current_lead_index
        );
        Ok(())
    }

    async fn finish_stopped(&mut self) -> Result<()> {
        self.persist(
            SessionUpdate::status(SessionStatus::Failed)
                .error(MANUAL_STOP_MESSAGE),
        )
        .await?;
        self.deps
            .store
            .set_domain_status(self.domain.id, DomainStatus::Idle)
            .await?;
        info!(
            "warmup session stopped: domain={}, session={}",
            self.domain.email, self.session.id
        );
        Ok(())
    }

    async fn finish_failed(&mut self, message: String) -> Result<()> {
        self.persist(
            SessionUpdate::status(SessionStatus::Failed).error(message),
        )
        .await?;
        self.deps
            .store
            .set_domain_status(self.domain.id, DomainStatus::Idle)
            .await?;
        Ok(())
    }
}

/// Uniform draw from the closed interval [min, max].
fn draw_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    let offset = rand::thread_rng().gen_range(0..=span);
    min + Duration::from_millis(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_draw_stays_in_closed_interval() {
        let min = Duration::from_millis(180);
        let max = Duration::from_millis(300);
        for _ in 0..200 {
            let delay = draw_delay(min, max);
            assert!(delay >= min && delay <= max);
        }
    }

    #[test]
    fn degenerate_delay_range_returns_min() {
        let value = Duration::from_millis(250);
        assert_eq!(draw_delay(value, value), value);
        assert_eq!(
            draw_delay(value, Duration::from_millis(100)),
            value
        );
    }

    #[test]
    fn stop_reason_first_writer_wins() {
        let state = RunState::new(0, 3);
        state.request_stop(StopReason::Pause);
        state.request_stop(StopReason::Stop);
        assert_eq!(state.stop_reason(), Some(StopReason::Pause));
        assert!(state.is_paused());
    }
}
