use std::fmt;

use anyhow::{Context, Result};
use async_imap::types::Uid;
use async_imap::{Client, Session};
use async_native_tls::TlsConnector;
use futures_util::TryStreamExt;
use mail_parser::{HeaderValue, MessageParser};
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::model::{IncomingEmail, MailboxAccess};

const EVENT_CHANNEL_CAPACITY: usize = 16;
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(5);
const MAX_SESSION_ATTEMPTS: u32 = 5;
const OPEN_RACE_RESCAN_DELAY: Duration = Duration::from_secs(2);
const IMAP_FETCH_QUERY_BODY_UID: &str = "(UID BODY.PEEK[])";

#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Budget granted to deliver a matching message before the single
    /// Timeout event fires.
    pub wait_timeout: Duration,
    /// Fallback UNSEEN scan cadence; also bounds each IDLE round.
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
pub enum InboxEvent {
    Message(IncomingEmail),
    Timeout,
}

/// Receiving half of one mailbox watch. At-least-once delivery: duplicates
/// are possible and late deliveries after `disconnect` land in a closed
/// channel.
pub struct InboxSubscription {
    events: mpsc::Receiver<InboxEvent>,
    cancel: CancellationToken,
}

impl InboxSubscription {
    pub(crate) fn new(
        events: mpsc::Receiver<InboxEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self { events, cancel }
    }

    pub async fn next_event(&mut self) -> Option<InboxEvent> {
        self.events.recv().await
    }

    /// Idempotent; stops the listener task and drops any undelivered
    /// events.
    pub fn disconnect(&mut self) {
        self.cancel.cancel();
        self.events.close();
    }
}

impl Drop for InboxSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub trait InboxListener: Send + Sync {
    /// Starts watching INBOX of `mailbox` for new messages, optionally
    /// restricted by a server-side FROM filter.
    fn subscribe(
        &self,
        mailbox: &MailboxAccess,
        from_filter: Option<&str>,
        options: &WatchOptions,
    ) -> InboxSubscription;
}

pub struct ImapListener;

impl InboxListener for ImapListener {
    fn subscribe(
        &self,
        mailbox: &MailboxAccess,
        from_filter: Option<&str>,
        options: &WatchOptions,
    ) -> InboxSubscription {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        tokio::spawn(run_inbox_watch(
            mailbox.clone(),
            from_filter.map(str::to_string),
            options.clone(),
            tx,
            cancel.clone(),
        ));

        InboxSubscription::new(rx, cancel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchEnd {
    Cancelled,
    Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Continue,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pause {
    Elapsed,
    Cancelled,
    Deadline,
}

/// Reconnect loop around one mailbox watch. Transport failures back off
/// linearly (5 s x attempt) up to 5 attempts; exhaustion and wait-budget
/// expiry both surface as a single Timeout event.
async fn run_inbox_watch(
    mailbox: MailboxAccess,
    from_filter: Option<String>,
    options: WatchOptions,
    tx: mpsc::Sender<InboxEvent>,
    cancel: CancellationToken,
) {
    let deadline = Instant::now() + options.wait_timeout;
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        attempt += 1;

        let end = watch_once(
            &mailbox,
            from_filter.as_deref(),
            &options,
            &tx,
            &cancel,
            deadline,
        )
        .await;

        match end {
            Ok(WatchEnd::Cancelled) => return,
            Ok(WatchEnd::Deadline) => {
                fire_timeout(&tx, &mailbox).await;
                return;
            }
            Err(err) => {
                warn!(
                    "inbox watch session failed: mailbox={}, attempt={}, error={err:#}",
                    mailbox.email, attempt
                );

                if attempt >= MAX_SESSION_ATTEMPTS {
                    warn!(
                        "inbox watch reconnect attempts exhausted: mailbox={}, attempts={}",
                        mailbox.email, attempt
                    );
                    fire_timeout(&tx, &mailbox).await;
                    return;
                }

                let backoff = RECONNECT_BASE_DELAY * attempt;
                match pause(&cancel, deadline, backoff).await {
                    Pause::Cancelled => return,
                    Pause::Deadline => {
                        fire_timeout(&tx, &mailbox).await;
                        return;
                    }
                    Pause::Elapsed => {}
                }
            }
        }
    }
}

async fn watch_once(
    mailbox: &MailboxAccess,
    from_filter: Option<&str>,
    options: &WatchOptions,
    tx: &mpsc::Sender<InboxEvent>,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<WatchEnd> {
    if mailbox.endpoint.secure {
        let session = open_tls_session(mailbox, options.connect_timeout).await?;
        watch_mailbox(session, from_filter, options, tx, cancel, deadline).await
    } else {
        let session =
            open_plain_session(mailbox, options.connect_timeout).await?;
        watch_mailbox(session, from_filter, options, tx, cancel, deadline).await
    }
}

/// One connected watch: initial UNSEEN scan, a ~2 s rescan that closes the
/// race between INBOX open and entering push mode, then IDLE rounds (or
/// plain polling when the server lacks IDLE) bounded by `poll_interval`.
async fn watch_mailbox<S>(
    mut session: Session<S>,
    from_filter: Option<&str>,
    options: &WatchOptions,
    tx: &mpsc::Sender<InboxEvent>,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<WatchEnd>
where
    S: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    session.select("INBOX").await.context("imap select INBOX failed")?;

    let query = build_search_query(from_filter);

    if deliver_unseen(&mut session, &query, tx).await? == Delivery::Closed {
        return Ok(WatchEnd::Cancelled);
    }

    match pause(cancel, deadline, OPEN_RACE_RESCAN_DELAY).await {
        Pause::Cancelled => return Ok(WatchEnd::Cancelled),
        Pause::Deadline => return Ok(WatchEnd::Deadline),
        Pause::Elapsed => {}
    }
    if deliver_unseen(&mut session, &query, tx).await? == Delivery::Closed {
        return Ok(WatchEnd::Cancelled);
    }

    let supports_idle = session
        .capabilities()
        .await
        .map(|caps| caps.has_str("IDLE"))
        .unwrap_or(false);
    debug!(
        "inbox watch armed: query={}, idle={}, poll_interval={:?}",
        query, supports_idle, options.poll_interval
    );

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(WatchEnd::Deadline);
        }
        let wait = options.poll_interval.min(deadline - now);

        if supports_idle {
            let mut idle = session.idle();
            idle.init().await.context("imap IDLE init failed")?;

            let (idle_wait, interrupt) = idle.wait_with_timeout(wait);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                result = idle_wait => Some(result),
            };

            let Some(result) = outcome else {
                drop(interrupt);
                return Ok(WatchEnd::Cancelled);
            };
            result.context("imap IDLE wait failed")?;
            session = idle.done().await.context("imap IDLE done failed")?;
        } else {
            match pause(cancel, deadline, wait).await {
                Pause::Cancelled => return Ok(WatchEnd::Cancelled),
                Pause::Deadline => return Ok(WatchEnd::Deadline),
                Pause::Elapsed => {}
            }
        }

        if deliver_unseen(&mut session, &query, tx).await? == Delivery::Closed
        {
            return Ok(WatchEnd::Cancelled);
        }
    }
}

/// Fetches the current UNSEEN matches in mailbox order, marks them seen and
/// forwards the ones that parse. A message that fails to parse is logged
/// and dropped; the rest of the batch is unaffected.
async fn deliver_unseen<S>(
    session: &mut Session<S>,
    query: &str,
    tx: &mpsc::Sender<InboxEvent>,
) -> Result<Delivery>
where
    S: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    let mut uids: Vec<Uid> = session
        .uid_search(query)
        .await
        .with_context(|| format!("imap UID SEARCH failed: query={query}"))?
        .into_iter()
        .collect();
    uids.sort_unstable();

    if uids.is_empty() {
        return Ok(Delivery::Continue);
    }

    let uid_set =
        uids.iter().map(Uid::to_string).collect::<Vec<_>>().join(",");
    let mut fetched: Vec<(Uid, Vec<u8>)> = Vec::with_capacity(uids.len());

    {
        let mut fetches = session
            .uid_fetch(&uid_set, IMAP_FETCH_QUERY_BODY_UID)
            .await
            .context("imap UID FETCH failed")?;

        while let Some(fetch) = fetches
            .try_next()
            .await
            .context("imap UID FETCH stream failed")?
        {
            let Some(uid) = fetch.uid else {
                warn!("imap fetch item missing UID field");
                continue;
            };
            let Some(body) = fetch.body() else {
                warn!("imap message has no body: uid={uid}");
                continue;
            };
            fetched.push((uid, body.to_vec()));
        }
    }

    let seen: Vec<Uid> = fetched.iter().map(|(uid, _)| *uid).collect();
    mark_seen_uids(session, &seen).await?;

    for (uid, raw) in fetched {
        match parse_incoming(&raw) {
            Some(email) => {
                debug!(
                    "inbox message delivered: uid={}, from={}, message_id={}",
                    uid,
                    email.from,
                    email.message_id.as_deref().unwrap_or("-")
                );
                if tx.send(InboxEvent::Message(email)).await.is_err() {
                    return Ok(Delivery::Closed);
                }
            }
            None => {
                warn!("inbox message parse failed, dropping: uid={uid}");
            }
        }
    }

    Ok(Delivery::Continue)
}

async fn mark_seen_uids<S>(
    session: &mut Session<S>,
    uids: &[Uid],
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    if uids.is_empty() {
        return Ok(());
    }

    let uid_set =
        uids.iter().map(Uid::to_string).collect::<Vec<_>>().join(",");

    let mut updates = session
        .uid_store(uid_set, "+FLAGS (\\Seen)")
        .await
        .context("imap UID STORE +FLAGS (\\\\Seen) failed")?;

    while updates
        .try_next()
        .await
        .context("imap UID STORE response stream failed")?
        .is_some()
    {}

    Ok(())
}

async fn fire_timeout(tx: &mpsc::Sender<InboxEvent>, mailbox: &MailboxAccess) {
    if tx.send(InboxEvent::Timeout).await.is_err() {
        debug!(
            "subscription already disconnected before timeout: mailbox={}",
            mailbox.email
        );
    }
}

async fn pause(
    cancel: &CancellationToken,
    deadline: Instant,
    wait: Duration,
) -> Pause {
    tokio::select! {
        _ = cancel.cancelled() => Pause::Cancelled,
        _ = sleep_until(deadline) => Pause::Deadline,
        _ = sleep(wait) => Pause::Elapsed,
    }
}

fn build_search_query(from_filter: Option<&str>) -> String {
    match from_filter {
        Some(address) => format!("UNSEEN FROM \"{}\"", address.trim()),
        None => "UNSEEN".to_string(),
    }
}

async fn open_tls_session(
    mailbox: &MailboxAccess,
    connect_timeout: Duration,
) -> Result<Session<async_native_tls::TlsStream<TcpStream>>> {
    let host = mailbox.endpoint.host.as_str();
    let port = mailbox.endpoint.port;

    let tcp = timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .with_context(|| {
            format!("imap tcp connect timeout: host={host}, port={port}")
        })?
        .with_context(|| {
            format!("imap tcp connect failed: host={host}, port={port}")
        })?;

    let tls = TlsConnector::new();
    let tls_stream = timeout(connect_timeout, tls.connect(host, tcp))
        .await
        .with_context(|| {
            format!("imap tls handshake timeout: host={host}, port={port}")
        })?
        .with_context(|| {
            format!("imap tls handshake failed: host={host}, port={port}")
        })?;

    let client = Client::new(tls_stream);
    login(client, mailbox, connect_timeout).await
}

async fn open_plain_session(
    mailbox: &MailboxAccess,
    connect_timeout: Duration,
) -> Result<Session<TcpStream>> {
    let host = mailbox.endpoint.host.as_str();
    let port = mailbox.endpoint.port;

    let tcp = timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .with_context(|| {
            format!("imap tcp connect timeout: host={host}, port={port}")
        })?
        .with_context(|| {
            format!("imap tcp connect failed: host={host}, port={port}")
        })?;

    let client = Client::new(tcp);
    login(client, mailbox, connect_timeout).await
}

async fn login<S>(
    mut client: Client<S>,
    mailbox: &MailboxAccess,
    connect_timeout: Duration,
) -> Result<Session<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    let greeting = timeout(connect_timeout, client.read_response())
        .await
        .context("imap greeting timeout")?
        .context("failed to read imap greeting")?
        .context("unexpected end of stream while waiting imap greeting")?;
    tracing::trace!("imap greeting: {greeting:?}");

    timeout(
        connect_timeout,
        client.login(&mailbox.email, &mailbox.endpoint.password),
    )
    .await
    .with_context(|| format!("imap login timeout: user={}", mailbox.email))?
    .map_err(|(err, _client)| err)
    .with_context(|| format!("imap login failed: user={}", mailbox.email))
}

/// Angle-bracket canonical form so incoming identifiers compare equal to
/// generated ones regardless of how the parser returned them.
fn canonical_message_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        trimmed.to_string()
    } else {
        format!("<{trimmed}>")
    }
}

fn parse_incoming(raw: &[u8]) -> Option<IncomingEmail> {
    let message = MessageParser::default().parse(raw)?;

    let from = message
        .from()
        .and_then(|list| list.first())
        .and_then(|addr| addr.address())?
        .to_string();

    let to = message
        .to()
        .and_then(|list| list.first())
        .and_then(|addr| addr.address())
        .map(str::to_string);

    let in_reply_to = match message.in_reply_to() {
        HeaderValue::Text(text) => Some(canonical_message_id(text)),
        HeaderValue::TextList(list) => {
            list.first().map(|text| canonical_message_id(text))
        }
        _ => None,
    };

    Some(IncomingEmail {
        message_id: message
            .message_id()
            .map(canonical_message_id),
        from,
        to,
        subject: message.subject().unwrap_or_default().to_string(),
        body: message
            .body_text(0)
            .map(|body| body.to_string())
            .unwrap_or_default(),
        in_reply_to,
        date: message
            .date()
            .and_then(|date| {
                OffsetDateTime::from_unix_timestamp(date.to_timestamp()).ok()
            }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_query_carries_from_filter() {
        assert_eq!(build_search_query(None), "UNSEEN");
        assert_eq!(
            build_search_query(Some(" warm@corp.example ")),
            "UNSEEN FROM \"warm@corp.example\""
        );
    }

    #[test]
    fn message_ids_get_canonical_brackets() {
        assert_eq!(canonical_message_id("abc@corp.example"), "<abc@corp.example>");
        assert_eq!(canonical_message_id("<abc@corp.example>"), "<abc@corp.example>");
        assert_eq!(canonical_message_id("  <abc@corp.example>  "), "<abc@corp.example>");
    }

    #[test]
    fn parses_threaded_plain_text_message() {
        let raw = concat!(
            "Message-ID: <reply-1@pool.example>\r\n",
            "In-Reply-To: <orig-1@corp.example>\r\n",
            "From: \"Lead One\" <lead1@pool.example>\r\n",
            "To: warm@corp.example\r\n",
            "Subject: Re: Quick hello\r\n",
            "Date: Mon, 13 Jul 2026 09:30:00 +0000\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "Sounds good, thanks!\r\n",
        );

        let email = parse_incoming(raw.as_bytes()).unwrap();
        assert_eq!(email.message_id.as_deref(), Some("<reply-1@pool.example>"));
        assert_eq!(email.in_reply_to.as_deref(), Some("<orig-1@corp.example>"));
        assert_eq!(email.from, "lead1@pool.example");
        assert_eq!(email.to.as_deref(), Some("warm@corp.example"));
        assert_eq!(email.subject, "Re: Quick hello");
        assert_eq!(email.body.trim(), "Sounds good, thanks!");
        assert!(email.date.is_some());
    }

    #[test]
    fn parse_failure_drops_message() {
        // From header missing: no usable sender address.
        let raw = b"Subject: orphan\r\n\r\nbody";
        assert!(parse_incoming(raw).is_none());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_closes_the_stream() {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let mut subscription = InboxSubscription::new(rx, cancel.clone());

        subscription.disconnect();
        subscription.disconnect();

        assert!(cancel.is_cancelled());
        assert!(tx.send(InboxEvent::Timeout).await.is_err());
        assert!(subscription.next_event().await.is_none());
    }
}
