use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, instrument, warn};

use tokio_xmpp::component::Component;
use tokio_xmpp::connect::{DnsConfig, TcpServerConnector};
use tokio_xmpp::xmlstream::Timeouts;
use tokio_xmpp::Stanza;
use xmpp_parsers::iq::Iq;
use xmpp_parsers::jid::Jid;

use crate::error::{Result, SessionError};
use crate::handler::Handler;

/// Reconnect backoff floor and ceiling (§4.1: "exponential back-off capped
/// at 900 s").
const INITIAL_BACKOFF_SECS: u64 = 5;
const MAX_BACKOFF_SECS: u64 = 900;

/// Default `SendIQ` timeout (§5: "IQs have an explicit timeout, default
/// 300 s").
pub const DEFAULT_IQ_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection parameters for a component-mode [`Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub jid: String,
    pub secret: String,
    pub rhost: String,
    pub rport: u16,
    pub verbose: bool,
}

enum Command {
    Send(Stanza),
    SendIq {
        stanza: Stanza,
        timeout: Duration,
        respond_to: oneshot::Sender<Result<Stanza>>,
    },
    AddHandler {
        handler: Arc<dyn Handler>,
        respond_to: oneshot::Sender<u64>,
    },
    RemoveHandler(u64),
    Stop,
}

/// A cheaply-cloneable handle to a running [`Session`].
///
/// This is what handlers and callers actually hold: the session itself
/// runs as a background task and is only reachable through this channel,
/// so there is no back-reference cycle between a handler and its owning
/// session (see the design notes on recursive/back-reference pointers).
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Enqueue a stanza. Delivered immediately if the stream is up and
    /// initialized, otherwise appended to the packet queue.
    pub fn send(&self, stanza: impl Into<Stanza>) {
        let _ = self.tx.send(Command::Send(stanza.into()));
    }

    /// Send an IQ and await its `result`/`error` response, or a timeout.
    pub async fn send_iq(&self, iq: Iq, timeout: Duration) -> Result<Stanza> {
        let (respond_to, response) = oneshot::channel();
        self.tx
            .send(Command::SendIq {
                stanza: Stanza::Iq(iq),
                timeout,
                respond_to,
            })
            .map_err(|_| SessionError::ConnectionLost)?;
        response.await.map_err(|_| SessionError::ConnectionLost)?
    }

    /// Register a handler. Returns an id usable with [`Self::remove_handler`].
    pub async fn add_handler(&self, handler: Arc<dyn Handler>) -> u64 {
        let (respond_to, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::AddHandler { handler, respond_to })
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub fn remove_handler(&self, id: u64) {
        let _ = self.tx.send(Command::RemoveHandler(id));
    }

    /// Tear down the session: stop reconnecting, fail every pending IQ
    /// with `ConnectionLost`.
    pub fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }
}

/// Build a [`SessionHandle`] backed by a plain relay task instead of a
/// live connection, for handler unit tests that only need to observe
/// what gets sent. Gated behind `test-util` so it compiles for downstream
/// crates' own tests without shipping in ordinary release builds.
#[cfg(any(test, feature = "test-util"))]
pub fn test_handle() -> (SessionHandle, mpsc::UnboundedReceiver<Stanza>) {
    let (tx, mut cmd_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            if let Command::Send(stanza) = cmd {
                let _ = out_tx.send(stanza);
            }
        }
    });
    (SessionHandle { tx }, out_rx)
}

struct PendingIq {
    respond_to: oneshot::Sender<Result<Stanza>>,
    timeout_key: tokio_util::time::delay_queue::Key,
}

/// The reconnecting XMPP component session.
///
/// Owns the packet queue, the pending-IQ table, and the handler list. Runs
/// entirely inside [`spawn`]'s background task; callers interact with it
/// through [`SessionHandle`].
pub struct Session;

impl Session {
    /// Spawn the session's background task and return a handle to it plus
    /// the task's `JoinHandle` (for the binary to hold onto, e.g. to
    /// detect an unexpected exit).
    pub fn spawn(config: SessionConfig) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle { tx: tx.clone() };
        let join = tokio::spawn(run(config, tx, rx));
        (handle, join)
    }
}

async fn run(
    config: SessionConfig,
    tx: mpsc::UnboundedSender<Command>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut queue: VecDeque<Stanza> = VecDeque::new();
    let mut pending: HashMap<String, PendingIq> = HashMap::new();
    let mut timeouts: DelayQueue<String> = DelayQueue::new();
    let mut handlers: Vec<(u64, Arc<dyn Handler>)> = Vec::new();
    let next_handler_id = AtomicU64::new(1);
    let mut backoff = Duration::from_secs(INITIAL_BACKOFF_SECS);

    'reconnect: loop {
        let component = match connect(&config).await {
            Ok(component) => component,
            Err(error) => {
                warn!(%error, backoff_secs = backoff.as_secs(), "failed to connect, retrying");
                if !wait_while_disconnected(
                    backoff,
                    &mut cmd_rx,
                    &mut queue,
                    &mut pending,
                    &mut timeouts,
                    &mut handlers,
                    &next_handler_id,
                )
                .await
                {
                    return;
                }
                backoff = (backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
                continue 'reconnect;
            }
        };
        backoff = Duration::from_secs(INITIAL_BACKOFF_SECS);
        let host = component.jid.clone();
        let (mut sink, mut stream) = component.split();

        for (_, h) in &handlers {
            let handle = SessionHandle {
                tx: tx.clone(),
            };
            h.connection_made(&handle);
        }

        // Drain the packet queue in FIFO order before anything else sees
        // connectionInitialized.
        for stanza in queue.drain(..) {
            if let Err(error) = sink.send(stamp_from(stanza, &host)).await {
                warn!(%error, "failed to flush queued stanza on reconnect");
                break;
            }
        }

        let handle_for_init = SessionHandle {
            tx: tx.clone(),
        };
        for (_, h) in &handlers {
            h.connection_initialized(&handle_for_init);
        }
        info!(jid = %host, "session initialized");

        loop {
            tokio::select! {
                biased;

                Some(expired) = futures::future::poll_fn(|cx| std::pin::Pin::new(&mut timeouts).poll_expired(cx)) => {
                    let id = expired.into_inner();
                    if let Some(p) = pending.remove(&id) {
                        let _ = p.respond_to.send(Err(SessionError::Timeout));
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(Command::Stop) => {
                            fail_all_pending(&mut pending, &mut timeouts);
                            let _ = SinkExt::close(&mut sink).await;
                            return;
                        }
                        Some(Command::Send(stanza)) => {
                            if let Err(error) = sink.send(stamp_from(stanza, &host)).await {
                                warn!(%error, "send failed, will reconnect");
                                break;
                            }
                        }
                        Some(Command::SendIq { mut stanza, timeout, respond_to }) => {
                            if let Stanza::Iq(iq) = &mut stanza {
                                if iq.id.is_empty() {
                                    iq.id = uuid::Uuid::new_v4().to_string();
                                }
                                let id = iq.id.clone();
                                let timeout_key = timeouts.insert(id.clone(), timeout);
                                pending.insert(id, PendingIq { respond_to, timeout_key });
                            } else {
                                let _ = respond_to.send(Err(SessionError::Connect(
                                    "SendIq called with a non-IQ stanza".to_string(),
                                )));
                                continue;
                            }
                            if let Err(error) = sink.send(stamp_from(stanza, &host)).await {
                                warn!(%error, "send_iq failed, will reconnect");
                                break;
                            }
                        }
                        Some(Command::AddHandler { handler, respond_to }) => {
                            let id = next_handler_id.fetch_add(1, Ordering::Relaxed);
                            let handle = SessionHandle { tx: tx.clone() };
                            handler.connection_initialized(&handle);
                            handlers.push((id, handler));
                            let _ = respond_to.send(id);
                        }
                        Some(Command::RemoveHandler(id)) => {
                            handlers.retain(|(hid, _)| *hid != id);
                        }
                    }
                }

                next = stream.next() => {
                    match next {
                        Some(Ok(stanza)) => {
                            if let Some(stanza) = dispatch(stanza, &mut pending, &mut timeouts) {
                                let handle = SessionHandle { tx: tx.clone() };
                                for (_, h) in &handlers {
                                    if h.handle_stanza(&handle, &stanza) {
                                        break;
                                    }
                                }
                            }
                        }
                        Some(Err(error)) => {
                            warn!(%error, "stream error, reconnecting");
                            break;
                        }
                        None => {
                            debug!("stream ended, reconnecting");
                            break;
                        }
                    }
                }
            }
        }

        fail_all_pending(&mut pending, &mut timeouts);
        for (_, h) in &handlers {
            h.connection_lost();
        }

        if !wait_while_disconnected(
            backoff,
            &mut cmd_rx,
            &mut queue,
            &mut pending,
            &mut timeouts,
            &mut handlers,
            &next_handler_id,
        )
        .await
        {
            return;
        }
        backoff = (backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
    }
}

/// `dispatch` resolves a pending IQ if `stanza` is a matching result/error,
/// consuming it in that case. Otherwise it hands the stanza back for
/// handler fan-out (an IQ result that nobody was waiting for — e.g. after a
/// timeout already fired — is simply dropped silently per §5's cancellation
/// rule).
fn dispatch(
    stanza: Stanza,
    pending: &mut HashMap<String, PendingIq>,
    timeouts: &mut DelayQueue<String>,
) -> Option<Stanza> {
    if let Stanza::Iq(iq) = &stanza {
        use xmpp_parsers::iq::IqType;
        if matches!(iq.payload, IqType::Result(_) | IqType::Error(_)) {
            if let Some(p) = pending.remove(&iq.id) {
                timeouts.remove(&p.timeout_key);
                let _ = p.respond_to.send(Ok(stanza));
                return None;
            }
        }
    }
    Some(stanza)
}

fn fail_all_pending(pending: &mut HashMap<String, PendingIq>, timeouts: &mut DelayQueue<String>) {
    for (_, p) in pending.drain() {
        timeouts.remove(&p.timeout_key);
        let _ = p.respond_to.send(Err(SessionError::ConnectionLost));
    }
}

/// Stamp a missing `from` with the component's bound host (§4.1: "every
/// outbound element missing a from attribute has it stamped").
fn stamp_from(mut stanza: Stanza, host: &Jid) -> Stanza {
    match &mut stanza {
        Stanza::Iq(iq) => iq.from.get_or_insert_with(|| host.clone()),
        Stanza::Message(message) => message.from.get_or_insert_with(|| host.clone()),
        Stanza::Presence(presence) => presence.from.get_or_insert_with(|| host.clone()),
    };
    stanza
}

#[instrument(skip(config), fields(jid = %config.jid, rhost = %config.rhost, rport = config.rport))]
async fn connect(config: &SessionConfig) -> std::result::Result<Component<TcpServerConnector>, SessionError> {
    if config.verbose {
        debug!("connecting to upstream server");
    }
    let dns = DnsConfig::addr(&format!("{}:{}", config.rhost, config.rport));
    Component::new_plaintext(&config.jid, &config.secret, dns, Timeouts::tight())
        .await
        .map_err(|e| SessionError::Connect(e.to_string()))
}

/// Wait out a reconnect backoff while the session has no live stream.
///
/// Unlike a plain sleep, commands arriving during the wait are not lost:
/// `Send`/`SendIq` stanzas join the packet queue (with IQs registered in
/// the pending table and timeout clock started immediately, same as if
/// they'd been sent over a live stream — §5's IQ timeout is wall-clock from
/// the call, not from the next successful connect) and `AddHandler`/
/// `RemoveHandler` update the handler list directly, without the
/// `connection_initialized` callback since there is no connection yet.
///
/// Returns `false` if a `Stop` command (or channel closure) ends the wait.
async fn wait_while_disconnected(
    backoff: Duration,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    queue: &mut VecDeque<Stanza>,
    pending: &mut HashMap<String, PendingIq>,
    timeouts: &mut DelayQueue<String>,
    handlers: &mut Vec<(u64, Arc<dyn Handler>)>,
    next_handler_id: &AtomicU64,
) -> bool {
    let deadline = tokio::time::Instant::now() + backoff;
    loop {
        tokio::select! {
            biased;

            _ = tokio::time::sleep_until(deadline) => return true,

            Some(expired) = futures::future::poll_fn(|cx| std::pin::Pin::new(&mut *timeouts).poll_expired(cx)) => {
                let id = expired.into_inner();
                if let Some(p) = pending.remove(&id) {
                    let _ = p.respond_to.send(Err(SessionError::Timeout));
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(Command::Stop) => {
                        fail_all_pending(pending, timeouts);
                        return false;
                    }
                    Some(Command::Send(stanza)) => queue.push_back(stanza),
                    Some(Command::SendIq { mut stanza, timeout, respond_to }) => {
                        if let Stanza::Iq(iq) = &mut stanza {
                            if iq.id.is_empty() {
                                iq.id = uuid::Uuid::new_v4().to_string();
                            }
                            let id = iq.id.clone();
                            let timeout_key = timeouts.insert(id.clone(), timeout);
                            pending.insert(id, PendingIq { respond_to, timeout_key });
                            queue.push_back(stanza);
                        } else {
                            let _ = respond_to.send(Err(SessionError::Connect(
                                "SendIq called with a non-IQ stanza".to_string(),
                            )));
                        }
                    }
                    Some(Command::AddHandler { handler, respond_to }) => {
                        let id = next_handler_id.fetch_add(1, Ordering::Relaxed);
                        handlers.push((id, handler));
                        let _ = respond_to.send(id);
                    }
                    Some(Command::RemoveHandler(id)) => {
                        handlers.retain(|(hid, _)| *hid != id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmpp_parsers::iq::IqType;

    fn test_iq(id: &str, payload: IqType) -> Stanza {
        Stanza::Iq(Iq {
            from: None,
            to: None,
            id: id.to_string(),
            payload,
        })
    }

    #[tokio::test]
    async fn dispatch_resolves_a_matching_pending_iq() {
        let mut pending = HashMap::new();
        let mut timeouts = DelayQueue::new();
        let (respond_to, response) = oneshot::channel();
        let timeout_key = timeouts.insert("req1".to_string(), Duration::from_secs(300));
        pending.insert(
            "req1".to_string(),
            PendingIq {
                respond_to,
                timeout_key,
            },
        );

        let result_stanza = test_iq("req1", IqType::Result(None));
        let unclaimed = dispatch(result_stanza, &mut pending, &mut timeouts);

        assert!(unclaimed.is_none(), "a resolving IQ is consumed, not forwarded to handlers");
        assert!(pending.is_empty());
        let resolved = response.await.unwrap();
        assert!(resolved.is_ok());
    }

    #[tokio::test]
    async fn dispatch_passes_through_stanzas_nobody_is_waiting_for() {
        let mut pending = HashMap::new();
        let mut timeouts = DelayQueue::new();

        let get_stanza = test_iq(
            "req2",
            IqType::Get(minidom::Element::builder("ping", "urn:xmpp:ping").build()),
        );
        let forwarded = dispatch(get_stanza, &mut pending, &mut timeouts);
        assert!(forwarded.is_some());

        let unmatched_result = test_iq("not-pending", IqType::Result(None));
        let forwarded = dispatch(unmatched_result, &mut pending, &mut timeouts);
        assert!(forwarded.is_some(), "a result with no matching pending entry is dropped silently, not claimed");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_while_disconnected_buffers_outbound_stanzas() {
        let (tx, mut cmd_rx) = mpsc::unbounded_channel();
        let mut queue = VecDeque::new();
        let mut pending = HashMap::new();
        let mut timeouts = DelayQueue::new();
        let mut handlers: Vec<(u64, Arc<dyn Handler>)> = Vec::new();
        let next_handler_id = AtomicU64::new(1);

        tx.send(Command::Send(test_iq(
            "queued-1",
            IqType::Get(minidom::Element::builder("ping", "urn:xmpp:ping").build()),
        )))
        .unwrap();
        // Dropping the sender makes cmd_rx.recv() return None right after
        // the queued command is drained, ending the wait deterministically.
        drop(tx);

        let still_running = wait_while_disconnected(
            Duration::from_secs(5),
            &mut cmd_rx,
            &mut queue,
            &mut pending,
            &mut timeouts,
            &mut handlers,
            &next_handler_id,
        )
        .await;

        assert!(!still_running, "channel closure ends the wait the same as an explicit Stop");
        assert_eq!(queue.len(), 1, "the stanza sent while disconnected is buffered, not dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_while_disconnected_times_out_a_queued_iq() {
        // Keep `tx` alive for the whole test: closing it would make
        // `cmd_rx.recv()` immediately ready with `None`, which ends the
        // wait before the paused clock ever gets a chance to advance to
        // the IQ's 1s timeout.
        let (tx, mut cmd_rx) = mpsc::unbounded_channel();
        let mut queue = VecDeque::new();
        let mut pending = HashMap::new();
        let mut timeouts = DelayQueue::new();
        let mut handlers: Vec<(u64, Arc<dyn Handler>)> = Vec::new();
        let next_handler_id = AtomicU64::new(1);

        let (respond_to, response) = oneshot::channel();
        tx.send(Command::SendIq {
            stanza: test_iq(
                "req-timeout",
                IqType::Get(minidom::Element::builder("ping", "urn:xmpp:ping").build()),
            ),
            timeout: Duration::from_secs(1),
            respond_to,
        })
        .unwrap();

        // With time paused, the runtime auto-advances through the 1s IQ
        // timeout and then the 5s backoff deadline since nothing else is
        // runnable in between.
        wait_while_disconnected(
            Duration::from_secs(5),
            &mut cmd_rx,
            &mut queue,
            &mut pending,
            &mut timeouts,
            &mut handlers,
            &next_handler_id,
        )
        .await;

        let result = response.await.unwrap();
        assert!(matches!(result, Err(SessionError::Timeout)));
        assert!(pending.is_empty());
    }

    #[test]
    fn stamp_from_only_fills_a_missing_from() {
        let host: Jid = "component.example.com".parse().unwrap();
        let existing: Jid = "other.example.com".parse().unwrap();

        let stamped = stamp_from(
            test_iq("id1", IqType::Get(minidom::Element::builder("ping", "urn:xmpp:ping").build())),
            &host,
        );
        match stamped {
            Stanza::Iq(iq) => assert_eq!(iq.from, Some(host.clone())),
            _ => unreachable!(),
        }

        let mut with_from = test_iq("id2", IqType::Get(minidom::Element::builder("ping", "urn:xmpp:ping").build()));
        if let Stanza::Iq(iq) = &mut with_from {
            iq.from = Some(existing.clone());
        }
        let stamped = stamp_from(with_from, &host);
        match stamped {
            Stanza::Iq(iq) => assert_eq!(iq.from, Some(existing)),
            _ => unreachable!(),
        }
    }
}
