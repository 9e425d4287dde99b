use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::channel::message::{Inbound, MessageKind, Outbound};
use crate::channel::wire::ClientCodec;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("channel closed")]
    Closed,
}

/// Lifecycle of the single logical backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    /// Reconnect attempts exhausted (or the initial dial failed).
    /// Only an explicit `connect()` leaves this state.
    Error,
}

/// Token returned by `on_message`, used to deregister the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type MessageHandler = Arc<dyn Fn(&Inbound) -> anyhow::Result<()> + Send + Sync>;

enum Closure {
    Graceful,
    Abnormal,
}

struct Shared {
    state: watch::Sender<ChannelState>,
    handlers: Mutex<HashMap<MessageKind, Vec<(HandlerId, MessageHandler)>>>,
    next_handler: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    closing: AtomicBool,
    // Bumped on every connect()/close(); a run loop whose epoch is
    // stale must exit without touching shared state.
    epoch: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        // send_replace: the write must land even with no subscribers.
        let _ = self.state.send_replace(state);
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    /// State write from a run loop; ignored once that loop is stale,
    /// so an old loop cannot stomp the state of a newer `connect()`.
    fn set_state_for(&self, epoch: u64, state: ChannelState) {
        if !self.is_stale(epoch) {
            let _ = self.state.send_replace(state);
        }
    }

    fn dispatch(&self, msg: &Inbound) {
        let kind = msg.kind();
        let handlers: Vec<(HandlerId, MessageHandler)> = {
            let table = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            table.get(&kind).cloned().unwrap_or_default()
        };
        for (id, handler) in handlers {
            // One failing handler must not stop the rest.
            if let Err(e) = handler(msg) {
                warn!(kind = ?kind, handler = id.0, error = %e, "message handler failed");
            }
        }
    }
}

/// Owns the one duplex connection to the orchestration backend.
///
/// Reconnects automatically on abnormal closure with a linear backoff
/// of `base_delay * attempt_number`, giving up after `max_attempts`
/// consecutive failures. The attempt counter resets whenever the
/// channel reaches `Open`. A caller-initiated `close()` never triggers
/// reconnection.
pub struct ChannelSupervisor {
    shared: Arc<Shared>,
    endpoint: String,
    base_delay: Duration,
    max_attempts: u32,
}

impl ChannelSupervisor {
    pub fn new(endpoint: impl Into<String>, base_delay: Duration, max_attempts: u32) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                state,
                handlers: Mutex::new(HashMap::new()),
                next_handler: AtomicU64::new(1),
                outbound: Mutex::new(None),
                closing: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
            }),
            endpoint: endpoint.into(),
            base_delay,
            max_attempts,
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn reconnect_delay(base_delay: Duration, attempt: u32) -> Duration {
        base_delay * attempt
    }

    /// Open the channel. No-op if already open or connecting; always
    /// valid from `Error`, and resets the attempt counter.
    pub fn connect(&self) {
        if matches!(self.state(), ChannelState::Open | ChannelState::Connecting) {
            return;
        }
        self.shared.closing.store(false, Ordering::SeqCst);
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.set_state(ChannelState::Connecting);

        let shared = Arc::clone(&self.shared);
        let endpoint = self.endpoint.clone();
        let base_delay = self.base_delay;
        let max_attempts = self.max_attempts;
        tokio::spawn(async move {
            run_loop(shared, endpoint, base_delay, max_attempts, epoch).await;
        });
    }

    /// Gracefully close the channel. Terminal until `connect()` is
    /// called again; never schedules a reconnect.
    pub fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        // Dropping the sender ends the io loop's outbound queue.
        *self.shared.outbound.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.shared.set_state(ChannelState::Disconnected);
    }

    /// Enqueue a message for transmission. `Ok` means the send was
    /// accepted, not that the backend processed it.
    pub fn send(&self, msg: Outbound) -> Result<(), ChannelError> {
        if self.state() != ChannelState::Open {
            return Err(ChannelError::NotConnected);
        }
        let guard = self.shared.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| ChannelError::NotConnected),
            None => Err(ChannelError::NotConnected),
        }
    }

    /// Register a handler for one inbound message kind. Handlers for
    /// the same kind run in registration order; a handler error is
    /// logged and does not affect the others.
    pub fn on_message<F>(&self, kind: MessageKind, handler: F) -> HandlerId
    where
        F: Fn(&Inbound) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.shared.next_handler.fetch_add(1, Ordering::SeqCst));
        let mut table = self.shared.handlers.lock().unwrap_or_else(|e| e.into_inner());
        table.entry(kind).or_default().push((id, Arc::new(handler)));
        id
    }

    /// Deregister a handler. Unknown ids are ignored.
    pub fn off_message(&self, kind: MessageKind, id: HandlerId) {
        let mut table = self.shared.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = table.get_mut(&kind) {
            list.retain(|(hid, _)| *hid != id);
        }
    }

    /// Wait until the channel is `Open`, or fail once it settles in
    /// `Error` or the timeout elapses.
    pub async fn wait_open(&self, timeout: Duration) -> Result<(), ChannelError> {
        let mut rx = self.shared.state.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            match *rx.borrow_and_update() {
                ChannelState::Open => return Ok(()),
                ChannelState::Error => return Err(ChannelError::Closed),
                _ => {}
            }
            tokio::select! {
                _ = &mut deadline => return Err(ChannelError::NotConnected),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ChannelError::Closed);
                    }
                }
            }
        }
    }

    /// Watch channel-state transitions (presentation-layer surface).
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    endpoint: String,
    base_delay: Duration,
    max_attempts: u32,
    epoch: u64,
) {
    // attempt 0 is the initial dial; 1..=max_attempts are reconnects.
    let mut attempt: u32 = 0;
    loop {
        if shared.is_stale(epoch) {
            return;
        }
        if shared.closing.load(Ordering::SeqCst) {
            shared.set_state_for(epoch, ChannelState::Disconnected);
            return;
        }
        shared.set_state_for(epoch, ChannelState::Connecting);

        match TcpStream::connect(&endpoint).await {
            Ok(stream) => {
                info!(endpoint = %endpoint, "channel open");
                attempt = 0;
                match serve_connection(&shared, stream, epoch).await {
                    Closure::Graceful => {
                        shared.set_state_for(epoch, ChannelState::Disconnected);
                        return;
                    }
                    Closure::Abnormal => {
                        warn!(endpoint = %endpoint, "channel closed unexpectedly");
                    }
                }
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "channel dial failed");
                if attempt == 0 {
                    // Initial connect failure: no retry ladder.
                    shared.set_state_for(epoch, ChannelState::Error);
                    return;
                }
            }
        }

        attempt += 1;
        if attempt > max_attempts {
            warn!(endpoint = %endpoint, max_attempts, "reconnect attempts exhausted");
            shared.set_state_for(epoch, ChannelState::Error);
            return;
        }
        let delay = ChannelSupervisor::reconnect_delay(base_delay, attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        tokio::time::sleep(delay).await;
    }
}

async fn serve_connection(shared: &Arc<Shared>, stream: TcpStream, epoch: u64) -> Closure {
    let mut framed = Framed::new(stream, ClientCodec::new());
    shared.set_state_for(epoch, ChannelState::Open);

    // Re-establish the status subscription on every open. Any
    // responses to requests in flight before a reconnect are
    // indeterminate; the new subscription is the clean slate.
    if let Err(e) = framed.send(Outbound::SubscribeStatus).await {
        warn!(error = %e, "failed to re-subscribe after open");
        return Closure::Abnormal;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let mut guard = shared.outbound.lock().unwrap_or_else(|e| e.into_inner());
        if shared.is_stale(epoch) {
            return Closure::Graceful;
        }
        *guard = Some(tx);
    }

    let closure = loop {
        if shared.is_stale(epoch) {
            break Closure::Graceful;
        }
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(msg) => {
                    if let Err(e) = framed.send(msg).await {
                        warn!(error = %e, "channel write failed");
                        break Closure::Abnormal;
                    }
                }
                // Sender dropped by close().
                None => break Closure::Graceful,
            },
            frame = framed.next() => match frame {
                Some(Ok(msg)) => shared.dispatch(&msg),
                Some(Err(e)) => {
                    warn!(error = %e, "undecodable frame");
                    break Closure::Abnormal;
                }
                None => break Closure::Abnormal,
            },
        }
    };

    if !shared.is_stale(epoch) {
        let mut guard = shared.outbound.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
    closure
}
