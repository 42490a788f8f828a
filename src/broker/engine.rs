//! Broker engine
//!
//! This module contains the routing and lifecycle engine responsible for:
//! - resolving a logical receiver to a registered socket (round robin) or to
//!   an upstream broker reached through a proxy client
//! - buffering dispatched requests until their response or error arrives
//! - delivering responses back to every socket of the original sender
//! - dropping buffered messages whose TTL elapsed (periodic sweep)
//! - writing and restoring the crash-recovery snapshot (periodic sync)
//!
//! Concurrency and usage notes:
//! - Two [`TaskQueue`]s drive all work: `incoming` routes requests, `outgoing`
//!   delivers responses. Each runs one task at a time.
//! - Registry and buffer sit behind short-lived locks that are never held
//!   across an `.await`.
//! - Sockets are reached only through the injected [`FrameSink`], so the
//!   engine has no knowledge of the transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::message::{Message, MessageStatus};
use crate::broker::registry::{ServiceRegistry, SocketId};
use crate::broker::snapshot::Snapshot;
use crate::client::{BrokerClient, ClientError, RequestOutcome};
use crate::config::ServerSettings;
use crate::persistence::Storage;
use crate::queue::{TaskError, TaskHandler, TaskQueue};
use crate::transport::message::{Envelope, Frame};
use crate::utils::error::ErrorCode;
use crate::utils::now_millis;

/// Used for proxied requests when neither the message TTL nor the proxy link
/// supplies a timeout.
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound side of the connection layer as seen by the engine.
pub trait FrameSink: Send + Sync {
    /// Writes `frame` to one socket; `false` if the socket is gone.
    fn send_frame(&self, socket_id: &str, frame: &Frame) -> bool;
}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Key of the persisted snapshot.
    pub id: String,
    pub task_interval: Duration,
    pub sweep_interval: Duration,
    pub sync_interval: Duration,
    /// Send an `expired` ERROR to the sender of every swept message.
    pub notify_expired: bool,
}

impl From<&ServerSettings> for BrokerOptions {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            id: settings.id.clone(),
            task_interval: Duration::from_millis(settings.task_interval_ms),
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms),
            sync_interval: Duration::from_millis(settings.sync_interval_ms),
            notify_expired: settings.notify_expired,
        }
    }
}

struct BrokerState {
    options: BrokerOptions,
    registry: Mutex<ServiceRegistry>,
    buffer: Mutex<HashMap<String, Message>>,
    sink: Arc<dyn FrameSink>,
    storage: Arc<dyn Storage>,
    proxies: Vec<Arc<BrokerClient>>,
}

impl BrokerState {
    fn send_round_robin(&self, name: &str, frame: &Frame) -> bool {
        let socket = self.registry.lock().next_socket(name);
        match socket {
            Some(socket_id) => self.sink.send_frame(&socket_id, frame),
            None => false,
        }
    }

    /// Sends to every socket of `name`; returns how many writes succeeded.
    fn send_all(&self, name: &str, frame: &Frame) -> usize {
        let sockets = self.registry.lock().sockets(name);
        sockets
            .iter()
            .filter(|socket_id| self.sink.send_frame(socket_id, frame))
            .count()
    }

    fn report_to_sender(&self, message: &Message) {
        let Some(sender) = message.sender.as_deref() else {
            debug!("No sender to notify for {}", message.outgoing_id);
            return;
        };
        if !self.send_round_robin(sender, &Frame::Error(Envelope::from_message(message))) {
            debug!(
                "Sender '{sender}' unreachable, dropping {} error for {}",
                message.info.error.as_deref().unwrap_or("unknown"),
                message.outgoing_id
            );
        }
    }

    fn proxy_for(&self, receiver: &str) -> Option<Arc<BrokerClient>> {
        self.proxies.iter().find(|p| p.knows(receiver)).cloned()
    }
}

/// What the incoming handler did with a request.
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// Written to local socket(s); the message waits in the buffer under
    /// this outgoing id.
    Local(String),
    /// Handed to an upstream broker; completes on its own.
    Proxied,
}

pub(crate) struct IncomingHandler {
    state: Arc<BrokerState>,
}

#[async_trait]
impl TaskHandler<Message> for IncomingHandler {
    type Output = Dispatch;

    async fn handle(&self, mut message: Message) -> Result<Dispatch, TaskError<Message>> {
        if message.is_expired() {
            message.fail(MessageStatus::Expired, ErrorCode::Expired);
            return Err(TaskError::new(message, "expired"));
        }

        let state = &self.state;
        if state.registry.lock().is_registered(&message.receiver) {
            let frame = Frame::Request(Envelope::from_message(&message));
            // Buffered before the write: a response must always find its entry.
            let mut buffered = message.clone();
            buffered.status = MessageStatus::Delivered;
            buffered.info.stamp_delivered();
            state
                .buffer
                .lock()
                .insert(buffered.outgoing_id.clone(), buffered);

            let delivered = if message.options.is_broadcast() {
                state.send_all(&message.receiver, &frame) > 0
            } else {
                state.send_round_robin(&message.receiver, &frame)
            };
            if delivered {
                return Ok(Dispatch::Local(message.outgoing_id));
            }
            state.buffer.lock().remove(&message.outgoing_id);
            message.fail(MessageStatus::NotDelivered, ErrorCode::NotDelivered);
            return Err(TaskError::new(message, "receiver socket unavailable"));
        }

        if let Some(proxy) = state.proxy_for(&message.receiver) {
            debug!(
                "Forwarding {} for '{}' to upstream {}",
                message.outgoing_id,
                message.receiver,
                proxy.url()
            );
            tokio::spawn(forward_to_proxy(Arc::clone(state), proxy, message));
            return Ok(Dispatch::Proxied);
        }

        message.fail(MessageStatus::NotDelivered, ErrorCode::NotDelivered);
        Err(TaskError::new(message, "no route"))
    }

    fn on_success(&self, dispatch: Dispatch, _queue: &TaskQueue<Message>) {
        if let Dispatch::Local(outgoing_id) = dispatch {
            debug!("Delivered {outgoing_id}; awaiting response");
        }
    }

    fn on_error(&self, error: TaskError<Message>, _queue: &TaskQueue<Message>) {
        debug!(
            "Routing {} to '{}' failed: {}",
            error.task.outgoing_id, error.task.receiver, error.reason
        );
        self.state.report_to_sender(&error.task);
    }
}

async fn forward_to_proxy(state: Arc<BrokerState>, proxy: Arc<BrokerClient>, mut message: Message) {
    let timeout = message
        .remaining_ttl()
        .map(Duration::from_millis)
        .or_else(|| proxy.default_timeout())
        .unwrap_or(DEFAULT_PROXY_TIMEOUT)
        .max(Duration::from_millis(1));

    let outcome = proxy
        .request(
            &message.receiver,
            message.data.clone(),
            message.options.clone(),
            Some(timeout),
        )
        .await;

    let Some(sender) = message.sender.clone() else {
        debug!("Proxied {} has no sender to answer", message.outgoing_id);
        return;
    };

    match outcome {
        Ok(RequestOutcome::Replied(reply)) => {
            message.data = reply.data;
            message.status = reply.status;
            if let Some(delivered_at) = reply.info.delivered_at {
                message.info.delivered_at.get_or_insert(delivered_at);
            }
            if reply.status == MessageStatus::NotHandled {
                message.info.error = reply.info.error;
            }
            message.info.stamp_handled();
        }
        Ok(RequestOutcome::Enqueued) => {
            warn!("Proxy request {} resolved without a reply", message.outgoing_id);
            return;
        }
        Err(e) => {
            let (status, code) = match &e {
                ClientError::Remote {
                    code: Some(ErrorCode::Expired),
                    ..
                } => (MessageStatus::Expired, ErrorCode::Expired),
                ClientError::Timeout { .. } => (MessageStatus::NotDelivered, ErrorCode::Timeout),
                _ => (MessageStatus::NotDelivered, ErrorCode::NotDelivered),
            };
            warn!("Proxied request {} failed: {e}", message.outgoing_id);
            message.fail(status, code);
        }
    }

    if !state.send_round_robin(&sender, &Frame::reply_for(&message)) {
        debug!("Sender '{sender}' gone before proxied reply {}", message.outgoing_id);
    }
}

pub(crate) struct OutgoingHandler {
    state: Arc<BrokerState>,
}

#[async_trait]
impl TaskHandler<Message> for OutgoingHandler {
    type Output = ();

    async fn handle(&self, message: Message) -> Result<(), TaskError<Message>> {
        let Some(sender) = message.sender.as_deref() else {
            return Err(TaskError::new(message, "no sender"));
        };
        let frame = Frame::reply_for(&message);
        if self.state.send_all(sender, &frame) == 0 {
            return Err(TaskError::new(message, "sender not registered"));
        }
        Ok(())
    }

    fn on_error(&self, error: TaskError<Message>, queue: &TaskQueue<Message>) {
        let message = error.task;
        if message.sender.is_none() {
            warn!("Dropping reply {}: it has no sender", message.outgoing_id);
        } else if message.is_expired() {
            warn!(
                "Dropping reply {}: TTL elapsed while '{}' was unreachable",
                message.outgoing_id,
                message.sender.as_deref().unwrap_or_default()
            );
        } else {
            queue.enqueue(message);
        }
    }
}

/// The routing engine. Construct with [`Broker::new`], then [`Broker::start`].
pub struct Broker {
    state: Arc<BrokerState>,
    incoming: TaskQueue<Message>,
    outgoing: TaskQueue<Message>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// Builds the engine and restores any valid snapshot stored under
    /// `options.id`. Nothing runs until [`Broker::start`].
    pub fn new(
        options: BrokerOptions,
        storage: Arc<dyn Storage>,
        sink: Arc<dyn FrameSink>,
        proxies: Vec<Arc<BrokerClient>>,
    ) -> Self {
        let snapshot = Snapshot::load_or_default(storage.as_ref(), &options.id);
        let incoming = TaskQueue::new(options.task_interval);
        let outgoing = TaskQueue::new(options.task_interval);

        for message in snapshot.incoming_queue_snapshot {
            incoming.enqueue(message);
        }
        for message in snapshot.outgoing_queue_snapshot {
            outgoing.enqueue(message);
        }

        let state = Arc::new(BrokerState {
            options,
            registry: Mutex::new(ServiceRegistry::new()),
            buffer: Mutex::new(snapshot.pending_response_buffer),
            sink,
            storage,
            proxies,
        });

        Self {
            state,
            incoming,
            outgoing,
            timers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.state.options.id
    }

    pub(crate) fn incoming_handler(&self) -> IncomingHandler {
        IncomingHandler {
            state: Arc::clone(&self.state),
        }
    }

    pub(crate) fn outgoing_handler(&self) -> OutgoingHandler {
        OutgoingHandler {
            state: Arc::clone(&self.state),
        }
    }

    /// Starts both queues and the sweep and sync timers.
    pub fn start(&self) {
        self.incoming.start(self.incoming_handler());
        self.outgoing.start(self.outgoing_handler());

        let mut timers = self.timers.lock();
        if !timers.is_empty() {
            return;
        }

        let state = Arc::clone(&self.state);
        let period = state.options.sweep_interval;
        timers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sweep(&state);
            }
        }));

        let state = Arc::clone(&self.state);
        let (incoming, outgoing) = (self.incoming.clone(), self.outgoing.clone());
        let period = state.options.sync_interval;
        timers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = snapshot_of(&state, &incoming, &outgoing)
                    .write(state.storage.as_ref(), &state.options.id)
                {
                    warn!("Snapshot sync failed: {e}");
                }
            }
        }));
        info!("Broker '{}' started", self.id());
    }

    /// Stops queues and timers, then writes a final snapshot.
    pub fn shutdown(&self) {
        self.incoming.stop();
        self.outgoing.stop();
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
        for proxy in &self.state.proxies {
            proxy.shutdown();
        }
        if let Err(e) = self.sync() {
            warn!("Final snapshot sync failed: {e}");
        }
        info!("Broker '{}' stopped", self.id());
    }

    /// Server ingress for routable requests: stamps the receive time and
    /// queues the message for routing.
    pub fn process_request(&self, mut message: Message) {
        message.status = MessageStatus::Received;
        message.info.stamp_received();
        self.incoming.enqueue(message);
    }

    /// Matches a RESPONSE/ERROR against the buffer. Unknown or already
    /// completed ids are ignored; returns whether a buffered message matched.
    pub fn process_response(&self, reply: Envelope) -> bool {
        let Some(outgoing_id) = reply.outgoing_id.as_deref() else {
            debug!("Response without outgoingId ignored");
            return false;
        };
        let Some(mut stored) = self.state.buffer.lock().remove(outgoing_id) else {
            debug!("No buffered message for {outgoing_id}; response ignored");
            return false;
        };
        if reply.status == Some(MessageStatus::NotHandled) {
            stored.status = MessageStatus::NotHandled;
            stored.info.error = reply.info.error.or(stored.info.error);
        } else {
            stored.status = MessageStatus::Handled;
        }
        stored.info.stamp_handled();
        stored.data = reply.data;
        self.outgoing.enqueue(stored);
        true
    }

    pub fn add_service(&self, name: &str, socket_id: SocketId) {
        self.state.registry.lock().add_service(name, socket_id);
    }

    pub fn remove_service(&self, socket_id: &str) {
        self.state.registry.lock().remove_service(socket_id);
    }

    /// Names with at least one registered socket.
    pub fn services(&self) -> Vec<String> {
        self.state.registry.lock().names()
    }

    /// Sockets registered under `name`, in registration order.
    pub fn sockets(&self, name: &str) -> Vec<SocketId> {
        self.state.registry.lock().sockets(name)
    }

    pub fn is_buffered(&self, outgoing_id: &str) -> bool {
        self.state.buffer.lock().contains_key(outgoing_id)
    }

    pub fn buffered_len(&self) -> usize {
        self.state.buffer.lock().len()
    }

    pub fn queued_len(&self) -> (usize, usize) {
        (self.incoming.len(), self.outgoing.len())
    }

    /// Runs one TTL sweep now; returns the number of dropped entries.
    pub fn sweep_expired(&self) -> usize {
        sweep(&self.state)
    }

    pub fn snapshot(&self) -> Snapshot {
        snapshot_of(&self.state, &self.incoming, &self.outgoing)
    }

    /// Writes the current snapshot now.
    pub fn sync(&self) -> Result<(), crate::broker::snapshot::SnapshotError> {
        self.snapshot()
            .write(self.state.storage.as_ref(), &self.state.options.id)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.incoming.stop();
        self.outgoing.stop();
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
    }
}

fn snapshot_of(
    state: &BrokerState,
    incoming: &TaskQueue<Message>,
    outgoing: &TaskQueue<Message>,
) -> Snapshot {
    Snapshot {
        pending_response_buffer: state.buffer.lock().clone(),
        incoming_queue_snapshot: incoming.snapshot(),
        outgoing_queue_snapshot: outgoing.snapshot(),
    }
}

fn sweep(state: &BrokerState) -> usize {
    let now = now_millis();
    let expired: Vec<Message> = {
        let mut buffer = state.buffer.lock();
        let keys: Vec<String> = buffer
            .iter()
            .filter(|(_, message)| message.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter().filter_map(|key| buffer.remove(key)).collect()
    };

    if !expired.is_empty() {
        debug!("Swept {} expired buffered message(s)", expired.len());
    }
    if state.options.notify_expired {
        for mut message in expired.iter().cloned() {
            message.fail(MessageStatus::Expired, ErrorCode::Expired);
            state.report_to_sender(&message);
        }
    }
    expired.len()
}
