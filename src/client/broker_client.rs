//! Broker client
//!
//! A [`BrokerClient`] keeps one WebSocket link to a broker server and
//! registers on it under its logical id. It plays both roles:
//! - caller: [`BrokerClient::request`] sends a REQUEST and, when a timeout
//!   applies, waits for the correlated RESPONSE or ERROR
//! - service: REQUESTs routed to this id run through the [`RequestHandler`]
//!   and their outcome travels back as RESPONSE or ERROR
//!
//! Frames are written by the outbound [`TaskQueue`], which keeps retrying
//! while the link is down, so requests issued during a reconnect are sent
//! once the link is back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::{MessageInfo, MessageOptions, MessageStatus};
use crate::client::error::ClientError;
use crate::client::handler::RequestHandler;
use crate::client::pending::{Completion, PendingRequests};
use crate::config::{ClientSettings, SettingsError};
use crate::queue::{TaskError, TaskHandler, TaskQueue};
use crate::transport::codec;
use crate::transport::crypto::FrameCipher;
use crate::transport::message::{Envelope, Frame, InitPayload};
use crate::utils::error::describe_code;
use crate::utils::new_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// A correlated reply to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub data: Value,
    pub options: MessageOptions,
    /// `Handled`, or `NotHandled` when the receiving handler failed.
    pub status: MessageStatus,
    pub info: MessageInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// Fire-and-forget: the request was queued for sending.
    Enqueued,
    Replied(Reply),
}

impl Completion {
    pub(crate) fn into_outcome(self) -> Result<RequestOutcome, ClientError> {
        match self {
            Completion::Response(envelope) => Ok(RequestOutcome::Replied(Reply {
                data: envelope.data,
                options: envelope.options,
                status: envelope.status.unwrap_or(MessageStatus::Handled),
                info: envelope.info,
            })),
            Completion::Error(envelope) if envelope.status == Some(MessageStatus::NotHandled) => {
                Ok(RequestOutcome::Replied(Reply {
                    data: envelope.data,
                    options: envelope.options,
                    status: MessageStatus::NotHandled,
                    info: envelope.info,
                }))
            }
            Completion::Error(envelope) => Err(ClientError::Remote {
                code: envelope.info.error_code(),
                message: describe_code(envelope.info.error.as_deref()).to_string(),
            }),
        }
    }
}

struct ClientShared {
    settings: ClientSettings,
    cipher: Option<FrameCipher>,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    pending: PendingRequests,
    receivers: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl ClientShared {
    fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    /// Hands `frame` to the live connection, or gives it back.
    fn send_frame(&self, frame: Frame) -> Result<(), (Frame, &'static str)> {
        match self.writer.lock().as_ref() {
            Some(writer) => writer.send(frame).map_err(|e| (e.0, "connection closed")),
            None => Err((frame, "not connected")),
        }
    }

    fn on_message(&self, msg: &WsMessage, incoming: &TaskQueue<Envelope>) {
        let frame = match codec::decode(msg, self.cipher.as_ref()) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                debug!("Dropping undecodable frame from {}: {e}", self.settings.url());
                return;
            }
        };
        match frame {
            Frame::Request(envelope) => incoming.enqueue(envelope),
            Frame::Response(envelope) => self.complete(envelope, Completion::Response),
            Frame::Error(envelope) => self.complete(envelope, Completion::Error),
            Frame::Acknowledge(payload) => {
                if self.pending.cancel(&payload.incoming_id) {
                    debug!("Request {} acknowledged without reply", payload.incoming_id);
                }
            }
            Frame::Receivers(payload) => *self.receivers.lock() = payload.data,
            Frame::Init(_) => debug!("Ignoring init frame from server"),
        }
    }

    fn complete(&self, envelope: Envelope, wrap: fn(Envelope) -> Completion) {
        let Some(id) = envelope.incoming_id.clone() else {
            debug!("Reply without incomingId ignored");
            return;
        };
        if !self.pending.complete(&id, wrap(envelope)) {
            debug!("Late or unknown reply {id} ignored");
        }
    }

    /// Drives one established connection until either side closes it.
    async fn serve(
        &self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        incoming: &TaskQueue<Envelope>,
        outgoing: &TaskQueue<Frame>,
    ) {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let init = Frame::Init(InitPayload {
            id: self.settings.id.clone(),
        });
        let init = match codec::encode(&init, self.cipher.as_ref()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Failed to encode init frame: {e}");
                return;
            }
        };
        if let Err(e) = ws_sender.send(init).await {
            warn!("Failed to register as '{}': {e}", self.settings.id);
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        *self.writer.lock() = Some(tx);
        self.state.send_replace(ConnectionState::Connected);
        info!("Registered as '{}' on {}", self.settings.id, self.settings.url());

        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(frame) => {
                        let msg = match codec::encode(&frame, self.cipher.as_ref()) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!("Dropping unencodable {} frame: {e}", frame.action());
                                continue;
                            }
                        };
                        if let Err(e) = ws_sender.send(msg).await {
                            warn!("Failed to send to {}: {e}", self.settings.url());
                            outgoing.enqueue(frame);
                            break;
                        }
                    }
                    None => {
                        let _ = ws_sender.send(WsMessage::Close(None)).await;
                        break;
                    }
                },
                inbound = ws_receiver.next() => match inbound {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(msg)) => self.on_message(&msg, incoming),
                    Some(Err(e)) => {
                        warn!("Connection to {} failed: {e}", self.settings.url());
                        break;
                    }
                },
            }
        }

        self.writer.lock().take();
        requeue_unsent(&mut rx, outgoing);
    }
}

/// Moves frames accepted by a link that has since gone down back onto the
/// outbound queue.
pub(crate) fn requeue_unsent(
    rx: &mut mpsc::UnboundedReceiver<Frame>,
    outgoing: &TaskQueue<Frame>,
) {
    rx.close();
    let mut requeued = 0;
    while let Ok(frame) = rx.try_recv() {
        outgoing.enqueue(frame);
        requeued += 1;
    }
    if requeued > 0 {
        debug!("Requeued {requeued} unsent frame(s)");
    }
}

async fn run_connection(
    shared: Arc<ClientShared>,
    incoming: TaskQueue<Envelope>,
    outgoing: TaskQueue<Frame>,
) {
    let url = shared.settings.url();
    let retry = Duration::from_millis(shared.settings.reconnect_interval_ms);
    loop {
        shared.state.send_replace(ConnectionState::Connecting);
        match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => shared.serve(ws_stream, &incoming, &outgoing).await,
            Err(e) => warn!("Could not connect to {url}: {e}"),
        }
        shared.writer.lock().take();
        shared.state.send_replace(ConnectionState::Disconnected);

        if shared.closed.load(Ordering::SeqCst) || !shared.settings.reconnect {
            info!("Connection to {url} closed");
            return;
        }
        debug!("Reconnecting to {url} in {retry:?}");
        tokio::time::sleep(retry).await;
    }
}

struct OutboundHandler {
    shared: Arc<ClientShared>,
}

#[async_trait]
impl TaskHandler<Frame> for OutboundHandler {
    type Output = ();

    async fn handle(&self, frame: Frame) -> Result<(), TaskError<Frame>> {
        if !self.shared.is_connected() {
            return Err(TaskError::new(frame, "not connected"));
        }
        self.shared
            .send_frame(frame)
            .map_err(|(frame, reason)| TaskError::new(frame, reason))
    }

    fn on_error(&self, error: TaskError<Frame>, queue: &TaskQueue<Frame>) {
        queue.enqueue(error.task);
    }
}

struct InboundHandler {
    handler: Arc<dyn RequestHandler>,
    outgoing: TaskQueue<Frame>,
}

#[async_trait]
impl TaskHandler<Envelope> for InboundHandler {
    type Output = Envelope;

    async fn handle(&self, mut envelope: Envelope) -> Result<Envelope, TaskError<Envelope>> {
        match self
            .handler
            .handle(envelope.data.clone(), envelope.options.clone())
            .await
        {
            Ok(reply) => {
                envelope.data = reply.data;
                envelope.options = reply.options;
                envelope.status = Some(MessageStatus::Handled);
                Ok(envelope)
            }
            Err(e) => {
                let reason = e.to_string();
                envelope.status = Some(MessageStatus::NotHandled);
                envelope.info.error = Some(reason.clone());
                Err(TaskError::new(envelope, reason))
            }
        }
    }

    fn on_success(&self, envelope: Envelope, _queue: &TaskQueue<Envelope>) {
        self.outgoing.enqueue(Frame::Response(envelope));
    }

    fn on_error(&self, error: TaskError<Envelope>, _queue: &TaskQueue<Envelope>) {
        debug!("Handler failed: {}", error.reason);
        self.outgoing.enqueue(Frame::Error(error.task));
    }
}

/// Client endpoint of a broker. Cheap to share behind an `Arc`.
pub struct BrokerClient {
    shared: Arc<ClientShared>,
    outgoing: TaskQueue<Frame>,
    incoming: TaskQueue<Envelope>,
    connection: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerClient {
    /// Validates `settings`, starts both queues and begins connecting in the
    /// background. Must be called inside a Tokio runtime.
    pub fn connect<H>(settings: ClientSettings, handler: H) -> Result<Self, SettingsError>
    where
        H: RequestHandler + 'static,
    {
        settings.validate()?;

        let interval = Duration::from_millis(settings.task_interval_ms);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(ClientShared {
            cipher: FrameCipher::from_optional(settings.secure_key.as_deref()),
            settings,
            state,
            writer: Mutex::new(None),
            pending: PendingRequests::new(),
            receivers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let outgoing = TaskQueue::new(interval);
        let incoming = TaskQueue::new(interval);
        outgoing.start(OutboundHandler {
            shared: Arc::clone(&shared),
        });
        incoming.start(InboundHandler {
            handler: Arc::new(handler),
            outgoing: outgoing.clone(),
        });

        let connection = tokio::spawn(run_connection(
            Arc::clone(&shared),
            incoming.clone(),
            outgoing.clone(),
        ));

        Ok(Self {
            shared,
            outgoing,
            incoming,
            connection: Mutex::new(Some(connection)),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.settings.id
    }

    pub fn url(&self) -> String {
        self.shared.settings.url()
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.shared
            .settings
            .default_request_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Waits until the link is registered; `false` on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.subscribe();
        tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .is_ok_and(|res| res.is_ok())
    }

    /// Whether the server last advertised `name` as a live receiver.
    pub fn knows(&self, name: &str) -> bool {
        self.shared.receivers.lock().iter().any(|r| r == name)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }

    /// Sends `data` to the logical receiver `receiver`.
    ///
    /// `timeout` of `None` falls back to the configured default. A zero or
    /// absent timeout makes the call fire-and-forget: it resolves as
    /// [`RequestOutcome::Enqueued`] as soon as the frame is queued. Otherwise
    /// the call waits for the correlated reply, and `options.ttl` is raised
    /// to the timeout when it is smaller.
    pub async fn request(
        &self,
        receiver: &str,
        data: Value,
        mut options: MessageOptions,
        timeout: Option<Duration>,
    ) -> Result<RequestOutcome, ClientError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        if receiver.trim().is_empty() {
            return Err(ClientError::InvalidRequest(
                "receiver must not be empty".to_string(),
            ));
        }

        let timeout = timeout
            .or_else(|| self.default_timeout())
            .unwrap_or(Duration::ZERO);
        let id = new_id();

        if timeout.is_zero() {
            let envelope = Envelope::request(receiver, id, data, options);
            self.outgoing.enqueue(Frame::Request(envelope));
            return Ok(RequestOutcome::Enqueued);
        }

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        if options.ttl.is_some_and(|ttl| ttl < timeout_ms) {
            options.ttl = Some(timeout_ms);
        }

        let mut rx = self.shared.pending.register(&id);
        let envelope = Envelope::request(receiver, id.clone(), data, options);
        self.outgoing.enqueue(Frame::Request(envelope));

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(completion)) => completion.into_outcome(),
            Ok(Err(_)) => Err(ClientError::Dropped(id)),
            Err(_) => {
                self.shared.pending.cancel(&id);
                // A reply may have landed between the deadline and the cancel.
                match rx.try_recv() {
                    Ok(completion) => completion.into_outcome(),
                    Err(_) => Err(ClientError::Timeout { id, timeout_ms }),
                }
            }
        }
    }

    /// Stops both queues and closes the link without reconnecting.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outgoing.stop();
        self.incoming.stop();
        if let Some(connection) = self.connection.lock().take() {
            connection.abort();
        }
        self.shared.writer.lock().take();
        self.shared.state.send_replace(ConnectionState::Disconnected);
        debug!("Client '{}' shut down", self.id());
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("id", &self.shared.settings.id)
            .field("url", &self.shared.settings.url())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
