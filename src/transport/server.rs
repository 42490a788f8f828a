use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::{Message, MessageInfo, MessageStatus};
use crate::broker::{Broker, BrokerOptions, FrameSink};
use crate::client::{BrokerClient, NoHandler};
use crate::config::{ServerSettings, SettingsError};
use crate::persistence::Storage;
use crate::transport::codec;
use crate::transport::connections::Connections;
use crate::transport::crypto::FrameCipher;
use crate::transport::message::{Frame, RESERVED_ACTIONS};
use crate::utils::error::ErrorCode;
use crate::utils::new_id;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("can't bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// WebSocket front of a [`Broker`].
pub struct BrokerServer {
    listener: TcpListener,
    broker: Arc<Broker>,
    connections: Connections,
    stop: watch::Sender<bool>,
}

impl BrokerServer {
    /// Binds `host:port` from the settings and starts the broker.
    pub async fn bind(
        settings: &ServerSettings,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, ServerError> {
        settings.validate()?;
        let addr = format!("{}:{}", settings.host, settings.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Self::from_listener(listener, settings, storage)
    }

    /// Like [`BrokerServer::bind`] on an already bound listener; the port in
    /// `settings` is ignored.
    pub fn from_listener(
        listener: TcpListener,
        settings: &ServerSettings,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, ServerError> {
        settings.validate()?;

        let connections = Connections::new(FrameCipher::from_optional(
            settings.secure_key.as_deref(),
        ));
        let mut proxies = Vec::with_capacity(settings.proxy_to.len());
        for proxy in &settings.proxy_to {
            proxies.push(Arc::new(BrokerClient::connect(proxy.clone(), NoHandler)?));
        }

        let sink: Arc<dyn FrameSink> = Arc::new(connections.clone());
        let broker = Arc::new(Broker::new(
            BrokerOptions::from(settings),
            storage,
            sink,
            proxies,
        ));
        broker.start();

        Ok(Self {
            listener,
            broker,
            connections,
            stop: watch::channel(false).0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    /// Accepts connections until the listener fails or the server is shut
    /// down.
    pub async fn run(&self) {
        if let Ok(addr) = self.local_addr() {
            info!("Broker '{}' listening on ws://{addr}", self.broker.id());
        }
        let stop_signal = stopped(self.stop.subscribe());
        tokio::pin!(stop_signal);
        loop {
            tokio::select! {
                biased;
                _ = &mut stop_signal => return,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let broker = Arc::clone(&self.broker);
                        let connections = self.connections.clone();
                        let stop = self.stop.subscribe();
                        tokio::spawn(handle_connection(stream, peer, broker, connections, stop));
                    }
                    Err(e) => {
                        error!("Accept failed: {e}");
                        return;
                    }
                },
            }
        }
    }

    /// Closes every client socket, stops the broker and writes its final
    /// snapshot. Clients fall back to reconnecting.
    pub fn shutdown(&self) {
        if self.stop.send_replace(true) {
            return;
        }
        self.broker.shutdown();
    }
}

/// Resolves once `stop` flips to `true` or its sender is gone.
async fn stopped(mut stop: watch::Receiver<bool>) {
    loop {
        let done = *stop.borrow_and_update();
        if done || stop.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    connections: Connections,
    stop: watch::Receiver<bool>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {peer} failed: {e}");
            return;
        }
    };
    let socket_id = format!("socket-{}", new_id());
    debug!("{peer} connected as {socket_id}");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    connections.register(&socket_id, tx);

    let writer_id = socket_id.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                debug!("Failed to write to {writer_id}: {e}");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let stop_signal = stopped(stop);
    tokio::pin!(stop_signal);
    loop {
        let msg = tokio::select! {
            biased;
            _ = &mut stop_signal => {
                debug!("Closing {socket_id}: server shutting down");
                break;
            }
            msg = ws_receiver.next() => msg,
        };
        let Some(msg) = msg else { break };
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Read from {socket_id} failed: {e}");
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        match codec::decode(&msg, connections.cipher()) {
            Ok(Some(frame)) => on_frame(&broker, &connections, &socket_id, frame),
            Ok(None) => {}
            Err(e) => {
                warn!("Closing {socket_id}: {e}");
                break;
            }
        }
    }

    broker.remove_service(&socket_id);
    let name = connections.remove(&socket_id);
    connections.broadcast_receivers(broker.services());
    info!(
        "{socket_id} ({}) disconnected",
        name.as_deref().unwrap_or("unregistered")
    );
}

fn on_frame(broker: &Broker, connections: &Connections, socket_id: &str, frame: Frame) {
    match frame {
        Frame::Init(init) => {
            if init.id.trim().is_empty() || RESERVED_ACTIONS.contains(&init.id.as_str()) {
                warn!("{socket_id} tried to register as '{}'", init.id);
                return;
            }
            broker.add_service(&init.id, socket_id.to_string());
            connections.set_name(socket_id, &init.id);
            connections.broadcast_receivers(broker.services());
            info!("{socket_id} registered as '{}'", init.id);
        }
        Frame::Request(envelope) => {
            let sender = connections.name_of(socket_id);
            match envelope.receiver.clone() {
                Some(receiver) if !receiver.is_empty() => {
                    broker.process_request(Message {
                        outgoing_id: new_id(),
                        incoming_id: envelope.incoming_id,
                        socket_id: socket_id.to_string(),
                        sender,
                        receiver,
                        status: MessageStatus::Enqueued,
                        options: envelope.options,
                        data: envelope.data,
                        info: MessageInfo::default(),
                    });
                }
                _ => {
                    warn!("Request from {socket_id} has no receiver");
                    let mut reply = envelope;
                    reply.status = Some(MessageStatus::NotDelivered);
                    reply.info.error = Some(ErrorCode::NotDelivered.as_str().to_string());
                    connections.send_frame(socket_id, &Frame::Error(reply));
                }
            }
        }
        Frame::Response(envelope) | Frame::Error(envelope) => {
            broker.process_response(envelope);
        }
        other => debug!("Ignoring {} frame from {socket_id}", other.action()),
    }
}
