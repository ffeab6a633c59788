use super::message::{HassEvent, Incoming, Outgoing};
use super::rest::RestApi;
use crate::config::HassConfig;
use crate::consts;
use crate::error::Error;
use crate::state::{apply_compressed, Entities, StateCache};
use crate::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Anything able to execute a HA WebSocket command and return its `result`.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, message: Outgoing) -> Result<Value>;
}

struct Request {
    message: Outgoing,
    respond: oneshot::Sender<Result<Value>>,
}

/// HA interfacing via WebSocket. Survives HA restarts: every disconnect
/// puts the session loop back into waiting for HA to report `RUNNING`.
pub struct Connection {
    requests: mpsc::Sender<Request>,
    events: broadcast::Sender<HassEvent>,
    connected: watch::Receiver<bool>,
}

/// Per-session bookkeeping.
struct Session {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Value>>>,
    events_id: u64,
    entities_id: u64,
    /// First entities push after (re)subscribing carries the full state.
    fresh_entities: bool,
}

impl Session {
    fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            events_id: 0,
            entities_id: 0,
            fresh_entities: true,
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Connection {
    /// Spawn the connection task. Returns immediately; use
    /// [`Connection::wait_connected`] to wait for the first session.
    pub fn start(config: &HassConfig, rest: Arc<RestApi>, cache: Arc<StateCache>) -> Self {
        let (requests, request_rx) = mpsc::channel::<Request>(consts::CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(consts::CHANNEL_CAPACITY);
        let (connected_tx, connected) = watch::channel(false);

        task::spawn(Self::run(
            config.websocket_url(),
            config.token.clone(),
            rest,
            cache,
            events.clone(),
            request_rx,
            connected_tx,
        ));

        Connection {
            requests,
            events,
            connected,
        }
    }

    /// Raw event bus.
    pub fn events(&self) -> broadcast::Sender<HassEvent> {
        self.events.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub async fn wait_connected(&self) {
        let mut connected = self.connected.clone();
        // Error means the connection task is gone; nothing to wait for.
        let _ = connected.wait_for(|connected| *connected).await;
    }

    async fn run(
        url: String,
        token: String,
        rest: Arc<RestApi>,
        cache: Arc<StateCache>,
        events: broadcast::Sender<HassEvent>,
        mut requests: mpsc::Receiver<Request>,
        connected: watch::Sender<bool>,
    ) {
        loop {
            rest.wait_until_running().await;

            let result =
                Self::session(&url, &token, &cache, &events, &mut requests, &connected).await;

            let _ = connected.send(false);
            rest.mark_stopped();
            match result {
                Ok(()) => info!("Disconnected from Home Assistant"),
                Err(Error::Authentication(msg)) => {
                    error!("Home Assistant rejected our token: {}", msg);
                }
                Err(err) => warn!("Home Assistant connection lost: {}", err),
            }
            tokio::time::sleep(consts::HA_PROBE_INTERVAL).await;
        }
    }

    async fn session(
        url: &str,
        token: &str,
        cache: &StateCache,
        events: &broadcast::Sender<HassEvent>,
        requests: &mut mpsc::Receiver<Request>,
        connected: &watch::Sender<bool>,
    ) -> Result<()> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        // Handshake: auth_required -> auth -> auth_ok.
        loop {
            let msg = match read.next().await {
                Some(msg) => msg?,
                None => return Err(Error::Disconnected),
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => return Err(Error::Disconnected),
                _ => continue,
            };
            match serde_json::from_str::<Incoming>(&text)? {
                Incoming::AuthRequired { ha_version } => {
                    debug!("Authenticating to Home Assistant {:?}", ha_version);
                    let auth = Outgoing::Auth {
                        access_token: token.to_string(),
                    };
                    write.send(Message::Text(auth.to_json(None).to_string())).await?;
                }
                Incoming::AuthOk { ha_version } => {
                    info!("Connected to Home Assistant {:?}", ha_version);
                    break;
                }
                Incoming::AuthInvalid { message } => {
                    return Err(Error::Authentication(message.unwrap_or_default()));
                }
                other => debug!("Unexpected message during handshake: {:?}", other),
            }
        }

        let mut session = Session::new();
        session.events_id = session.allocate_id();
        write
            .send(Message::Text(
                Outgoing::SubscribeEvents.to_json(Some(session.events_id)).to_string(),
            ))
            .await?;
        session.entities_id = session.allocate_id();
        write
            .send(Message::Text(
                Outgoing::SubscribeEntities
                    .to_json(Some(session.entities_id))
                    .to_string(),
            ))
            .await?;

        let _ = connected.send(true);

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => return Ok(()),
                    };
                    match msg {
                        Message::Text(text) => {
                            Self::handle_text(&text, &mut session, cache, events);
                        }
                        Message::Close(frame) => {
                            debug!("Home Assistant closed the socket: {:?}", frame);
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                request = requests.recv() => {
                    let request = match request {
                        Some(request) => request,
                        // Connection handle dropped - quit.
                        None => return Ok(()),
                    };
                    let id = session.allocate_id();
                    let payload = request.message.to_json(Some(id));
                    debug!("WS TX: {}", payload);
                    match write.send(Message::Text(payload.to_string())).await {
                        Ok(()) => {
                            session.pending.insert(id, request.respond);
                        }
                        Err(err) => {
                            let _ = request.respond.send(Err(Error::Disconnected));
                            return Err(err.into());
                        }
                    }
                }
                _ = ping.tick() => {
                    let id = session.allocate_id();
                    write.send(Message::Text(Outgoing::Ping.to_json(Some(id)).to_string())).await?;
                }
            }
        }
    }

    fn handle_text(
        text: &str,
        session: &mut Session,
        cache: &StateCache,
        events: &broadcast::Sender<HassEvent>,
    ) {
        let incoming = match serde_json::from_str::<Incoming>(text) {
            Ok(incoming) => incoming,
            Err(err) => {
                warn!("Unable to parse message from Home Assistant: {}", err);
                return;
            }
        };

        match incoming {
            Incoming::Result {
                id,
                success,
                result,
                error,
            } => {
                let respond = match session.pending.remove(&id) {
                    Some(respond) => respond,
                    // Subscription confirmations and pings.
                    None => {
                        if !success {
                            warn!("Command {} failed: {:?}", id, error);
                        }
                        return;
                    }
                };
                let outcome = if success {
                    Ok(result)
                } else {
                    let error = error.unwrap_or_else(|| super::message::ErrorInfo {
                        code: "unknown_error".into(),
                        message: String::new(),
                    });
                    Err(Error::Remote {
                        code: error.code,
                        message: error.message,
                    })
                };
                let _ = respond.send(outcome);
            }
            Incoming::Event { id, event } if id == session.entities_id => {
                if session.fresh_entities {
                    session.fresh_entities = false;
                    let mut entities = Entities::new();
                    apply_compressed(&mut entities, &event);
                    info!("Received {} entities", entities.len());
                    cache.replace(entities);
                } else {
                    cache.apply_compressed(&event);
                }
            }
            Incoming::Event { id, event } if id == session.events_id => {
                match serde_json::from_value::<HassEvent>(event) {
                    Ok(event) => {
                        let _ = events.send(event);
                    }
                    Err(err) => warn!("Malformed event: {}", err),
                }
            }
            Incoming::Event { id, .. } => debug!("Event for unknown subscription {}", id),
            Incoming::Pong { .. } => {}
            other => debug!("Unhandled message: {:?}", other),
        }
    }
}

#[async_trait]
impl MessageSender for Connection {
    async fn send_message(&self, message: Outgoing) -> Result<Value> {
        let (respond, response) = oneshot::channel();
        self.requests
            .send(Request { message, respond })
            .await
            .map_err(|_| Error::Disconnected)?;
        // Sender dropped means the session ended before HA answered.
        response.await.map_err(|_| Error::Disconnected)?
    }
}
