//! Session object tying resolution, the event client and forwarding together.
//!
//! The embedding application owns one [`LiveSession`] and drives it through
//! `start`/`stop`. A single session subscribes to at most one room at a time.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broadcast::{BroadcastSink, Broadcaster};
use crate::client::{ClientState, DanmuClient};
use crate::config::BliveConfig;
use crate::dispatch::{CommandDispatcher, DanmuHandler, RawSubscriber};
use crate::error::{BliveError, Result};
use crate::forward::ForwardingHandler;
use crate::http::build_client;
use crate::room::{BilibiliRoomResolver, RoomResolver, RoomSession};
use crate::transport::{TransportConnector, WebSocketConnector};
use crate::wbi::{HttpWbiKeyFetcher, WbiKeyFetcher, WbiSignerCache};

/// Result of [`LiveSession::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(RoomSession),
    /// A subscription is already live; nothing was changed.
    AlreadyRunning,
    /// The feature is switched off in the configuration.
    Disabled,
}

/// Snapshot for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub running: bool,
    pub state: ClientState,
    pub room: Option<RoomSession>,
    pub throttled: bool,
}

struct Active {
    room: RoomSession,
    client: DanmuClient,
}

enum Phase {
    Stopped,
    Starting,
    Running(Active),
}

pub struct LiveSession {
    id: String,
    config: RwLock<BliveConfig>,
    signers: Arc<WbiSignerCache>,
    connector: Arc<dyn TransportConnector>,
    resolver: Option<Arc<dyn RoomResolver>>,
    broadcaster: Arc<Broadcaster>,
    handlers: Vec<Arc<dyn DanmuHandler>>,
    subscribers: Vec<RawSubscriber>,
    phase: Mutex<Phase>,
}

/// Builder for [`LiveSession`].
pub struct LiveSessionBuilder {
    id: String,
    config: BliveConfig,
    sink: Arc<dyn BroadcastSink>,
    signers: Option<Arc<WbiSignerCache>>,
    connector: Option<Arc<dyn TransportConnector>>,
    resolver: Option<Arc<dyn RoomResolver>>,
    handlers: Vec<Arc<dyn DanmuHandler>>,
    subscribers: Vec<RawSubscriber>,
}

impl LiveSessionBuilder {
    /// Key of this session in the signer cache.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Share a signer cache between sessions.
    pub fn signer_cache(mut self, signers: Arc<WbiSignerCache>) -> Self {
        self.signers = Some(signers);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace the web API resolver.
    pub fn resolver(mut self, resolver: Arc<dyn RoomResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn DanmuHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn subscribe(mut self, subscriber: RawSubscriber) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Build the session. Must be called inside a Tokio runtime when throttling is enabled.
    pub fn build(self) -> LiveSession {
        let broadcaster = if self.config.broadcast_throttle {
            Broadcaster::throttled(self.sink, self.config.max_broadcast_per_second)
        } else {
            Broadcaster::direct(self.sink)
        };

        LiveSession {
            id: self.id,
            config: RwLock::new(self.config),
            signers: self.signers.unwrap_or_default(),
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(WebSocketConnector::new())),
            resolver: self.resolver,
            broadcaster: Arc::new(broadcaster),
            handlers: self.handlers,
            subscribers: self.subscribers,
            phase: Mutex::new(Phase::Stopped),
        }
    }
}

impl LiveSession {
    pub fn builder(config: BliveConfig, sink: Arc<dyn BroadcastSink>) -> LiveSessionBuilder {
        LiveSessionBuilder {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            sink,
            signers: None,
            connector: None,
            resolver: None,
            handlers: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> BliveConfig {
        self.config.read().clone()
    }

    /// Replace the configuration used by the next `start`.
    pub fn set_config(&self, config: BliveConfig) {
        *self.config.write() = config;
    }

    /// Resolve `room_id` and start the subscription.
    ///
    /// A second start while live is a no-op reporting [`StartOutcome::AlreadyRunning`].
    pub async fn start(&self, room_id: u64) -> Result<StartOutcome> {
        let config = self.config();
        if !config.enabled {
            return Ok(StartOutcome::Disabled);
        }

        {
            let mut phase = self.phase.lock();
            match &*phase {
                Phase::Starting => return Ok(StartOutcome::AlreadyRunning),
                Phase::Running(active) if active.client.is_running() => {
                    return Ok(StartOutcome::AlreadyRunning);
                }
                _ => {}
            }
            // a finished client from an earlier run is dropped here
            *phase = Phase::Starting;
        }

        let room = match self.resolve(room_id, &config).await {
            Ok(room) => room,
            Err(e) => {
                warn!(room_id, "Failed to resolve room: {}", e);
                *self.phase.lock() = Phase::Stopped;
                return Err(e);
            }
        };

        let client = DanmuClient::new(self.connector.clone());
        if let Err(e) = client.start(room.clone(), self.dispatcher(&config)) {
            *self.phase.lock() = Phase::Stopped;
            return Err(e);
        }

        let orphaned = {
            let mut phase = self.phase.lock();
            if matches!(*phase, Phase::Starting) {
                *phase = Phase::Running(Active {
                    room: room.clone(),
                    client,
                });
                None
            } else {
                Some(client)
            }
        };

        if let Some(client) = orphaned {
            // stop() ran while the room was resolving
            client.stop().await;
            return Err(BliveError::other("Session was stopped while starting"));
        }

        info!(room_id = room.room_id, owner_uid = room.owner_uid, "Live session started");
        Ok(StartOutcome::Started(room))
    }

    /// Stop the subscription. Idempotent. Returns whether a client was stopped.
    pub async fn stop(&self) -> bool {
        let previous = std::mem::replace(&mut *self.phase.lock(), Phase::Stopped);
        self.signers.evict(&self.id);

        match previous {
            Phase::Running(active) => {
                active.client.stop().await;
                info!(room_id = active.room.room_id, "Live session stopped");
                true
            }
            _ => false,
        }
    }

    /// Stop and tear down the broadcast limiter.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.broadcaster.shutdown();
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.phase.lock(), Phase::Running(active) if active.client.is_running())
    }

    pub fn info(&self) -> SessionInfo {
        let phase = self.phase.lock();
        let (running, state, room) = match &*phase {
            Phase::Running(active) => (
                active.client.is_running(),
                active.client.state(),
                Some(active.room.clone()),
            ),
            Phase::Starting => (false, ClientState::Connecting, None),
            Phase::Stopped => (false, ClientState::Idle, None),
        };
        SessionInfo {
            running,
            state,
            room,
            throttled: self.broadcaster.is_throttled(),
        }
    }

    /// State transitions of the current client, if one was started.
    pub fn subscribe_state(&self) -> Option<watch::Receiver<ClientState>> {
        match &*self.phase.lock() {
            Phase::Running(active) => Some(active.client.subscribe_state()),
            _ => None,
        }
    }

    /// Apply the broadcast options of `config` without restarting the subscription.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn apply_broadcast_config(&self, config: &BliveConfig) {
        {
            let mut current = self.config.write();
            current.broadcast_throttle = config.broadcast_throttle;
            current.max_broadcast_per_second = config.max_broadcast_per_second;
        }
        self.broadcaster
            .reconfigure(config.broadcast_throttle, config.max_broadcast_per_second);
    }

    async fn resolve(&self, room_id: u64, config: &BliveConfig) -> Result<RoomSession> {
        if let Some(resolver) = &self.resolver {
            return resolver.resolve(room_id).await;
        }

        let client = build_client(config.sessdata())?;
        let signer = self.signers.get_or_create(&self.id, || {
            Arc::new(HttpWbiKeyFetcher::new(client.clone())) as Arc<dyn WbiKeyFetcher>
        });
        BilibiliRoomResolver::new(client, signer)
            .resolve(room_id)
            .await
    }

    fn dispatcher(&self, config: &BliveConfig) -> CommandDispatcher {
        let mut dispatcher = CommandDispatcher::new();
        dispatcher.add_handler(Arc::new(ForwardingHandler::new(
            config.clone(),
            self.broadcaster.clone(),
        )));
        for handler in &self.handlers {
            dispatcher.add_handler(handler.clone());
        }
        for subscriber in &self.subscribers {
            dispatcher.subscribe(subscriber.clone());
        }
        dispatcher
    }
}
