//! blive-danmu: client for the Bilibili live danmu gateway.
//!
//! Resolves a live room, signs the REST calls that hand out gateway hosts and
//! tokens, keeps a WebSocket subscription alive and turns the binary frames it
//! receives into typed events for pluggable handlers.
//!
//! ## Core Types
//!
//! - [`LiveSession`] - Owns one room subscription with `start`/`stop`
//! - [`DanmuClient`] - Connect, authenticate, heartbeat and receive loop
//! - [`DanmuHandler`] - Per-event reactions, all optional
//! - [`CommandDispatcher`] - Maps command types to typed parsers
//!
//! ## Protocol
//!
//! - [`codec`] - Frame header, splitting, zlib/brotli decompression
//! - [`WbiSigner`] - WBI key cache and query signing
//! - [`BilibiliRoomResolver`] - Room id, uid, buvid and gateway host lookup
//!
//! ## Output
//!
//! - [`BroadcastLimiter`] - Token-bucket queue in front of an output sink
//! - [`ForwardingHandler`] - Renders events as text lines

pub mod broadcast;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod forward;
pub mod http;
pub mod message;
pub mod room;
pub mod session;
pub mod transport;
pub mod wbi;

pub use broadcast::{
    BroadcastItem, BroadcastLimiter, BroadcastSink, Broadcaster, MsgPriority, Rgb, TokenBucket,
};
pub use client::{ClientState, DanmuClient};
pub use codec::{Command, Inbound, Operation};
pub use config::BliveConfig;
pub use dispatch::{CommandDispatcher, DanmuHandler, DispatchOutcome, RawSubscriber};
pub use error::{BliveError, Result};
pub use forward::ForwardingHandler;
pub use message::{
    Danmaku, Gift, GuardBuy, Heartbeat, InteractKind, InteractWord, LiveMessage, Medal, SuperChat,
    SuperChatDelete, UserToastV2,
};
pub use room::{BilibiliRoomResolver, HostServer, RoomResolver, RoomSession, parse_room_id};
pub use session::{LiveSession, LiveSessionBuilder, SessionInfo, StartOutcome};
pub use transport::{DanmuTransport, TransportConnector, WebSocketConnector};
pub use wbi::{WbiSigner, WbiSignerCache};
