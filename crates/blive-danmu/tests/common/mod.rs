#![allow(dead_code)]

use async_trait::async_trait;
use blive_danmu::codec::{Operation, WireHeader, ver};
use blive_danmu::{
    BliveError, BroadcastItem, BroadcastSink, DanmuTransport, HostServer, Result, RoomResolver,
    RoomSession, TransportConnector,
};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn frame(version: u16, operation: Operation, body: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    WireHeader {
        packet_len: (16 + body.len()) as u32,
        header_len: 16,
        version,
        operation: operation as u32,
        sequence: 0,
    }
    .write(&mut out);
    out.put_slice(body);
    out.freeze()
}

pub fn auth_reply(code: i64) -> Bytes {
    frame(
        ver::RAW_JSON,
        Operation::AuthReply,
        format!(r#"{{"code":{code}}}"#).as_bytes(),
    )
}

pub fn command(json: &str) -> Bytes {
    frame(ver::RAW_JSON, Operation::SendMsgReply, json.as_bytes())
}

/// In-memory socket: replays a script, then stays open until closed.
pub struct ScriptedTransport {
    incoming: VecDeque<Bytes>,
    sent: Arc<Mutex<Vec<Bytes>>>,
}

#[async_trait]
impl DanmuTransport for ScriptedTransport {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Bytes>> {
        match self.incoming.pop_front() {
            Some(next) => Some(Ok(next)),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct ScriptedConnector {
    script: Vec<Bytes>,
    pub urls: Mutex<Vec<String>>,
    pub sent: Arc<Mutex<Vec<Bytes>>>,
}

impl ScriptedConnector {
    pub fn new(script: Vec<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            script,
            urls: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn sent_operations(&self) -> Vec<u32> {
        self.sent
            .lock()
            .iter()
            .filter_map(|f| WireHeader::read(f).map(|h| h.operation))
            .collect()
    }
}

#[async_trait]
impl TransportConnector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn DanmuTransport>> {
        self.urls.lock().push(url.to_string());
        Ok(Box::new(ScriptedTransport {
            incoming: self.script.iter().cloned().collect(),
            sent: self.sent.clone(),
        }))
    }
}

/// Resolver returning a fixed session, or failing when `fail` is set.
pub struct StubResolver {
    pub calls: AtomicUsize,
    pub fail: bool,
}

impl StubResolver {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }
}

pub fn fixed_session(room_id: u64) -> RoomSession {
    RoomSession {
        room_id,
        owner_uid: 7,
        uid: 0,
        buvid: "TEST-BUVIDinfoc".to_string(),
        hosts: vec![HostServer {
            host: "gateway.test".to_string(),
            wss_port: 443,
        }],
        token: "token".to_string(),
    }
}

#[async_trait]
impl RoomResolver for StubResolver {
    async fn resolve(&self, room_id: u64) -> Result<RoomSession> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BliveError::resolver("room not found"));
        }
        Ok(fixed_session(room_id))
    }
}

pub fn recording_sink() -> (Arc<Mutex<Vec<BroadcastItem>>>, Arc<dyn BroadcastSink>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    let sink: Arc<dyn BroadcastSink> = Arc::new(move |item: &BroadcastItem| {
        sink_seen.lock().push(item.clone());
    });
    (seen, sink)
}
