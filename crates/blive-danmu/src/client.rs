//! The gateway event client.
//!
//! One background task per subscription drives connect, authenticate and then
//! a single `select!` loop that interleaves the heartbeat timer, the socket
//! receive and the shutdown signal.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{AuthPacket, Inbound, decode, heartbeat_packet};
use crate::dispatch::{CommandDispatcher, DanmuHandler};
use crate::error::{BliveError, Result};
use crate::room::RoomSession;
use crate::transport::{DanmuTransport, TransportConnector};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long [`DanmuClient::stop`] waits for the task before aborting it.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Idle,
    Connecting,
    Authenticating,
    Streaming,
    Closed,
}

/// State shared between the client handle and its task.
struct Shared {
    state: watch::Sender<ClientState>,
    reported: AtomicBool,
    handlers: Vec<Arc<dyn DanmuHandler>>,
}

impl Shared {
    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
    }

    /// Report the disconnect to every handler, only the first time.
    fn report_stopped(&self, error: Option<&BliveError>) {
        if self.reported.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ClientState::Closed);
        for handler in &self.handlers {
            handler.on_client_stopped(error);
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    shared: Arc<Shared>,
}

/// Client for one live-room subscription.
pub struct DanmuClient {
    connector: Arc<dyn TransportConnector>,
    heartbeat_interval: Duration,
    state: watch::Sender<ClientState>,
    running: Mutex<Option<Running>>,
}

impl DanmuClient {
    pub fn new(connector: Arc<dyn TransportConnector>) -> Self {
        let (state, _) = watch::channel(ClientState::Idle);
        Self {
            connector,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            state,
            running: Mutex::new(None),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Spawn the background task for `session`.
    ///
    /// Fails with [`BliveError::AlreadyRunning`] while a previous start is still live.
    pub fn start(&self, session: RoomSession, dispatcher: CommandDispatcher) -> Result<()> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(BliveError::AlreadyRunning);
        }

        let shared = Arc::new(Shared {
            state: self.state.clone(),
            reported: AtomicBool::new(false),
            handlers: dispatcher.handlers().to_vec(),
        });
        shared.set_state(ClientState::Idle);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            session,
            self.connector.clone(),
            dispatcher,
            shared.clone(),
            cancel.clone(),
            self.heartbeat_interval,
        ));

        *running = Some(Running {
            cancel,
            task,
            shared,
        });
        Ok(())
    }

    /// Stop the subscription. Safe to call repeatedly and concurrently with a
    /// self-initiated exit; handlers hear about the disconnect exactly once.
    pub async fn stop(&self) {
        let Some(mut running) = self.running.lock().take() else {
            return;
        };

        running.cancel.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, &mut running.task)
            .await
            .is_err()
        {
            warn!("Danmu client did not stop in time, aborting");
            running.task.abort();
        }
        running.shared.report_stopped(None);
    }
}

impl Drop for DanmuClient {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

async fn run(
    session: RoomSession,
    connector: Arc<dyn TransportConnector>,
    mut dispatcher: CommandDispatcher,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    heartbeat_interval: Duration,
) {
    let room_id = session.room_id;
    let result = drive(
        &session,
        connector.as_ref(),
        &mut dispatcher,
        &shared,
        &cancel,
        heartbeat_interval,
    )
    .await;

    match &result {
        Ok(()) => info!(room_id, "Danmu client stopped"),
        Err(e) => error!(room_id, "Danmu client stopped: {}", e),
    }
    shared.report_stopped(result.err().as_ref());
}

async fn drive(
    session: &RoomSession,
    connector: &dyn TransportConnector,
    dispatcher: &mut CommandDispatcher,
    shared: &Shared,
    cancel: &CancellationToken,
    heartbeat_interval: Duration,
) -> Result<()> {
    shared.set_state(ClientState::Connecting);

    let Some(mut transport) = connect_any(session, connector, cancel).await? else {
        // cancelled while connecting
        return Ok(());
    };

    shared.set_state(ClientState::Authenticating);
    let auth = AuthPacket::new(
        session.uid,
        session.room_id,
        session.token.clone(),
        session.buvid.clone(),
    )
    .encode()?;
    debug!(room_id = session.room_id, uid = session.uid, "Sending AUTH");

    let result = match transport.send(auth).await {
        Ok(()) => {
            stream(
                transport.as_mut(),
                session.room_id,
                dispatcher,
                shared,
                cancel,
                heartbeat_interval,
            )
            .await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = transport.close().await {
        debug!("Error closing transport: {}", e);
    }
    result
}

/// Try each candidate host in order. `Ok(None)` means cancelled.
async fn connect_any(
    session: &RoomSession,
    connector: &dyn TransportConnector,
    cancel: &CancellationToken,
) -> Result<Option<Box<dyn DanmuTransport>>> {
    let mut last_error = None;

    for host in session.candidate_hosts() {
        let url = host.ws_url();
        info!(room_id = session.room_id, %url, "Connecting to danmu server");

        let attempt = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            attempt = connector.connect(&url) => attempt,
        };
        match attempt {
            Ok(transport) => return Ok(Some(transport)),
            Err(e) => {
                warn!(%url, "Connection failed: {}", e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| BliveError::connection("No danmu servers to connect to")))
}

async fn stream(
    transport: &mut dyn DanmuTransport,
    room_id: u64,
    dispatcher: &mut CommandDispatcher,
    shared: &Shared,
    cancel: &CancellationToken,
    heartbeat_interval: Duration,
) -> Result<()> {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut authenticated = false;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Shutdown requested");
                return Ok(());
            }

            _ = heartbeat.tick(), if authenticated => {
                // a stalled write must not hold up shutdown
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Shutdown requested during heartbeat");
                        return Ok(());
                    }
                    sent = transport.send(heartbeat_packet()) => sent?,
                }
                trace!("Sent heartbeat");
            }

            message = transport.recv() => {
                let Some(message) = message else {
                    info!("Connection closed by server");
                    return Ok(());
                };

                for item in decode(&message?) {
                    match item {
                        Inbound::AuthReply { code: 0 } => {
                            if !authenticated {
                                info!(room_id, "Authenticated with danmu server");
                                authenticated = true;
                                shared.set_state(ClientState::Streaming);
                                for handler in dispatcher.handlers() {
                                    handler.on_authenticated(room_id);
                                }
                                // first heartbeat goes out right away
                                heartbeat.reset_immediately();
                            }
                        }
                        Inbound::AuthReply { code } => {
                            return Err(BliveError::Authentication { code });
                        }
                        Inbound::Command(cmd) => {
                            dispatcher.dispatch(&cmd);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Operation, WireHeader, ver};
    use crate::message::Danmaku;
    use crate::room::HostServer;
    use async_trait::async_trait;
    use bytes::{BufMut, Bytes, BytesMut};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    fn frame(operation: Operation, body: &[u8]) -> Bytes {
        let mut out = BytesMut::new();
        WireHeader {
            packet_len: (16 + body.len()) as u32,
            header_len: 16,
            version: ver::RAW_JSON,
            operation: operation as u32,
            sequence: 0,
        }
        .write(&mut out);
        out.put_slice(body);
        out.freeze()
    }

    /// Replays scripted messages, then either ends the stream or stays open.
    struct ScriptedTransport {
        incoming: VecDeque<Bytes>,
        close_after_script: bool,
        stall_heartbeats: bool,
        sent: Arc<Mutex<Vec<Bytes>>>,
    }

    #[async_trait]
    impl DanmuTransport for ScriptedTransport {
        async fn send(&mut self, frame: Bytes) -> Result<()> {
            let operation = WireHeader::read(&frame).unwrap().operation;
            self.sent.lock().push(frame);
            if self.stall_heartbeats && operation == Operation::Heartbeat as u32 {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<Bytes>> {
            if let Some(next) = self.incoming.pop_front() {
                return Some(Ok(next));
            }
            if self.close_after_script {
                return None;
            }
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct ScriptedConnector {
        script: Vec<Bytes>,
        close_after_script: bool,
        failing_hosts: usize,
        stall_heartbeats: bool,
        attempts: AtomicUsize,
        sent: Arc<Mutex<Vec<Bytes>>>,
    }

    impl ScriptedConnector {
        fn new(script: Vec<Bytes>, close_after_script: bool) -> Self {
            Self {
                script,
                close_after_script,
                failing_hosts: 0,
                stall_heartbeats: false,
                attempts: AtomicUsize::new(0),
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn operations_sent(&self) -> Vec<u32> {
            self.sent
                .lock()
                .iter()
                .map(|f| WireHeader::read(f).unwrap().operation)
                .collect()
        }
    }

    #[async_trait]
    impl TransportConnector for ScriptedConnector {
        async fn connect(&self, url: &str) -> Result<Box<dyn DanmuTransport>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failing_hosts {
                return Err(BliveError::connection(format!("refused: {url}")));
            }
            Ok(Box::new(ScriptedTransport {
                incoming: self.script.iter().cloned().collect(),
                close_after_script: self.close_after_script,
                stall_heartbeats: self.stall_heartbeats,
                sent: self.sent.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct Recorder {
        danmaku: Mutex<Vec<Danmaku>>,
        stopped: Mutex<Vec<Option<String>>>,
    }

    impl DanmuHandler for Recorder {
        fn on_danmaku(&self, msg: &Danmaku) {
            self.danmaku.lock().push(msg.clone());
        }

        fn on_client_stopped(&self, error: Option<&BliveError>) {
            self.stopped.lock().push(error.map(|e| e.to_string()));
        }
    }

    fn session() -> RoomSession {
        RoomSession {
            room_id: 123,
            owner_uid: 1,
            uid: 0,
            buvid: "buvid".to_string(),
            hosts: vec![
                HostServer {
                    host: "a.example".to_string(),
                    wss_port: 443,
                },
                HostServer {
                    host: "b.example".to_string(),
                    wss_port: 443,
                },
            ],
            token: "token".to_string(),
        }
    }

    fn dispatcher_with(recorder: &Arc<Recorder>) -> CommandDispatcher {
        let mut dispatcher = CommandDispatcher::new();
        dispatcher.add_handler(recorder.clone());
        dispatcher
    }

    fn auth_ok() -> Bytes {
        frame(Operation::AuthReply, br#"{"code":0}"#)
    }

    fn danmu_frame() -> Bytes {
        frame(
            Operation::SendMsgReply,
            br#"{"cmd":"DANMU_MSG","info":[[0,1,25,16777215,0],"hello",[42,"viewer"]]}"#,
        )
    }

    async fn wait_for(rx: &mut watch::Receiver<ClientState>, target: ClientState) {
        while *rx.borrow_and_update() != target {
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_then_heartbeats() {
        let connector = Arc::new(ScriptedConnector::new(vec![auth_ok()], false));
        let recorder = Arc::new(Recorder::default());
        let client = DanmuClient::new(connector.clone());
        let mut state = client.subscribe_state();

        client.start(session(), dispatcher_with(&recorder)).unwrap();
        wait_for(&mut state, ClientState::Streaming).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        // AUTH, then the immediate heartbeat
        assert_eq!(
            connector.operations_sent(),
            vec![Operation::Auth as u32, Operation::Heartbeat as u32]
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.operations_sent().len(), 3);

        client.stop().await;
        assert_eq!(client.state(), ClientState::Closed);
        assert_eq!(*recorder.stopped.lock(), vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_stalled_heartbeat() {
        let mut connector = ScriptedConnector::new(vec![auth_ok()], false);
        connector.stall_heartbeats = true;
        let connector = Arc::new(connector);
        let recorder = Arc::new(Recorder::default());
        let client = DanmuClient::new(connector.clone());
        let mut state = client.subscribe_state();

        client.start(session(), dispatcher_with(&recorder)).unwrap();
        wait_for(&mut state, ClientState::Streaming).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(
            connector.operations_sent(),
            vec![Operation::Auth as u32, Operation::Heartbeat as u32]
        );

        let started = tokio::time::Instant::now();
        client.stop().await;

        // the paused clock only advances if stop() falls back to its timeout
        assert!(started.elapsed() < STOP_TIMEOUT);
        assert_eq!(client.state(), ClientState::Closed);
        assert_eq!(*recorder.stopped.lock(), vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_heartbeat_before_auth_reply() {
        let connector = Arc::new(ScriptedConnector::new(vec![], false));
        let client = DanmuClient::new(connector.clone());

        client
            .start(session(), CommandDispatcher::new())
            .unwrap();
        tokio::time::sleep(Duration::from_secs(95)).await;

        assert_eq!(connector.operations_sent(), vec![Operation::Auth as u32]);
        assert_eq!(client.state(), ClientState::Authenticating);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_auth_failure_stops_session() {
        let connector = Arc::new(ScriptedConnector::new(
            vec![frame(Operation::AuthReply, br#"{"code":-101}"#), danmu_frame()],
            false,
        ));
        let recorder = Arc::new(Recorder::default());
        let client = DanmuClient::new(connector);
        let mut state = client.subscribe_state();

        client.start(session(), dispatcher_with(&recorder)).unwrap();
        wait_for(&mut state, ClientState::Closed).await;

        assert!(recorder.danmaku.lock().is_empty());
        assert_eq!(
            *recorder.stopped.lock(),
            vec![Some("Authentication failed with code -101".to_string())]
        );

        // stop after a self-initiated exit does not report again
        client.stop().await;
        client.stop().await;
        assert_eq!(recorder.stopped.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatches_and_reports_peer_close() {
        let connector = Arc::new(ScriptedConnector::new(vec![auth_ok(), danmu_frame()], true));
        let recorder = Arc::new(Recorder::default());
        let client = DanmuClient::new(connector);
        let mut state = client.subscribe_state();

        client.start(session(), dispatcher_with(&recorder)).unwrap();
        wait_for(&mut state, ClientState::Closed).await;

        let danmaku = recorder.danmaku.lock();
        assert_eq!(danmaku.len(), 1);
        assert_eq!(danmaku[0].text, "hello");
        assert_eq!(danmaku[0].uid, 42);
        assert_eq!(*recorder.stopped.lock(), vec![None]);
    }

    #[tokio::test]
    async fn test_falls_back_to_next_host() {
        let mut connector = ScriptedConnector::new(vec![auth_ok()], false);
        connector.failing_hosts = 1;
        let connector = Arc::new(connector);
        let client = DanmuClient::new(connector.clone());
        let mut state = client.subscribe_state();

        client.start(session(), CommandDispatcher::new()).unwrap();
        wait_for(&mut state, ClientState::Streaming).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);

        assert!(matches!(
            client.start(session(), CommandDispatcher::new()),
            Err(BliveError::AlreadyRunning)
        ));
        client.stop().await;
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_all_hosts_failing_reports_connection_error() {
        let mut connector = ScriptedConnector::new(vec![], false);
        connector.failing_hosts = usize::MAX;
        let recorder = Arc::new(Recorder::default());
        let client = DanmuClient::new(Arc::new(connector));
        let mut state = client.subscribe_state();

        client.start(session(), dispatcher_with(&recorder)).unwrap();
        wait_for(&mut state, ClientState::Closed).await;

        let stopped = recorder.stopped.lock();
        assert_eq!(stopped.len(), 1);
        assert!(stopped[0].as_deref().unwrap().contains("b.example"));
    }
}
