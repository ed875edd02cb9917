// MIT License - Copyright (c) 2026 Peter Wright
// Shared session context: socket, login state machine, registry and dispatch

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::addr::{LcnAddr, LOCAL_SEGMENT};
use crate::config::ConnectionConfig;
use crate::error::{PckError, Result};
use crate::event::{event_channel, BusEvent, EventReceiver, EventSender, StatusEvent};
use crate::frame::{classify, AuthPrompt, Frame, HostNotice, NackReason, StatusPayload};
use crate::module::AddressConnection;
use crate::protocol::{Request, ResponseKind, Target};
use crate::transport::codec::LineCodec;
use crate::transport::correlator::{Correlator, HostExchange, RequestKey, RequestPolicy, Response};

/// Lifecycle of one gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Socket open, waiting for the first prompt
    Connecting,
    /// Answered the given prompt, waiting for the next step
    Authenticating(AuthPrompt),
    Authenticated,
}

/// State shared by the connection manager, its background tasks and every
/// address connection.
pub(crate) struct Session {
    pub(crate) config: ConnectionConfig,
    state_tx: watch::Sender<SessionState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    encoder: LineCodec,
    correlator: Mutex<Correlator>,
    /// Keyed by canonical physical address
    registry: Mutex<HashMap<LcnAddr, Arc<AddressConnection>>>,
    local_seg_id: RwLock<u8>,
    segment_coupler_ids: RwLock<BTreeSet<u8>>,
    ready: RwLock<bool>,
    last_activity: Mutex<Instant>,
    login_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
    /// Signalled on every segment coupler reply
    pub(crate) segment_reply: Notify,
    /// Signalled on every module ack or serial reply
    pub(crate) module_reply: Notify,
    ping_counter: AtomicU32,
    epoch: AtomicU64,
    event_tx: EventSender,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub(crate) fn new(config: ConnectionConfig) -> Arc<Self> {
        let (event_tx, _) = event_channel(config.event_capacity);
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(true);
        Arc::new(Self {
            encoder: LineCodec::new(config.max_line_length),
            config,
            state_tx,
            writer: Mutex::new(None),
            correlator: Mutex::new(Correlator::new()),
            registry: Mutex::new(HashMap::new()),
            local_seg_id: RwLock::new(LOCAL_SEGMENT),
            segment_coupler_ids: RwLock::new(BTreeSet::new()),
            ready: RwLock::new(false),
            last_activity: Mutex::new(Instant::now()),
            login_tx: Mutex::new(None),
            segment_reply: Notify::new(),
            module_reply: Notify::new(),
            ping_counter: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            event_tx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    // --- State ---

    pub(crate) fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        let old = self.state_tx.send_replace(state);
        if old != state {
            debug!("Session state {:?} -> {:?}", old, state);
        }
    }

    pub(crate) fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: BusEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    pub(crate) async fn set_ready(&self) {
        *self.ready.write().await = true;
        self.emit(BusEvent::Ready);
    }

    pub(crate) async fn last_activity(&self) -> Instant {
        *self.last_activity.lock().await
    }

    pub(crate) fn next_ping_counter(&self) -> u32 {
        self.ping_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn local_seg_id(&self) -> u8 {
        *self.local_seg_id.read().await
    }

    pub(crate) async fn segment_coupler_ids(&self) -> Vec<u8> {
        self.segment_coupler_ids.read().await.iter().copied().collect()
    }

    /// Wait until outgoing application traffic is permitted.
    async fn wait_authenticated(&self) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                SessionState::Authenticated => return Ok(()),
                SessionState::Disconnected => return Err(PckError::ConnectionLost),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(PckError::ConnectionLost);
            }
        }
    }

    // --- Lifecycle ---

    /// Take ownership of a freshly connected socket and start the reader and
    /// sweep tasks. The returned receiver completes when login succeeds or fails.
    pub(crate) async fn attach(self: &Arc<Self>, stream: TcpStream) -> oneshot::Receiver<Result<()>> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle: {}", e);
        }
        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        *self.last_activity.lock().await = Instant::now();

        let (login_tx, login_rx) = oneshot::channel();
        *self.login_tx.lock().await = Some(login_tx);

        self.shutdown_tx.send_replace(false);
        self.set_state(SessionState::Connecting);

        let reader_handle = self.spawn_reader_task(reader, epoch);
        let sweep_handle = self.spawn_sweep_task();
        self.add_task(reader_handle).await;
        self.add_task(sweep_handle).await;

        self.emit(BusEvent::Connected);
        login_rx
    }

    pub(crate) async fn add_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().await.push(handle);
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Synchronous best-effort stop of all background tasks, for `Drop`.
    pub(crate) fn abort_tasks(&self) {
        self.shutdown_tx.send_replace(true);
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Tear down the current session. Idempotent.
    pub(crate) async fn close(&self) {
        self.teardown().await;
    }

    /// The socket of session `epoch` died.
    pub(crate) async fn connection_lost(&self, epoch: u64) {
        if self.epoch() != epoch {
            return;
        }
        self.teardown().await;
    }

    async fn teardown(&self) {
        let was = self.state();
        self.shutdown_tx.send_replace(true);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }

        self.correlator
            .lock()
            .await
            .fail_all(|| PckError::ConnectionLost);
        if let Some(tx) = self.login_tx.lock().await.take() {
            let _ = tx.send(Err(PckError::ConnectionLost));
        }
        *self.ready.write().await = false;

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        self.set_state(SessionState::Disconnected);
        if was != SessionState::Disconnected {
            info!("Disconnected from gateway");
            self.emit(BusEvent::Disconnected);
        }

        // The caller may be one of these tasks; nothing below awaits.
        for task in tasks {
            task.abort();
        }
    }

    // --- Writing ---

    pub(crate) async fn write_line(&self, line: &str) -> Result<()> {
        self.write(line, false).await
    }

    async fn write_secret(&self, line: &str) -> Result<()> {
        self.write(line, true).await
    }

    /// All socket writes go through here, one line at a time.
    async fn write(&self, line: &str, redacted: bool) -> Result<()> {
        let bytes = self.encoder.encode(line)?;
        let result = {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(PckError::ConnectionLost);
            };
            trace!("-> {}", if redacted { "***" } else { line });
            writer.write_all(&bytes).await
        };
        if let Err(e) = result {
            error!("Failed to write to gateway: {}", e);
            self.teardown().await;
            return Err(PckError::ConnectionLost);
        }
        Ok(())
    }

    /// Send a request, correlating it with its reply when one is expected.
    /// Waits while login is still in progress.
    pub(crate) async fn send_request(&self, request: Request) -> Result<Response> {
        self.wait_authenticated().await?;
        let local = self.local_seg_id().await;
        let line = request.render(local);

        match (request.target, request.expected_response()) {
            (Target::Address(addr), Some(kind)) => {
                let key = RequestKey::Address {
                    addr: addr.canonical(local),
                    kind,
                };
                let policy = RequestPolicy {
                    retries: request.retries.unwrap_or(self.config.num_retries),
                    timeout: request.timeout.unwrap_or(self.config.request_timeout),
                };
                self.exchange(key, line, policy).await
            }
            _ => {
                self.write_line(&line).await?;
                Ok(Response::Sent)
            }
        }
    }

    /// Register a correlated exchange and wait for its outcome.
    pub(crate) async fn exchange(
        &self,
        key: RequestKey,
        line: String,
        policy: RequestPolicy,
    ) -> Result<Response> {
        // A line that cannot be framed must never occupy a key.
        self.encoder.encode(&line)?;
        let (handle, transmit) = self
            .correlator
            .lock()
            .await
            .register(key, line, policy, Instant::now());
        self.transmit_head(key, transmit).await;
        handle.response().await
    }

    /// Transmit the line of a newly promoted head. A head whose line cannot
    /// be written fails with that error and the next waiter is promoted.
    async fn transmit_head(&self, key: RequestKey, mut next: Option<String>) {
        while let Some(line) = next.take() {
            if let Err(e) = self.write_line(&line).await {
                debug!("Could not transmit {}: {}", line, e);
                next = self
                    .correlator
                    .lock()
                    .await
                    .fail(&key, e, Instant::now())
                    .next;
            }
        }
    }

    /// Complete the oldest request for `key` and transmit its successor.
    async fn settle(&self, key: RequestKey, result: Result<Response>) -> bool {
        let settled = {
            let mut correlator = self.correlator.lock().await;
            match result {
                Ok(value) => correlator.resolve(&key, value, Instant::now()),
                Err(e) => correlator.fail(&key, e, Instant::now()),
            }
        };
        self.transmit_head(key, settled.next).await;
        settled.delivered
    }

    // --- Registry ---

    /// Idempotent get-or-create.
    pub(crate) async fn address_connection(self: &Arc<Self>, addr: LcnAddr) -> Arc<AddressConnection> {
        let local = self.local_seg_id.read().await;
        let key = addr.canonical(*local);
        let mut registry = self.registry.lock().await;
        if let Some(conn) = registry.get(&key) {
            return conn.clone();
        }
        let conn = Arc::new(AddressConnection::new(
            addr,
            Arc::downgrade(self),
            self.config.event_capacity,
        ));
        registry.insert(key, conn.clone());
        drop(registry);
        drop(local);

        debug!("Created address connection for {}", addr);
        self.emit(BusEvent::AddressConnectionCreated { addr });
        conn
    }

    pub(crate) async fn address_connections(&self) -> Vec<Arc<AddressConnection>> {
        let mut conns: Vec<_> = self.registry.lock().await.values().cloned().collect();
        conns.sort_by_key(|conn| conn.addr());
        conns
    }

    /// Adopt the segment id reported for the local segment and re-key the
    /// registry accordingly.
    async fn set_local_seg_id(&self, seg_id: u8) {
        let mut local = self.local_seg_id.write().await;
        if *local == seg_id {
            return;
        }
        info!("Local segment id is {}", seg_id);
        *local = seg_id;

        let mut registry = self.registry.lock().await;
        let conns: Vec<_> = registry.drain().map(|(_, conn)| conn).collect();
        for conn in conns {
            let key = conn.addr().canonical(seg_id);
            if registry.contains_key(&key) {
                warn!("{} aliases an existing address connection, dropping it", conn.addr());
                continue;
            }
            registry.insert(key, conn);
        }
    }

    // --- Reading ---

    fn spawn_reader_task(self: &Arc<Self>, mut reader: OwnedReadHalf, epoch: u64) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            let mut codec = LineCodec::new(session.config.max_line_length);
            let mut buf = vec![0u8; 4096];

            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        debug!("Reader: connection closed by gateway");
                        break;
                    }
                    Ok(n) => {
                        for decoded in codec.feed(&buf[..n]) {
                            match decoded {
                                Ok(line) => session.dispatch(&line).await,
                                Err(e) => warn!("Discarding input: {}", e),
                            }
                        }
                    }
                    Err(e) => {
                        error!("Reader: read error: {}", e);
                        break;
                    }
                }
            }
            session.connection_lost(epoch).await;
        })
    }

    /// Expire overdue requests on a fixed cadence, independent of traffic.
    fn spawn_sweep_task(self: &Arc<Self>) -> JoinHandle<()> {
        let session = self.clone();
        let mut shutdown_rx = self.shutdown_signal();
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                let lines = session.correlator.lock().await.sweep(Instant::now());
                // Only the shutdown signal stops the sweep.
                for line in lines {
                    if let Err(e) = session.write_line(&line).await {
                        debug!("Could not retransmit {}: {}", line, e);
                    }
                }
            }
        })
    }

    /// Route one inbound line.
    async fn dispatch(self: &Arc<Self>, line: &str) {
        *self.last_activity.lock().await = Instant::now();
        trace!("<- {}", line);

        match classify(line) {
            Frame::AuthPrompt(prompt) => self.on_auth_prompt(prompt).await,
            Frame::Ack { addr: None } => self.on_auth_ok().await,
            Frame::Nack { addr: None, reason } => self.on_host_nack(reason).await,
            Frame::Ack { addr: Some(addr) } => {
                let (logical, key_addr) = self.resolve_source(addr).await;
                self.address_connection(logical).await;
                let key = RequestKey::Address {
                    addr: key_addr,
                    kind: ResponseKind::Ack,
                };
                if !self.settle(key, Ok(Response::Ack)).await {
                    trace!("Unsolicited ack from {}", logical);
                }
                self.module_reply.notify_one();
            }
            Frame::Nack {
                addr: Some(addr),
                reason,
            } => {
                let (logical, key_addr) = self.resolve_source(addr).await;
                let code = match reason {
                    NackReason::Module(code) => code,
                    _ => 0,
                };
                warn!("{} rejected a command (code {})", logical, code);
                let key = RequestKey::Address {
                    addr: key_addr,
                    kind: ResponseKind::Ack,
                };
                self.settle(key, Err(PckError::Nack { addr: logical, code }))
                    .await;
            }
            Frame::Status {
                addr,
                payload: StatusPayload::SegmentCoupler { segment_id },
            } => self.on_segment_coupler(addr, segment_id).await,
            Frame::Status { addr, payload } => self.on_status(addr, payload).await,
            Frame::Host(notice) => self.on_host_notice(notice).await,
            Frame::Unknown { raw } => debug!("Ignoring unrecognised line: {}", raw),
        }
    }

    /// Logical source address and correlation key address of a bus frame.
    async fn resolve_source(&self, physical: LcnAddr) -> (LcnAddr, LcnAddr) {
        let local = self.local_seg_id().await;
        let logical = physical.from_physical(local);
        (logical, logical.canonical(local))
    }

    async fn on_auth_prompt(&self, prompt: AuthPrompt) {
        let state = self.state();
        match (prompt, state) {
            (AuthPrompt::Username, SessionState::Connecting) => {
                self.set_state(SessionState::Authenticating(AuthPrompt::Username));
                if let Err(e) = self.write_line(&self.config.username).await {
                    self.finish_login(Err(e)).await;
                }
            }
            (
                AuthPrompt::Password,
                SessionState::Connecting | SessionState::Authenticating(AuthPrompt::Username),
            ) => {
                self.set_state(SessionState::Authenticating(AuthPrompt::Password));
                if let Err(e) = self.write_secret(&self.config.password).await {
                    self.finish_login(Err(e)).await;
                }
            }
            (_, SessionState::Authenticating(_)) => {
                warn!("Gateway repeated the {:?} prompt", prompt);
                self.finish_login(Err(PckError::AuthenticationFailed)).await;
            }
            _ => warn!("Unexpected {:?} prompt in state {:?}", prompt, state),
        }
    }

    async fn on_auth_ok(&self) {
        if self.state() != SessionState::Authenticating(AuthPrompt::Password) {
            debug!("Ignoring OK in state {:?}", self.state());
            return;
        }
        info!("Authenticated at gateway");
        self.set_state(SessionState::Authenticated);
        self.emit(BusEvent::Authenticated);
        self.finish_login(Ok(())).await;
    }

    async fn finish_login(&self, result: Result<()>) {
        if let Err(ref e) = result {
            warn!("Login failed: {}", e);
        }
        if let Some(tx) = self.login_tx.lock().await.take() {
            let _ = tx.send(result);
        }
    }

    async fn on_host_nack(&self, reason: NackReason) {
        match reason {
            NackReason::AuthenticationRejected => {
                self.finish_login(Err(PckError::AuthenticationFailed)).await;
            }
            NackReason::LicenseError => {
                error!("Gateway reported a license error");
                self.finish_login(Err(PckError::LicenseError)).await;
                let key = RequestKey::Host(HostExchange::DecMode);
                self.settle(key, Err(PckError::LicenseError)).await;
            }
            NackReason::CommandError(message) => {
                debug!("Gateway command error: {}", message);
                self.emit(BusEvent::CommandError { message });
            }
            NackReason::Module(code) => debug!("Ignoring unaddressed nack {}", code),
        }
    }

    async fn on_host_notice(&self, notice: HostNotice) {
        match notice {
            HostNotice::BusConnection(connected) => {
                if connected {
                    info!("Gateway is connected to the bus");
                } else {
                    warn!("Gateway lost its bus connection");
                }
                self.emit(BusEvent::BusConnectionChanged { connected });
            }
            HostNotice::DecModeSet => {
                let key = RequestKey::Host(HostExchange::DecMode);
                self.settle(key, Ok(Response::Host(notice))).await;
            }
            HostNotice::Pong => trace!("Ping answered"),
        }
    }

    async fn on_segment_coupler(self: &Arc<Self>, physical: LcnAddr, segment_id: u8) {
        if physical.seg_id == LOCAL_SEGMENT {
            self.set_local_seg_id(segment_id).await;
        }
        let discovered = self.segment_coupler_ids.write().await.insert(segment_id);
        if discovered {
            info!("Found segment {}", segment_id);
            self.emit(BusEvent::SegmentDiscovered { segment_id });
            let (logical, _) = self.resolve_source(physical).await;
            self.address_connection(logical).await;
        }
        self.segment_reply.notify_one();
    }

    async fn on_status(self: &Arc<Self>, physical: LcnAddr, payload: StatusPayload) {
        let (logical, key_addr) = self.resolve_source(physical).await;
        let conn = self.address_connection(logical).await;
        let kind = ResponseKind::of(&payload);
        let event = StatusEvent {
            addr: logical,
            payload,
        };

        // Cached state is updated before any waiting request resolves.
        conn.apply_status(event.clone()).await;
        self.emit(BusEvent::Status(event.clone()));

        if let Some(kind) = kind {
            let key = RequestKey::Address {
                addr: key_addr,
                kind,
            };
            self.settle(key, Ok(Response::Status(event.payload))).await;
            if kind == ResponseKind::Serials {
                self.module_reply.notify_one();
            }
        }
    }
}
