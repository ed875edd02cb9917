// MIT License - Copyright (c) 2026 Peter Wright
// Connection manager: login, discovery and background duties

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout, Duration, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::addr::{LcnAddr, LOCAL_SEGMENT};
use crate::config::ConnectionConfig;
use crate::constants::{BROADCAST_GROUP, BROADCAST_SEGMENT};
use crate::error::{PckError, Result};
use crate::event::EventReceiver;
use crate::module::{AddressConnection, ModuleSnapshot, SerialState};
use crate::protocol::{Command, Request};
use crate::transport::correlator::{HostExchange, RequestKey, RequestPolicy};
use crate::transport::session::{Session, SessionState};

/// A client session with one LCN-PCHK gateway.
///
/// # Example
///
/// ```no_run
/// use lcn_pck::{ConnectionConfig, LcnAddr, PckConnection};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = ConnectionConfig::builder()
///         .host("192.168.0.20")
///         .username("lcn")
///         .password("lcn")
///         .build();
///
///     let connection = PckConnection::new(config);
///     connection.connect().await?;
///
///     let module = connection.get_address_connection(LcnAddr::module(0, 7)).await?;
///     let serials = module.request_serials().await?;
///     println!("firmware {:06X}", serials.software_serial);
///
///     module.dim_output(1, 50.0, 0).await?;
///
///     connection.close().await;
///     Ok(())
/// }
/// ```
pub struct PckConnection {
    session: Arc<Session>,
}

impl PckConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            session: Session::new(config),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.session.config
    }

    /// Connect, log in and run the initial segment scan.
    ///
    /// The whole sequence is bounded by `connect_timeout`. A previous
    /// session, if any, is closed first.
    pub async fn connect(&self) -> Result<()> {
        self.session.close().await;

        match timeout(self.session.config.connect_timeout, self.establish()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.session.close().await;
                Err(e)
            }
            Err(_) => {
                warn!(
                    "Gateway did not complete login within {:?}",
                    self.session.config.connect_timeout
                );
                self.session.close().await;
                Err(PckError::ConnectionTimeout)
            }
        }
    }

    /// `connect` with exponential backoff on retryable errors.
    ///
    /// The base delay is `reconnect_delay` and the number of retries is
    /// `max_connect_retries`. Authentication and license errors are final.
    pub async fn connect_with_retry(&self) -> Result<()> {
        let max_retries = self.session.config.max_connect_retries;
        let base_delay = self.session.config.reconnect_delay;

        let mut last_error = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = base_delay * (1 << (attempt - 1).min(4));
                warn!(
                    "Connection attempt {} failed, retrying in {:.1}s...",
                    attempt,
                    delay.as_secs_f64()
                );
                sleep(delay).await;
            }

            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if !e.is_retryable() || attempt == max_retries {
                        return Err(e);
                    }
                    warn!("Connection error (attempt {}): {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(PckError::ConnectionLost))
    }

    async fn establish(&self) -> Result<()> {
        let config = &self.session.config;
        let address = config.address();
        info!("Connecting to gateway at {}", address);

        let stream = TcpStream::connect(&address).await?;
        let login = self.session.attach(stream).await;
        login.await.map_err(|_| PckError::ConnectionLost)??;

        let policy = RequestPolicy {
            retries: config.num_retries,
            timeout: config.request_timeout,
        };
        self.session
            .exchange(
                RequestKey::Host(HostExchange::DecMode),
                Command::SetDecMode.to_wire_string(),
                policy,
            )
            .await?;
        debug!("Decimal addressing enabled");

        self.session
            .send_request(Request::host(Command::SetOperationMode {
                dim_mode: config.dim_mode,
                status_mode: config.status_mode,
            }))
            .await?;

        let heartbeat = spawn_heartbeat_task(self.session.clone());
        self.session.add_task(heartbeat).await;
        if let Some(period) = config.segment_scan_interval {
            let rescan = spawn_segment_rescan_task(self.session.clone(), period);
            self.session.add_task(rescan).await;
        }

        scan_segments(
            &self.session,
            config.segment_scan_tries,
            config.segment_scan_timeout,
        )
        .await?;

        self.session.set_ready().await;
        info!(
            "Connection ready (local segment {})",
            self.session.local_seg_id().await
        );
        Ok(())
    }

    /// Close the session. Safe to call repeatedly.
    pub async fn close(&self) {
        self.session.close().await;
    }

    // --- State ---

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Wait until the session reaches `target`.
    pub async fn wait_for_state(&self, target: SessionState) -> Result<()> {
        let mut rx = self.session.watch_state();
        loop {
            if *rx.borrow_and_update() == target {
                return Ok(());
            }
            rx.changed().await.map_err(|_| PckError::ChannelClosed)?;
        }
    }

    /// Authenticated and the initial segment scan has finished.
    pub async fn is_ready(&self) -> bool {
        self.session.is_ready().await
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> EventReceiver {
        self.session.subscribe()
    }

    pub async fn local_seg_id(&self) -> u8 {
        self.session.local_seg_id().await
    }

    pub async fn segment_coupler_ids(&self) -> Vec<u8> {
        self.session.segment_coupler_ids().await
    }

    // --- Registry ---

    /// The connection for `addr`, created on first use.
    pub async fn get_address_connection(&self, addr: LcnAddr) -> Result<Arc<AddressConnection>> {
        if !addr.is_valid() {
            return Err(PckError::InvalidAddress {
                addr,
                details: "segment or address id out of range".to_string(),
            });
        }
        Ok(self.session.address_connection(addr).await)
    }

    pub async fn address_connections(&self) -> Vec<Arc<AddressConnection>> {
        self.session.address_connections().await
    }

    // --- Discovery ---

    /// Broadcast a segment coupler query `tries` times, waiting `window` after
    /// each broadcast. Every reply extends the window.
    pub async fn scan_segment_couplers(&self, tries: u32, window: Duration) -> Result<Vec<u8>> {
        scan_segments(&self.session, tries, window).await
    }

    /// Provoke acknowledgments from every module, then fetch the serials of
    /// modules not yet identified.
    pub async fn scan_modules(&self, tries: u32, window: Duration) -> Result<Vec<Arc<AddressConnection>>> {
        let mut segments = self.session.segment_coupler_ids().await;
        if segments.is_empty() {
            segments.push(LOCAL_SEGMENT);
        }

        for attempt in 1..=tries {
            trace!("Module scan {}/{} on segments {:?}", attempt, tries, segments);
            for &seg_id in &segments {
                let request = Request::addressed(LcnAddr::group(seg_id, BROADCAST_GROUP), Command::Empty)
                    .with_ack(true);
                self.session.send_request(request).await?;
            }
            wait_for_quiet(&self.session.module_reply, window).await;
        }

        let modules: Vec<_> = self
            .session
            .address_connections()
            .await
            .into_iter()
            .filter(|conn| !conn.is_group())
            .collect();

        let mut pending = JoinSet::new();
        for conn in &modules {
            if conn.serial_state().await != SerialState::Unknown {
                continue;
            }
            let conn = conn.clone();
            pending.spawn(async move {
                if let Err(e) = conn.request_serials().await {
                    debug!("No serials from {}: {}", conn.addr(), e);
                }
            });
        }
        while pending.join_next().await.is_some() {}

        info!("Module scan found {} modules", modules.len());
        Ok(modules)
    }

    /// Cached state of every module, keyed by logical segment and module id.
    pub async fn dump_modules(&self) -> serde_json::Value {
        let local = self.session.local_seg_id().await;
        let mut dump: BTreeMap<u8, BTreeMap<u8, ModuleSnapshot>> = BTreeMap::new();
        for conn in self.session.address_connections().await {
            if conn.is_group() {
                continue;
            }
            let addr = conn.addr();
            let seg_id = if addr.seg_id == LOCAL_SEGMENT {
                local
            } else {
                addr.seg_id
            };
            dump.entry(seg_id)
                .or_default()
                .insert(addr.addr_id, conn.snapshot().await);
        }
        serde_json::to_value(dump).unwrap_or_default()
    }
}

impl Drop for PckConnection {
    fn drop(&mut self) {
        self.session.abort_tasks();
    }
}

/// Wait until `notify` stays quiet for a whole `window`.
async fn wait_for_quiet(notify: &Notify, window: Duration) {
    while timeout(window, notify.notified()).await.is_ok() {}
}

async fn scan_segments(session: &Session, tries: u32, window: Duration) -> Result<Vec<u8>> {
    let request = Request::addressed(
        LcnAddr::group(BROADCAST_SEGMENT, BROADCAST_GROUP),
        Command::SegmentCouplerScan,
    )
    .with_ack(false);

    for attempt in 1..=tries {
        trace!("Segment scan {}/{}", attempt, tries);
        session.send_request(request.clone()).await?;
        wait_for_quiet(&session.segment_reply, window).await;
    }

    let ids = session.segment_coupler_ids().await;
    if ids.is_empty() {
        debug!("No segment couplers found");
    } else {
        info!("Segment couplers: {:?}", ids);
    }
    Ok(ids)
}

/// Probe an idle socket with `^ping` and drop it when nothing comes back.
fn spawn_heartbeat_task(session: Arc<Session>) -> JoinHandle<()> {
    let mut shutdown_rx = session.shutdown_signal();
    let epoch = session.epoch();
    let idle = session.config.heartbeat_interval;
    let probe = session.config.heartbeat_probe_timeout;

    tokio::spawn(async move {
        loop {
            let last = session.last_activity().await;
            let deadline = tokio::time::Instant::from_std(last + idle);
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = shutdown_rx.changed() => break,
            }
            if session.last_activity().await > last {
                continue;
            }

            let counter = session.next_ping_counter();
            debug!("Idle for {:?}, sending ping {}", idle, counter);
            let sent = Instant::now();
            if session
                .send_request(Request::host(Command::Ping { counter }))
                .await
                .is_err()
            {
                break;
            }

            tokio::select! {
                _ = sleep(probe) => {}
                _ = shutdown_rx.changed() => break,
            }
            if session.last_activity().await < sent {
                warn!("No answer to ping within {:?}, dropping connection", probe);
                session.connection_lost(epoch).await;
                break;
            }
        }
        debug!("Heartbeat stopped");
    })
}

fn spawn_segment_rescan_task(session: Arc<Session>, period: Duration) -> JoinHandle<()> {
    let mut shutdown_rx = session.shutdown_signal();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the initial scan runs at login.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => break,
            }
            let config = &session.config;
            if let Err(e) =
                scan_segments(&session, config.segment_scan_tries, config.segment_scan_timeout).await
            {
                warn!("Periodic segment scan failed: {}", e);
            }
        }
    })
}
