// End-to-end tests against a scripted gateway
//
// Each test binds a listener on 127.0.0.1:0, lets the client connect to it
// and plays the gateway side of the conversation line by line.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use lcn_pck::{
    BusEvent, Capabilities, ConnectionConfig, ConnectionConfigBuilder, EventReceiver, LcnAddr,
    PckConnection, PckError, SerialState, SessionState, StatusPayload,
};

const STEP: Duration = Duration::from_secs(2);

struct Gateway {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Gateway {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(STEP, listener.accept())
            .await
            .expect("client did not connect")
            .unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> String {
        tokio::time::timeout(STEP, self.lines.next_line())
            .await
            .expect("timed out waiting for client line")
            .unwrap()
            .expect("client closed the connection")
    }

    async fn expect(&mut self, expected: &str) {
        assert_eq!(self.recv().await, expected);
    }

    /// Assert the client stays silent for `window`.
    async fn expect_silence(&mut self, window: Duration) {
        if let Ok(line) = tokio::time::timeout(window, self.lines.next_line()).await {
            panic!("unexpected client line: {:?}", line);
        }
    }

    async fn authenticate(&mut self) {
        self.send("LCN-PCHK 3.3 family").await;
        self.send("Username:").await;
        self.expect("lcn").await;
        self.send("Password:").await;
        self.expect("lcn").await;
        self.send("OK").await;
    }

    /// Full login with no segment couplers on the bus.
    async fn login(&mut self) {
        self.authenticate().await;
        self.expect("!CHD").await;
        self.send("(dec-mode)").await;
        self.expect("!OM0N").await;
        self.expect(">G003003.SK").await;
    }
}

fn test_config(port: u16) -> ConnectionConfigBuilder {
    ConnectionConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .request_timeout(Duration::from_millis(200))
        .serial_timeout(Duration::from_millis(200))
        .connect_timeout(Duration::from_secs(5))
        .segment_scan_tries(1)
        .segment_scan_timeout(Duration::from_millis(100))
        .sweep_interval(Duration::from_millis(10))
}

async fn start(
    configure: impl FnOnce(ConnectionConfigBuilder) -> ConnectionConfigBuilder,
) -> (Arc<PckConnection>, EventReceiver, TcpListener, JoinHandle<Result<(), PckError>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connection = Arc::new(PckConnection::new(configure(test_config(port)).build()));
    let events = connection.subscribe();
    let connecting = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.connect().await })
    };
    (connection, events, listener, connecting)
}

async fn connected() -> (Arc<PckConnection>, EventReceiver, Gateway) {
    let (connection, events, listener, connecting) = start(|b| b).await;
    let mut gateway = Gateway::accept(&listener).await;
    gateway.login().await;
    connecting.await.unwrap().unwrap();
    (connection, events, gateway)
}

async fn next_event(events: &mut EventReceiver, wanted: impl Fn(&BusEvent) -> bool) -> BusEvent {
    loop {
        let event = tokio::time::timeout(STEP, events.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap();
        if wanted(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_login_reaches_ready() {
    let (connection, mut events, _gateway) = connected().await;

    assert_eq!(connection.state(), SessionState::Authenticated);
    assert!(connection.is_ready().await);
    assert_eq!(events.recv().await.unwrap(), BusEvent::Connected);
    assert_eq!(events.recv().await.unwrap(), BusEvent::Authenticated);
    assert_eq!(events.recv().await.unwrap(), BusEvent::Ready);
}

#[tokio::test]
async fn test_authentication_failure() {
    let (connection, _events, listener, connecting) = start(|b| b).await;
    let mut gateway = Gateway::accept(&listener).await;
    gateway.send("Username:").await;
    gateway.expect("lcn").await;
    gateway.send("Password:").await;
    gateway.expect("lcn").await;
    gateway.send("Authentification failed.").await;

    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(err, PckError::AuthenticationFailed), "{:?}", err);
    assert!(!err.is_retryable());
    assert_eq!(connection.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_repeated_prompt_is_authentication_failure() {
    let (_connection, _events, listener, connecting) = start(|b| b).await;
    let mut gateway = Gateway::accept(&listener).await;
    gateway.send("Username:").await;
    gateway.expect("lcn").await;
    gateway.send("Password:").await;
    gateway.expect("lcn").await;
    gateway.send("Username:").await;

    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(err, PckError::AuthenticationFailed), "{:?}", err);
}

#[tokio::test]
async fn test_license_error() {
    let (_connection, _events, listener, connecting) = start(|b| b).await;
    let mut gateway = Gateway::accept(&listener).await;
    gateway.authenticate().await;
    gateway.expect("!CHD").await;
    gateway.send("$err:(license?)").await;

    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(err, PckError::LicenseError), "{:?}", err);
}

#[tokio::test]
async fn test_custom_credentials_are_sent() {
    let (_connection, _events, listener, connecting) =
        start(|b| b.username("admin").password("secret")).await;
    let mut gateway = Gateway::accept(&listener).await;
    gateway.send("Username:").await;
    gateway.expect("admin").await;
    gateway.send("Password:").await;
    gateway.expect("secret").await;
    gateway.send("OK").await;
    gateway.expect("!CHD").await;
    gateway.send("(dec-mode)").await;
    gateway.expect("!OM0N").await;
    gateway.expect(">G003003.SK").await;
    connecting.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_oversized_credential_fails_login_promptly() {
    let (_connection, _events, listener, connecting) =
        start(|b| b.username("u".repeat(2000))).await;
    let mut gateway = Gateway::accept(&listener).await;
    gateway.send("Username:").await;

    let err = tokio::time::timeout(STEP, connecting)
        .await
        .expect("login hung on an unsendable credential")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, PckError::ProtocolViolation { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_sends_before_login_are_held_until_authenticated() {
    let (connection, _events, listener, connecting) = start(|b| b).await;
    let mut gateway = Gateway::accept(&listener).await;
    gateway.send("Username:").await;
    gateway.expect("lcn").await;

    let module = connection
        .get_address_connection(LcnAddr::module(0, 10))
        .await
        .unwrap();
    let toggle = tokio::spawn(async move { module.toggle_output(1, 0).await });

    gateway.expect_silence(Duration::from_millis(100)).await;
    gateway.send("Password:").await;
    gateway.expect("lcn").await;
    gateway.expect_silence(Duration::from_millis(100)).await;
    gateway.send("OK").await;

    // Login continues while the held command goes out; either may come first.
    let mut lines = vec![gateway.recv().await, gateway.recv().await];
    lines.sort();
    assert_eq!(lines, vec!["!CHD", ">M000010!A1TA000"]);

    gateway.send("(dec-mode)").await;
    gateway.expect("!OM0N").await;
    gateway.expect(">G003003.SK").await;
    gateway.send("-M000010!").await;

    toggle.await.unwrap().unwrap();
    connecting.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unsolicited_status_creates_connection() {
    let (connection, mut events, mut gateway) = connected().await;

    gateway.send(":M000010A1050").await;

    let created = next_event(&mut events, |e| {
        matches!(e, BusEvent::AddressConnectionCreated { .. })
    })
    .await;
    assert_eq!(
        created,
        BusEvent::AddressConnectionCreated {
            addr: LcnAddr::module(0, 10)
        }
    );
    let BusEvent::Status(status) =
        next_event(&mut events, |e| matches!(e, BusEvent::Status(_))).await
    else {
        unreachable!()
    };
    assert_eq!(status.addr, LcnAddr::module(0, 10));

    let module = connection
        .get_address_connection(LcnAddr::module(0, 10))
        .await
        .unwrap();
    assert_eq!(module.output_level(1).await, Some(50.0));
    assert_eq!(connection.address_connections().await.len(), 1);
}

#[tokio::test]
async fn test_get_address_connection_is_idempotent() {
    let (connection, _events, _gateway) = connected().await;
    let a = connection
        .get_address_connection(LcnAddr::module(0, 7))
        .await
        .unwrap();
    let b = connection
        .get_address_connection(LcnAddr::module(0, 7))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[tokio::test]
async fn test_request_retransmitted_then_times_out() {
    let (connection, _events, mut gateway) = connected().await;
    let module = connection
        .get_address_connection(LcnAddr::module(0, 10))
        .await
        .unwrap();

    let request = tokio::spawn(async move { module.request_relays_status().await });

    // One transmission plus two retries.
    for _ in 0..3 {
        gateway.expect(">M000010.SMR").await;
    }
    let err = request.await.unwrap().unwrap_err();
    assert!(
        matches!(err, PckError::Timeout { ref command } if command == ">M000010.SMR"),
        "{:?}",
        err
    );
    gateway.expect_silence(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_reply_resolves_request() {
    let (connection, _events, mut gateway) = connected().await;
    let module = connection
        .get_address_connection(LcnAddr::module(0, 7))
        .await
        .unwrap();

    let request = {
        let module = module.clone();
        tokio::spawn(async move { module.request_serials().await })
    };
    gateway.expect(">M000007.SN").await;
    gateway.send("=M000007.SN1AB20A123401FW190B11HW015").await;

    let serials = request.await.unwrap().unwrap();
    assert_eq!(serials.hardware_serial, 0x1AB20A1234);
    assert_eq!(serials.software_serial, 0x190B11);
    assert_eq!(serials.hardware_type, 15);
    assert_eq!(module.serial_state().await, SerialState::Known);
    assert!(!module.capabilities().await.is_empty());

    // Served from the cache.
    assert_eq!(module.request_serials().await.unwrap(), serials);
    gateway.expect_silence(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_requests_on_same_key_are_answered_in_order() {
    let (connection, _events, mut gateway) = connected().await;
    let module = connection
        .get_address_connection(LcnAddr::module(0, 10))
        .await
        .unwrap();

    let first = {
        let module = module.clone();
        tokio::spawn(async move { module.request_relays_status().await })
    };
    gateway.expect(">M000010.SMR").await;

    let second = {
        let module = module.clone();
        tokio::spawn(async move { module.request_relays_status().await })
    };
    // The second request waits for the first.
    gateway.expect_silence(Duration::from_millis(50)).await;

    gateway.send(":M000010Rx005").await;
    gateway.expect(">M000010.SMR").await;
    gateway.send(":M000010Rx006").await;

    assert_eq!(first.await.unwrap().unwrap(), 5);
    assert_eq!(second.await.unwrap().unwrap(), 6);
    assert_eq!(module.relays().await, Some(6));
}

#[tokio::test]
async fn test_concurrent_serial_requests_resolve_in_order() {
    let (connection, _events, mut gateway) = connected().await;
    let module = connection
        .get_address_connection(LcnAddr::module(0, 7))
        .await
        .unwrap();

    let first = {
        let module = module.clone();
        tokio::spawn(async move { module.request_serials().await })
    };
    gateway.expect(">M000007.SN").await;
    let second = {
        let module = module.clone();
        tokio::spawn(async move { module.request_serials().await })
    };
    gateway.expect_silence(Duration::from_millis(50)).await;

    gateway.send("=M000007.SN1AB20A123401FW170206HW015").await;
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.software_serial, 0x170206);
    assert_eq!(module.serial_state().await, SerialState::Known);
    assert_eq!(module.capabilities().await, Capabilities::TYPED_VARIABLES);

    gateway.expect(">M000007.SN").await;
    gateway.send("=M000007.SN1AB20A123401FW190B11HW015").await;
    let second = second.await.unwrap().unwrap();
    assert_eq!(second.software_serial, 0x190B11);
    assert_eq!(module.serials().await, Some(second));
}

#[tokio::test]
async fn test_unencodable_request_does_not_stall_correlation() {
    let (connection, _events, mut gateway) = connected().await;
    let module = connection
        .get_address_connection(LcnAddr::module(0, 10))
        .await
        .unwrap();

    let toggle = {
        let module = module.clone();
        tokio::spawn(async move { module.toggle_output(1, 0).await })
    };
    gateway.expect(">M000010!A1TA000").await;

    // Rejected up front instead of queuing behind the toggle on the same key.
    let err = tokio::time::timeout(STEP, module.send_raw("X".repeat(2000), true))
        .await
        .expect("oversized request hung")
        .unwrap_err();
    assert!(matches!(err, PckError::ProtocolViolation { .. }), "{:?}", err);

    gateway.send("-M000010!").await;
    toggle.await.unwrap().unwrap();
    gateway.expect_silence(Duration::from_millis(100)).await;

    // Timeouts on other keys still fire.
    let other = connection
        .get_address_connection(LcnAddr::module(0, 11))
        .await
        .unwrap();
    let request = tokio::spawn(async move { other.request_relays_status().await });
    for _ in 0..3 {
        gateway.expect(">M000011.SMR").await;
    }
    let err = tokio::time::timeout(STEP, request)
        .await
        .expect("sweep stopped expiring requests")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, PckError::Timeout { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_requests_on_different_keys_are_independent() {
    let (connection, _events, mut gateway) = connected().await;
    let a = connection
        .get_address_connection(LcnAddr::module(0, 10))
        .await
        .unwrap();
    let b = connection
        .get_address_connection(LcnAddr::module(0, 11))
        .await
        .unwrap();

    let first = tokio::spawn(async move { a.request_relays_status().await });
    gateway.expect(">M000010.SMR").await;
    let second = tokio::spawn(async move { b.request_relays_status().await });
    gateway.expect(">M000011.SMR").await;

    gateway.send(":M000011Rx002").await;
    gateway.send(":M000010Rx001").await;
    assert_eq!(first.await.unwrap().unwrap(), 1);
    assert_eq!(second.await.unwrap().unwrap(), 2);
}

#[tokio::test]
async fn test_ack_and_nack() {
    let (connection, _events, mut gateway) = connected().await;
    let module = connection
        .get_address_connection(LcnAddr::module(0, 10))
        .await
        .unwrap();

    let toggle = {
        let module = module.clone();
        tokio::spawn(async move { module.toggle_output(1, 0).await })
    };
    gateway.expect(">M000010!A1TA000").await;
    gateway.send("-M000010!").await;
    toggle.await.unwrap().unwrap();

    let toggle = tokio::spawn(async move { module.toggle_output(2, 5).await });
    gateway.expect(">M000010!A2TA005").await;
    gateway.send("-M000010005").await;
    let err = toggle.await.unwrap().unwrap_err();
    assert!(
        matches!(err, PckError::Nack { addr, code: 5 } if addr == LcnAddr::module(0, 10)),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn test_group_commands_are_fire_and_forget() {
    let (connection, _events, mut gateway) = connected().await;
    let group = connection
        .get_address_connection(LcnAddr::group(0, 9))
        .await
        .unwrap();

    group.toggle_all_outputs(0).await.unwrap();
    gateway.expect(">G000009.AU000").await;

    let err = group.request_relays_status().await.unwrap_err();
    assert!(matches!(err, PckError::InvalidAddress { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_segment_scan_adopts_local_segment() {
    let (connection, mut events, listener, connecting) =
        start(|b| b.segment_scan_tries(3)).await;
    let mut gateway = Gateway::accept(&listener).await;
    gateway.authenticate().await;
    gateway.expect("!CHD").await;
    gateway.send("(dec-mode)").await;
    gateway.expect("!OM0N").await;
    gateway.expect(">G003003.SK").await;
    gateway.send("=M000005.SK020").await;
    gateway.expect(">G003003.SK").await;
    gateway.expect(">G003003.SK").await;
    connecting.await.unwrap().unwrap();

    assert_eq!(connection.local_seg_id().await, 20);
    assert_eq!(connection.segment_coupler_ids().await, vec![20]);
    next_event(&mut events, |e| {
        *e == BusEvent::SegmentDiscovered { segment_id: 20 }
    })
    .await;

    // Local segment aliases resolve to one connection.
    let logical = connection
        .get_address_connection(LcnAddr::module(20, 5))
        .await
        .unwrap();
    let physical = connection
        .get_address_connection(LcnAddr::module(0, 5))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&logical, &physical));

    // Bus frames from segment 0 are reported on the local segment.
    gateway.send(":M000010Bx004").await;
    let BusEvent::Status(status) =
        next_event(&mut events, |e| matches!(e, BusEvent::Status(_))).await
    else {
        unreachable!()
    };
    assert_eq!(status.addr, LcnAddr::module(20, 10));
    assert_eq!(status.payload, StatusPayload::BinarySensors(4));

    // And requests to the local segment go out on physical segment 0.
    let module = connection
        .get_address_connection(LcnAddr::module(20, 10))
        .await
        .unwrap();
    let request = tokio::spawn(async move { module.request_binary_sensors_status().await });
    gateway.expect(">M000010.SMB").await;
    gateway.send(":M000010Bx008").await;
    assert_eq!(request.await.unwrap().unwrap(), 8);
}

#[tokio::test]
async fn test_module_scan() {
    let (connection, _events, mut gateway) = connected().await;

    let scan = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.scan_modules(1, Duration::from_millis(100)).await })
    };
    gateway.expect(">G000003!LEER").await;
    gateway.send("-M000007!").await;
    gateway.expect(">M000007.SN").await;
    gateway.send("=M000007.SN1AB20A123401FW190B11HW015").await;

    let modules = scan.await.unwrap().unwrap();
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].addr(), LcnAddr::module(0, 7));
    assert_eq!(modules[0].serial_state().await, SerialState::Known);

    let dump = connection.dump_modules().await;
    assert_eq!(dump["0"]["7"]["serials"]["hardware_type"], 15);
}

#[tokio::test]
async fn test_connection_lost_fails_pending_requests() {
    let (connection, mut events, mut gateway) = connected().await;
    let module = connection
        .get_address_connection(LcnAddr::module(0, 10))
        .await
        .unwrap();

    let request = {
        let module = module.clone();
        tokio::spawn(async move { module.request_relays_status().await })
    };
    gateway.expect(">M000010.SMR").await;
    drop(gateway);

    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(err, PckError::ConnectionLost), "{:?}", err);
    next_event(&mut events, |e| *e == BusEvent::Disconnected).await;
    assert_eq!(connection.state(), SessionState::Disconnected);
    assert!(!connection.is_ready().await);

    // Sends fail fast while disconnected; the registry survives.
    let err = module.toggle_output(1, 0).await.unwrap_err();
    assert!(matches!(err, PckError::ConnectionLost), "{:?}", err);
    assert_eq!(connection.address_connections().await.len(), 1);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (connection, mut events, _gateway) = connected().await;
    connection.close().await;
    connection.close().await;
    assert_eq!(connection.state(), SessionState::Disconnected);
    next_event(&mut events, |e| *e == BusEvent::Disconnected).await;
}

#[tokio::test]
async fn test_heartbeat_drops_silent_gateway() {
    let (connection, _events, listener, connecting) = start(|b| {
        b.heartbeat_interval(Duration::from_millis(300))
            .heartbeat_probe_timeout(Duration::from_millis(200))
    })
    .await;
    let mut gateway = Gateway::accept(&listener).await;
    gateway.login().await;
    connecting.await.unwrap().unwrap();

    gateway.expect("^ping0").await;
    tokio::time::timeout(
        STEP,
        connection.wait_for_state(SessionState::Disconnected),
    )
    .await
    .expect("heartbeat did not drop the connection")
    .unwrap();
}

#[tokio::test]
async fn test_answered_heartbeat_keeps_connection() {
    let (connection, _events, listener, connecting) = start(|b| {
        b.heartbeat_interval(Duration::from_millis(300))
            .heartbeat_probe_timeout(Duration::from_millis(200))
    })
    .await;
    let mut gateway = Gateway::accept(&listener).await;
    gateway.login().await;
    connecting.await.unwrap().unwrap();

    gateway.expect("^ping0").await;
    gateway.send("^ping0").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(connection.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn test_bus_connection_and_command_error_events() {
    let (_connection, mut events, mut gateway) = connected().await;

    gateway.send("$io:#LCN:disconnected").await;
    next_event(&mut events, |e| {
        *e == BusEvent::BusConnectionChanged { connected: false }
    })
    .await;

    gateway.send("(unknown command?)").await;
    let event = next_event(&mut events, |e| matches!(e, BusEvent::CommandError { .. })).await;
    assert_eq!(
        event,
        BusEvent::CommandError {
            message: "unknown command".to_string()
        }
    );
}

#[tokio::test]
async fn test_malformed_lines_are_ignored() {
    let (connection, mut events, mut gateway) = connected().await;

    gateway.send("").await;
    gateway.send("garbage").await;
    gateway.send(":M000010A9050").await;
    gateway.send(":M000010Rx001").await;

    let BusEvent::Status(status) =
        next_event(&mut events, |e| matches!(e, BusEvent::Status(_))).await
    else {
        unreachable!()
    };
    assert_eq!(status.payload, StatusPayload::Relays(1));
    assert_eq!(connection.state(), SessionState::Authenticated);
}
