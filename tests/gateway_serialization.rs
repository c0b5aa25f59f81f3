//! GPIB-over-Ethernet behaviour against a scripted gateway fixture: control
//! framing, the `*IDN?` scenario, and socket-level serialization when two
//! bus addresses share one gateway.

use labcomms::config::TimeoutSettings;
use labcomms::registry::InstrumentRegistry;
use labcomms::transport::gateway::GpibLanSession;
use labcomms::{ConnectionError, ConnectionFactory, Transport};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

fn short_timeouts() -> TimeoutSettings {
    TimeoutSettings {
        open_ms: 1000,
        write_ms: 500,
        read_ms: 500,
    }
}

/// Every complete line the gateway fixture received, in arrival order.
type WireLog = Arc<Mutex<Vec<String>>>;

/// Scripted LAN/GPIB gateway: `++addr` selects a device, `++spoll N` answers
/// with a status byte for known devices (silence otherwise), `++read eoi`
/// returns the identification of the selected device, and any other line is
/// instrument payload. A `DIE` payload drops the connection.
async fn spawn_gateway(devices: HashMap<u8, &'static str>) -> (SocketAddr, WireLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let log: WireLog = Arc::new(Mutex::new(Vec::new()));
    let log_server = log.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let devices = devices.clone();
            let log = log_server.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                let mut selected: Option<u8> = None;
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(mut guard) = log.lock() {
                        guard.push(line.clone());
                    }
                    if let Some(rest) = line.strip_prefix("++addr ") {
                        selected = rest.trim().parse().ok();
                    } else if let Some(rest) = line.strip_prefix("++spoll ") {
                        let polled: Option<u8> = rest.trim().parse().ok();
                        if polled.map(|a| devices.contains_key(&a)) == Some(true) {
                            let _ = write_half.write_all(b"16\n").await;
                        }
                        // Unknown address: the bus stays silent.
                    } else if line.trim() == "++read eoi" {
                        if let Some(ident) = selected.and_then(|a| devices.get(&a)) {
                            let _ = write_half
                                .write_all(format!("{ident}\n").as_bytes())
                                .await;
                        }
                    } else if line.trim() == "DIE" {
                        return;
                    }
                    // Other payload lines are held until ++read eoi.
                }
            });
        }
    });

    (addr, log)
}

async fn bench(devices: HashMap<u8, &'static str>) -> (ConnectionFactory, WireLog) {
    let (addr, log) = spawn_gateway(devices).await;
    let ini = format!(
        "[OSA1]\ndevice_type = osa\ngpib_address = 3\nip_address = {addr}\nterminating_char = LF\n\
         [ESA1]\ndevice_type = esa\ngpib_address = 4\nip_address = {addr}\nterminating_char = LF\n\
         [GHOST]\ngpib_address = 9\nip_address = {addr}\nterminating_char = LF\n"
    );
    let factory = ConnectionFactory::new(InstrumentRegistry::from_ini_str(&ini).expect("parses"))
        .with_timeouts(short_timeouts());
    (factory, log)
}

fn two_devices() -> HashMap<u8, &'static str> {
    HashMap::from([
        (3, "YOKOGAWA,AQ6370D,90Y403996,02.08"),
        (4, "HP,8560E,0,1.0"),
    ])
}

#[tokio::test]
async fn gpib_query_frames_with_lf_and_strips_reply() {
    let (factory, log) = bench(two_devices()).await;

    let mut session = factory.connect("OSA1").await.expect("connect OSA1");
    let ident = session.query("*IDN?").await.expect("query");
    assert_eq!(ident, "YOKOGAWA,AQ6370D,90Y403996,02.08");
    session.close().await;

    // The command went over the wire as the bytes `*IDN?\n`: the fixture's
    // LF-based line splitter recovered it as one complete line.
    let lines = log.lock().expect("log").clone();
    assert!(lines.iter().any(|l| l == "*IDN?"), "wire log: {lines:?}");
    assert!(lines.iter().any(|l| l == "++addr 3"), "wire log: {lines:?}");
}

#[tokio::test]
async fn absent_device_fails_open_with_unreachable() {
    let (factory, _log) = bench(two_devices()).await;
    let err = factory.connect("GHOST").await.err().expect("silent address");
    assert!(matches!(err, ConnectionError::Unreachable(_)), "{err}");
}

#[tokio::test]
async fn shared_gateway_serializes_concurrent_queries() {
    let (factory, log) = bench(two_devices()).await;

    let mut osa = factory.connect("OSA1").await.expect("connect OSA1");
    let mut esa = factory.connect("ESA1").await.expect("connect ESA1");

    let osa_task = tokio::spawn(async move {
        for _ in 0..8 {
            let ident = osa.query("*IDN?").await.expect("osa query");
            assert_eq!(ident, "YOKOGAWA,AQ6370D,90Y403996,02.08");
        }
        osa.close().await;
    });
    let esa_task = tokio::spawn(async move {
        for _ in 0..8 {
            let ident = esa.query("*IDN?").await.expect("esa query");
            assert_eq!(ident, "HP,8560E,0,1.0");
        }
        esa.close().await;
    });

    osa_task.await.expect("osa task");
    esa_task.await.expect("esa task");

    // No interleaved bytes on the wire: every received line is a complete,
    // well-formed control message or payload command.
    let lines = log.lock().expect("log").clone();
    for line in &lines {
        let well_formed = line == "*IDN?"
            || line == "++read eoi"
            || line == "++addr 3"
            || line == "++addr 4"
            || line == "++spoll 3"
            || line == "++spoll 4";
        assert!(well_formed, "mangled wire line: '{line}' in {lines:?}");
    }
}

#[tokio::test]
async fn gateway_sessions_expose_status_byte_and_local_mode() {
    let (factory, log) = bench(two_devices()).await;

    let mut session = factory.connect("OSA1").await.expect("connect");
    let gpib = session
        .as_any_mut()
        .downcast_mut::<GpibLanSession>()
        .expect("gateway session");

    // The fixture reports status byte 16 (MAV, message available).
    let bits = gpib.status_byte().await.expect("status byte");
    assert!(bits[4]);
    assert!(!bits[0]);

    gpib.set_local().await.expect("local mode");
    session.close().await;

    let lines = log.lock().expect("log").clone();
    assert!(lines.iter().any(|l| l == "++loc"), "wire log: {lines:?}");
}

#[tokio::test]
async fn severed_gateway_latches_the_session() {
    let (factory, _log) = bench(two_devices()).await;

    let mut session = factory.connect("OSA1").await.expect("connect");
    session.write("DIE").await.expect("write accepted");

    let err = session.read().await.expect_err("gateway hung up");
    assert!(matches!(err, ConnectionError::Disconnected), "{err}");

    // Latched: no further I/O is attempted.
    assert!(matches!(
        session.query("*IDN?").await,
        Err(ConnectionError::Disconnected)
    ));
}
