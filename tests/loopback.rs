//! Full-protocol tests driving the driver against the emulator over an
//! in-memory duplex, the same wiring the original hardware bring-up used
//! with two tied-together COM ports.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use iridium9602::{IridiumCommunicator, IridiumEmulator, Signal, transport};

const WAIT: Duration = Duration::from_secs(5);
const NO_WAIT: Duration = Duration::ZERO;

/// Driver and emulator joined by a pipe, emulator already listening.
fn loopback_pair() -> (IridiumCommunicator, IridiumEmulator) {
    let (host_side, modem_side) = transport::pipe();
    let emulator = IridiumEmulator::new(modem_side);
    emulator.connect().unwrap();
    (IridiumCommunicator::new(host_side), emulator)
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    done()
}

#[test]
fn connect_completes_the_double_ping_handshake() {
    let (modem, emulator) = loopback_pair();
    let (tx, rx) = mpsc::channel();

    let mut signal = Signal::silent();
    let sink = tx.clone();
    signal.connected = Box::new(move || sink.send("connected").unwrap());
    let sink = tx.clone();
    signal.disconnected = Box::new(move || sink.send("disconnected").unwrap());
    modem.set_signal(signal);

    modem.connect().unwrap();
    assert!(modem.is_connected());
    assert!(modem.is_listening());
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "connected");

    modem.close();
    assert!(!modem.is_connected());
    assert!(!modem.is_listening());
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "disconnected");

    emulator.close();
}

#[test]
fn connect_fails_without_a_modem_answering() {
    let (host_side, _modem_side) = transport::pipe();
    let modem = IridiumCommunicator::new(host_side);
    modem.set_signal(Signal::silent());
    modem.set_connect_timeout(Duration::from_millis(100));

    assert!(modem.connect().is_err());
    assert!(!modem.is_connected());
}

#[test]
fn acquired_values_match_the_emulator_state() {
    let (modem, emulator) = loopback_pair();
    modem.set_signal(Signal::silent());
    emulator.set_signal_quality(4);
    modem.connect().unwrap();

    let quality = modem.acquire_signal_quality(WAIT, WAIT).unwrap();
    assert_eq!(quality, 4);

    let sn = modem.acquire_serial_number(WAIT, WAIT).unwrap();
    assert_eq!(sn, emulator.serial_number().to_string());
    // The engine caches the IMEI after the first successful parse.
    assert_eq!(modem.serial_number(), sn);

    let time = modem.acquire_system_time(WAIT, WAIT).unwrap();
    assert!(time > 0);

    let (tri, sri) = modem.acquire_ring(WAIT, WAIT).unwrap();
    assert_eq!((tri, sri), (0, 0));

    modem.close();
    emulator.close();
}

#[test]
fn send_message_transfers_and_reports_the_msn() {
    let (modem, emulator) = loopback_pair();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    emulator.set_mobile_originated_handler(move |content| {
        sink.lock().unwrap().push(content.to_vec());
    });

    let (tx, rx) = mpsc::channel();
    let mut signal = Signal::silent();
    signal.message_transferred = Box::new(move |msn| {
        let _ = tx.send(msn);
    });
    modem.set_signal(signal);
    modem.connect().unwrap();

    modem.wait_for_command(WAIT, WAIT, || {
        modem.send_message(b"ping").unwrap();
    });
    assert!(modem.pending_command().is_none());
    assert!(wait_until(WAIT, || !received.lock().unwrap().is_empty()));
    assert_eq!(*received.lock().unwrap(), vec![b"ping".to_vec()]);

    // Let the write-binary status line drain as idle noise before the
    // session claims the wire.
    thread::sleep(Duration::from_millis(100));

    modem.wait_for_command(WAIT, NO_WAIT, || {
        modem.initiate_session().unwrap();
    });
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 0);

    modem.close();
    emulator.close();
}

#[test]
fn ring_alert_delivers_the_queued_message() {
    let (modem, emulator) = loopback_pair();
    let (tx, rx) = mpsc::channel();

    let mut signal = Signal::silent();
    signal.message_received = Box::new(move |content| {
        let _ = tx.send(content.to_vec());
    });
    modem.set_signal(signal);
    modem.connect().unwrap();

    // The ring alert alone must drive session, clear and read-binary.
    emulator.send_message(b"hello there").unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), b"hello there");
    assert_eq!(emulator.queued_message_count(), 0);

    modem.close();
    emulator.close();
}

#[test]
fn acquire_message_returns_one_payload() {
    let (modem, emulator) = loopback_pair();
    modem.set_signal(Signal::silent());
    modem.connect().unwrap();

    emulator.send_message(b"ping").unwrap();
    let msg = modem.acquire_message(WAIT, WAIT).unwrap();
    assert_eq!(msg, b"ping");

    modem.close();
    emulator.close();
}

#[test]
fn binary_payloads_with_line_breaks_survive_the_trip() {
    let (modem, emulator) = loopback_pair();
    let (tx, rx) = mpsc::channel();

    let mut signal = Signal::silent();
    signal.message_received = Box::new(move |content| {
        let _ = tx.send(content.to_vec());
    });
    modem.set_signal(signal);
    modem.connect().unwrap();

    // Content embedding OK, \r and \n exercises the deferred framing path.
    let tricky = b"a\r\nOK\r\nb\x00c";
    emulator.send_message(tricky).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), tricky);

    modem.close();
    emulator.close();
}

#[test]
fn no_bytes_flow_after_close() {
    let (modem, emulator) = loopback_pair();
    modem.set_signal(Signal::silent());
    modem.connect().unwrap();
    modem.close();

    assert!(!modem.is_connected());
    assert!(modem.ping().is_err());
    assert!(modem.send_message(b"late").is_err());
    // The emulator never hears another command.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(emulator.queued_message_count(), 0);

    emulator.close();
}
