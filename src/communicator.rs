//! The driver state machine for the 9602.
//!
//! A dedicated listener thread owns all reads and all protocol state
//! transitions: it appends incoming bytes to the read buffer and, per tick,
//! either resolves the single pending command or handles unsolicited
//! traffic. Commands scheduled by response handlers (clear-buffer after a
//! session, read-binary after an MT arrival) go through the sequential
//! write queue and are transmitted only once the pending register is empty,
//! so at most one command is ever outstanding.
//!
//! A ring alert that arrives while a command is pending stays in the read
//! buffer and is picked up on the first idle tick after the command
//! terminator is consumed.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::codec::{self, SessionStatus, find};
use crate::command;
use crate::config::{self, Options};
use crate::signal::{Severity, Signal};
use crate::transport::SerialLink;
use crate::{Error, IridiumResult};

/// Tick granularity of the busy-wait helpers and the listener loop.
const POLL: Duration = Duration::from_millis(1);

const PORT_CLOSED: &str = "The port is closed!";

/// A value collected by [`IridiumCommunicator::acquire_response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    SystemTime(u64),
    SerialNumber(String),
    SignalQuality(u8),
    CheckRing(u16, u16),
    /// Raw response slice of a command with no dedicated parser.
    Raw(Vec<u8>),
}

/// A sink callback to fire once the engine lock has been released.
enum Event {
    SystemTime(u64),
    SerialNumber(String),
    SignalQuality(u8),
    CheckRing(u16, u16),
    MessageReceived(Vec<u8>),
    MessageReceiveFailed(usize, Vec<u8>, [u8; 2], [u8; 2]),
    MessageTransferred(u16),
    MessageTransferFailed(u16),
    Notification(Severity, &'static str, String),
    CommandFinished(Vec<u8>, bool, Vec<u8>),
}

/// Protocol state owned by the listener tick path.
#[derive(Debug)]
struct Engine {
    read_buf: BytesMut,
    /// The single outstanding command, if any.
    pending: Option<Vec<u8>>,
    /// Commands scheduled to run after the current one completes.
    sequential_queue: VecDeque<Vec<u8>>,
    /// MO payloads awaiting their `READY` handshake.
    binary_queue: VecDeque<Vec<u8>>,
    options: Options,
    serial_number: String,
    last_mt_queued: u16,
    mt_retry: u8,
    read_timeout: Duration,
    connect_timeout: Duration,
}

impl Engine {
    fn new(options: Options) -> Self {
        Self {
            read_buf: BytesMut::new(),
            pending: None,
            sequential_queue: VecDeque::new(),
            binary_queue: VecDeque::new(),
            options,
            serial_number: String::new(),
            last_mt_queued: 0,
            mt_retry: 0,
            read_timeout: config::DEFAULT_READ_TIMEOUT,
            connect_timeout: config::DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Appends to a bounded queue, dropping the oldest entry when full.
fn push_bounded(queue: &mut VecDeque<Vec<u8>>, item: Vec<u8>) {
    if queue.len() >= config::QUEUE_CAPACITY {
        queue.pop_front();
    }
    queue.push_back(item);
}

#[derive(Debug)]
struct Shared {
    link: Mutex<Option<Arc<dyn SerialLink>>>,
    engine: Mutex<Engine>,
    signal: Mutex<Signal>,
    listening: AtomicBool,
    connected: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Backstop for handles dropped without close(); the listener holds
        // only a weak reference and exits on its next tick.
        self.listening.store(false, Ordering::SeqCst);
    }
}

/// Communicates with an Iridium 9602 modem over a byte duplex.
///
/// Cloning yields another handle to the same engine. Prefer the `queue_*`
/// methods for writes; a bare `request_*` call must not overlap another
/// outstanding command, which callers ensure with [`wait_for_command`] or
/// the blocking `acquire_*` helpers.
///
/// [`wait_for_command`]: IridiumCommunicator::wait_for_command
#[derive(Debug, Clone)]
pub struct IridiumCommunicator {
    shared: Arc<Shared>,
}

impl IridiumCommunicator {
    /// Creates a driver bound to `link` with default options and a default
    /// (logging) sink.
    pub fn new(link: impl SerialLink + 'static) -> Self {
        Self::with_options(link, Options::modem_defaults())
    }

    /// Creates a driver bound to `link` with explicit options.
    pub fn with_options(link: impl SerialLink + 'static, options: Options) -> Self {
        Self {
            shared: Arc::new(Shared {
                link: Mutex::new(Some(Arc::new(link))),
                engine: Mutex::new(Engine::new(options)),
                signal: Mutex::new(Signal::default()),
                listening: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Opens the named serial port at 19200 8-N-1 and binds a driver to it.
    ///
    /// The port is opened here but the modem handshake only runs in
    /// [`connect`](IridiumCommunicator::connect).
    #[cfg(feature = "serial")]
    pub fn open(path: &str) -> IridiumResult<Self> {
        let port = crate::transport::open(path, config::DEFAULT_READ_TIMEOUT)?;
        Ok(Self::new(port))
    }

    /// Replaces the whole callback sink.
    pub fn set_signal(&self, signal: Signal) {
        *self.shared.signal.lock().unwrap() = signal;
    }

    /// Returns the value of a runtime option. Unknown names read as `false`.
    pub fn get_option(&self, name: &str) -> bool {
        self.shared.engine.lock().unwrap().options.get(name)
    }

    /// Sets a runtime option. Options that shape the connect handshake must
    /// be set before connecting.
    pub fn set_option(&self, name: &str, value: bool) {
        self.shared.engine.lock().unwrap().options.set(name, value);
    }

    /// The serial number cached by the last successful IMEI request.
    pub fn serial_number(&self) -> String {
        self.shared.engine.lock().unwrap().serial_number.clone()
    }

    /// Alias for [`serial_number`](IridiumCommunicator::serial_number).
    pub fn imei(&self) -> String {
        self.serial_number()
    }

    /// The listener readline timeout.
    pub fn timeout(&self) -> Duration {
        self.shared.engine.lock().unwrap().read_timeout
    }

    /// Sets the listener readline timeout. A larger value has a higher
    /// chance of catching a response in one read but slows every idle tick.
    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.engine.lock().unwrap().read_timeout = timeout;
    }

    /// The per-step deadline used while configuring and pinging in
    /// [`connect`](IridiumCommunicator::connect).
    pub fn connect_timeout(&self) -> Duration {
        self.shared.engine.lock().unwrap().connect_timeout
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.shared.engine.lock().unwrap().connect_timeout = timeout;
    }

    /// Returns the outstanding command, if one is awaiting its terminator.
    pub fn pending_command(&self) -> Option<Vec<u8>> {
        self.shared.engine.lock().unwrap().pending.clone()
    }

    /// Whether the underlying port is open.
    pub fn is_port_connected(&self) -> bool {
        self.shared.link.lock().unwrap().is_some()
    }

    /// Whether the connect handshake completed and the port is still open.
    pub fn is_connected(&self) -> bool {
        self.is_port_connected() && self.shared.connected.load(Ordering::SeqCst)
    }

    /// Whether a listener is actively pumping bytes.
    pub fn is_listening(&self) -> bool {
        self.shared.listening.load(Ordering::SeqCst)
    }

    // ======= Lifecycle =======

    /// Connects to the modem: opens the listener, configures echo, flow
    /// control and ring alerts, then verifies the link with two pings.
    pub fn connect(&self) -> IridiumResult<()> {
        self.fire(|sig| (sig.connecting)());

        if !self.is_port_connected() {
            return Err(Error::Connect(
                "The serial port would not open!".to_string(),
            ));
        }

        if !self.is_listening() {
            self.start_thread()?;
        }

        if !self.configure_connection_options() {
            return Err(Error::Connect(
                "Could not configure the port options!".to_string(),
            ));
        }

        // Double-ping handshake.
        let connect_timeout = self.connect_timeout();
        for _ in 0..2 {
            self.wait_for_command(connect_timeout, Duration::ZERO, || {
                let _ = self.ping();
            });
            if self.pending_command().is_some() {
                self.close();
                return Err(Error::Connect(
                    "The ping did not find a response!".to_string(),
                ));
            }
        }

        self.shared.connected.store(true, Ordering::SeqCst);
        self.fire(|sig| (sig.connected)());
        Ok(())
    }

    /// Marks the link connected without configuring or pinging. Used by log
    /// replay and tests that drive [`check_io`](IridiumCommunicator::check_io)
    /// directly.
    pub fn silent_connect(&self) -> IridiumResult<()> {
        self.fire(|sig| (sig.connecting)());
        if !self.is_port_connected() {
            return Err(Error::Connect(
                "The serial port would not open!".to_string(),
            ));
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        self.fire(|sig| (sig.connected)());
        Ok(())
    }

    /// Tears the connection down: stops the listener, closes the port and
    /// fires the lifecycle callbacks. Every step is best-effort.
    pub fn close(&self) {
        self.fire(|sig| (sig.disconnecting)());
        self.stop_listening();
        *self.shared.link.lock().unwrap() = None;
        self.shared.connected.store(false, Ordering::SeqCst);
        self.fire(|sig| (sig.disconnected)());
    }

    fn configure_connection_options(&self) -> bool {
        let timeout = self.connect_timeout();

        self.wait_for_command(timeout, Duration::ZERO, || {
            let _ = self.set_echo(self.get_option("echo"));
        });
        if self.pending_command().is_some() {
            return false;
        }

        self.wait_for_command(timeout, Duration::ZERO, || {
            let _ = self.set_flow_control(self.get_option("flow_control"));
        });
        if self.pending_command().is_some() {
            return false;
        }

        self.wait_for_command(timeout, Duration::ZERO, || {
            let _ = self.set_ring_alerts(self.get_option("ring_alerts"));
        });
        self.pending_command().is_none()
    }

    // ======= Listener =======

    /// Runs the listener loop on the calling thread until
    /// [`stop_listening`](IridiumCommunicator::stop_listening).
    ///
    /// Fails if a listener is already running; two listeners would corrupt
    /// the read buffer.
    pub fn listen(&self) -> IridiumResult<()> {
        if self.shared.listening.swap(true, Ordering::SeqCst) {
            return Err(Error::Config(
                "There is already a thread listening!".to_string(),
            ));
        }
        while self.is_listening() {
            if self.is_port_connected() {
                let data = self.read_serial();
                self.check_io(&data);
            }
            thread::sleep(POLL);
        }
        Ok(())
    }

    /// Spawns the background listener thread if none is running.
    pub fn start_thread(&self) -> IridiumResult<()> {
        let mut guard = self.shared.listener.lock().unwrap();
        if self.is_listening() || guard.is_some() {
            return Ok(());
        }
        self.notify(
            Severity::Warning,
            "No threads are listening for responses. A thread will be created",
            String::new(),
        );

        self.shared.listening.store(true, Ordering::SeqCst);
        let weak = Arc::downgrade(&self.shared);
        let spawned = thread::Builder::new()
            .name("iridium-listener".to_string())
            .spawn(move || {
                // Holding only a weak reference lets the engine drop (and
                // the loop end) when the last user handle goes away.
                while let Some(shared) = weak.upgrade() {
                    let comm = IridiumCommunicator { shared };
                    if !comm.is_listening() {
                        break;
                    }
                    if comm.is_port_connected() {
                        let data = comm.read_serial();
                        comm.check_io(&data);
                    }
                    drop(comm);
                    thread::sleep(POLL);
                }
            });
        match spawned {
            Ok(handle) => {
                *guard = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.listening.store(false, Ordering::SeqCst);
                Err(Error::Io(err))
            }
        }
    }

    /// Stops the listener and joins its thread unless called from the
    /// listener itself.
    pub fn stop_listening(&self) {
        self.shared.listening.store(false, Ordering::SeqCst);
        let handle = self.shared.listener.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn read_serial(&self) -> Vec<u8> {
        let link = self.shared.link.lock().unwrap().clone();
        let Some(link) = link else {
            return Vec::new();
        };
        match link.read_line(self.timeout()) {
            Ok(data) => data,
            Err(err) => {
                self.notify(
                    Severity::Error,
                    "Error when reading from the serial port! The connection will be closed!",
                    err.to_string(),
                );
                self.close();
                Vec::new()
            }
        }
    }

    fn write_serial(&self, data: &[u8]) {
        let link = self.shared.link.lock().unwrap().clone();
        let Some(link) = link else {
            self.notify(Severity::Error, "Serial port not connected", PORT_CLOSED.to_string());
            return;
        };
        trace!(bytes = data.len(), "serial write");
        if let Err(err) = link.write(data) {
            self.notify(
                Severity::Error,
                "Error when writing to the serial port! The connection will be closed!",
                err.to_string(),
            );
            self.close();
        }
    }

    // ======= Engine tick =======

    /// Feeds raw bytes to the engine and runs one tick.
    ///
    /// Called by the listener on every read; public so replay harnesses and
    /// tests can drive the engine without a port. An empty slice still runs
    /// the tick, which is how queued commands drain while the wire is idle.
    pub fn check_io(&self, incoming: &[u8]) {
        let mut events = Vec::new();
        let mut outgoing = Vec::new();
        {
            let mut eng = self.shared.engine.lock().unwrap();
            if !incoming.is_empty() {
                eng.read_buf.extend_from_slice(incoming);
            }
            if eng.pending.is_some() {
                self.check_pending(&mut eng, &mut events, &mut outgoing);
            } else {
                self.check_unsolicited(&mut eng, &mut outgoing);
            }
        }
        for frame in outgoing {
            self.write_serial(&frame);
        }
        self.dispatch(events);
    }

    fn check_pending(&self, eng: &mut Engine, events: &mut Vec<Event>, out: &mut Vec<Vec<u8>>) {
        let Some(pending) = eng.pending.clone() else {
            return;
        };

        if let Some(idx) = find(&eng.read_buf, command::OK) {
            let mut data = eng.read_buf[..idx].to_vec();
            eng.read_buf.advance(idx + command::OK.len());
            let mut success = true;

            if pending == command::SYSTEM_TIME {
                match codec::parse_system_time(&data) {
                    Ok(time) => events.push(Event::SystemTime(time)),
                    Err(err) => {
                        events.push(Event::Notification(
                            Severity::Error,
                            "Could not parse the system time response",
                            err.to_string(),
                        ));
                        success = false;
                    }
                }
            } else if pending == command::SERIAL_NUMBER {
                match codec::parse_serial_number(&data) {
                    Ok(sn) => {
                        eng.serial_number = sn.clone();
                        events.push(Event::SerialNumber(sn));
                    }
                    Err(err) => {
                        events.push(Event::Notification(
                            Severity::Error,
                            "Could not parse the serial number response",
                            err.to_string(),
                        ));
                        success = false;
                    }
                }
            } else if pending == command::SIGNAL_QUALITY {
                match codec::parse_signal_quality(&data) {
                    Ok(sig) => events.push(Event::SignalQuality(sig)),
                    Err(err) => {
                        events.push(Event::Notification(
                            Severity::Error,
                            "Could not parse the signal quality response",
                            err.to_string(),
                        ));
                        success = false;
                    }
                }
            } else if pending == command::CHECK_RING {
                match codec::parse_check_ring(&data) {
                    Ok((tri, sri)) => {
                        events.push(Event::CheckRing(tri, sri));
                        if sri > 0
                            && !eng.options.get("telephone")
                            && eng.options.get("auto_read")
                        {
                            push_bounded(&mut eng.sequential_queue, command::SESSION.to_vec());
                        }
                    }
                    Err(err) => {
                        events.push(Event::Notification(
                            Severity::Error,
                            "Could not parse the check ring response",
                            err.to_string(),
                        ));
                        success = false;
                    }
                }
            } else if pending == command::SESSION {
                match codec::parse_session(&data) {
                    Ok(status) => self.handle_session(eng, status, events),
                    Err(err) => {
                        events.push(Event::Notification(
                            Severity::Error,
                            "Could not parse the session response",
                            err.to_string(),
                        ));
                        success = false;
                    }
                }
            } else if pending == command::READ_BINARY {
                // OK may appear inside binary content, so keep consuming
                // OK-terminated chunks until the announced length holds.
                while !codec::has_read_binary_data(&data) {
                    match find(&eng.read_buf, command::OK) {
                        Some(next) => {
                            data.extend_from_slice(command::OK);
                            data.extend_from_slice(&eng.read_buf[..next]);
                            eng.read_buf.advance(next + command::OK.len());
                        }
                        None => {
                            // The frame is split across reads. Put everything
                            // back and wait for more bytes.
                            let mut rebuilt =
                                BytesMut::with_capacity(data.len() + 2 + eng.read_buf.len());
                            rebuilt.extend_from_slice(&data);
                            rebuilt.extend_from_slice(command::OK);
                            rebuilt.extend_from_slice(&eng.read_buf);
                            eng.read_buf = rebuilt;
                            return;
                        }
                    }
                }

                match codec::parse_read_binary(&data) {
                    Ok(msg) => {
                        if msg.is_valid() {
                            events.push(Event::MessageReceived(msg.content));
                        } else {
                            events.push(Event::MessageReceiveFailed(
                                msg.msg_len,
                                msg.content,
                                msg.checksum,
                                msg.computed,
                            ));
                        }
                    }
                    Err(err) => {
                        events.push(Event::Notification(
                            Severity::Error,
                            "Could not parse the read binary data",
                            err.to_string(),
                        ));
                        success = false;
                    }
                }
            } else if pending.starts_with(command::WRITE_BINARY) {
                match codec::parse_write_binary(&data) {
                    Ok(ok) => success = ok,
                    Err(err) => {
                        events.push(Event::Notification(
                            Severity::Error,
                            "Could not parse the write binary response",
                            err.to_string(),
                        ));
                        success = false;
                    }
                }
            } else if pending.starts_with(command::CLEAR_BUFFER) {
                success = clear_buffer_ok(&data);
            }

            events.push(Event::CommandFinished(pending, success, data));
            eng.pending = None;
        } else if let Some(idx) = find(&eng.read_buf, command::READY) {
            // READY inside a binary frame belongs to the payload, not to us.
            if pending == command::READ_BINARY {
                return;
            }
            let data = eng.read_buf[..idx].to_vec();
            eng.read_buf.advance(idx + command::READY.len());

            if pending.starts_with(command::WRITE_BINARY) {
                if let Some(payload) = eng.binary_queue.pop_front() {
                    let check = codec::checksum(&payload);
                    let mut frame = payload;
                    frame.extend_from_slice(&check);
                    out.push(frame);
                }
            }

            events.push(Event::CommandFinished(pending, true, data));
            eng.pending = None;
        }
    }

    fn handle_session(&self, eng: &mut Engine, status: SessionStatus, events: &mut Vec<Event>) {
        let mut mt_queued = status.mt_queued;

        if status.mo_ok() {
            push_bounded(&mut eng.sequential_queue, command::CLEAR_MO_BUFFER.to_vec());
            events.push(Event::MessageTransferred(status.mo_msn));
        } else {
            events.push(Event::Notification(
                Severity::Error,
                "Message Transfer Failed!",
                command::mo_status_text(status.mo_status).to_string(),
            ));
            events.push(Event::MessageTransferFailed(status.mo_msn));
        }

        if status.mt_status == 1 && status.mt_length > 0 {
            eng.last_mt_queued = status.mt_queued;
            eng.mt_retry = 0;
            push_bounded(&mut eng.sequential_queue, command::READ_BINARY.to_vec());
        } else if status.mt_status > 1 {
            events.push(Event::Notification(
                Severity::Error,
                "Message Receive Failed!",
                command::mt_status_text(status.mt_status).to_string(),
            ));

            // The gateway sometimes reports an empty queue right after a
            // failed mailbox check. Retry against the last known depth.
            if status.mt_queued == 0 && eng.last_mt_queued > 1 && eng.mt_retry < 2 {
                thread::sleep(config::MT_RETRY_DELAY);
                mt_queued = eng.last_mt_queued;
                eng.mt_retry += 1;
            }
        }

        if mt_queued > 0 && eng.options.get("auto_read") {
            push_bounded(&mut eng.sequential_queue, command::SESSION.to_vec());
        }
    }

    fn check_unsolicited(&self, eng: &mut Engine, out: &mut Vec<Vec<u8>>) {
        if let Some(idx) = find(&eng.read_buf, command::RING) {
            eng.read_buf.advance(idx + command::RING.len());
            debug!("ring alert received");
            if !eng.sequential_queue.iter().any(|c| c == command::SESSION) {
                push_bounded(&mut eng.sequential_queue, command::SESSION.to_vec());
            }
        } else if let Some(cmd) = eng.sequential_queue.pop_front() {
            trace!(command = ?String::from_utf8_lossy(&cmd), "sending queued command");
            eng.pending = Some(cmd.clone());
            // Whatever comes next on the wire belongs to this command.
            eng.read_buf.clear();
            let mut frame = cmd;
            frame.push(b'\r');
            out.push(frame);
        } else if let Some(nl) = eng.read_buf.iter().rposition(|&b| b == b'\n') {
            // Idle with no marker in sight. Keep only the tail after the
            // last newline so line noise cannot grow the buffer forever.
            eng.read_buf.advance(nl + 1);
        }
    }

    fn dispatch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut sig = self.shared.signal.lock().unwrap();
        for event in events {
            match event {
                Event::SystemTime(time) => (sig.system_time_updated)(time),
                Event::SerialNumber(sn) => (sig.serial_number_updated)(&sn),
                Event::SignalQuality(quality) => (sig.signal_quality_updated)(quality),
                Event::CheckRing(tri, sri) => (sig.check_ring_updated)(tri, sri),
                Event::MessageReceived(content) => (sig.message_received)(&content),
                Event::MessageReceiveFailed(len, content, checksum, computed) => {
                    (sig.message_receive_failed)(len, &content, checksum, computed)
                }
                Event::MessageTransferred(msn) => (sig.message_transferred)(msn),
                Event::MessageTransferFailed(msn) => (sig.message_transfer_failed)(msn),
                Event::Notification(severity, message, detail) => {
                    (sig.notification)(severity, message, &detail)
                }
                Event::CommandFinished(cmd, ok, data) => (sig.command_finished)(&cmd, ok, &data),
            }
        }
    }

    fn fire(&self, f: impl FnOnce(&mut Signal)) {
        let mut sig = self.shared.signal.lock().unwrap();
        f(&mut sig);
    }

    fn notify(&self, severity: Severity, message: &str, detail: String) {
        let mut sig = self.shared.signal.lock().unwrap();
        (sig.notification)(severity, message, &detail);
    }

    // ======= Requests =======

    /// Marks `cmd` pending. A still-outstanding command is reported finished
    /// and unsuccessful first.
    fn set_pending(&self, cmd: &[u8]) {
        let mut events = Vec::new();
        {
            let mut eng = self.shared.engine.lock().unwrap();
            if let Some(old) = eng.pending.take() {
                events.push(Event::CommandFinished(old, false, Vec::new()));
            }
            eng.pending = Some(cmd.to_vec());
        }
        self.dispatch(events);
    }

    fn send_command(&self, cmd: &[u8]) -> IridiumResult<()> {
        if !self.is_port_connected() {
            self.notify(
                Severity::Error,
                "Serial port not connected",
                PORT_CLOSED.to_string(),
            );
            return Err(Error::NotConnected);
        }
        self.set_pending(cmd);
        let mut frame = cmd.to_vec();
        frame.push(b'\r');
        self.write_serial(&frame);
        Ok(())
    }

    /// Schedules `cmd` on the sequential queue; the listener transmits it
    /// once no command is pending. Safe to call from sink callbacks.
    pub fn queue_command(&self, cmd: &[u8]) {
        let mut eng = self.shared.engine.lock().unwrap();
        push_bounded(&mut eng.sequential_queue, cmd.to_vec());
    }

    /// Sends a bare `AT` ping.
    pub fn ping(&self) -> IridiumResult<()> {
        self.send_command(command::PING)
    }

    /// Sends the echo configuration command and records the option.
    pub fn set_echo(&self, value: bool) -> IridiumResult<()> {
        if !self.is_port_connected() {
            self.notify(
                Severity::Error,
                "Serial port not connected",
                PORT_CLOSED.to_string(),
            );
            return Err(Error::NotConnected);
        }
        self.set_option("echo", value);
        self.send_command(if value {
            command::ECHO_ON
        } else {
            command::ECHO_OFF
        })
    }

    /// Sends the hardware flow control configuration command and records the
    /// option.
    pub fn set_flow_control(&self, value: bool) -> IridiumResult<()> {
        if !self.is_port_connected() {
            self.notify(
                Severity::Error,
                "Serial port not connected",
                PORT_CLOSED.to_string(),
            );
            return Err(Error::NotConnected);
        }
        self.set_option("flow_control", value);
        self.send_command(if value {
            command::FLOW_CONTROL_ON
        } else {
            command::FLOW_CONTROL_OFF
        })
    }

    /// Sends the SBD ring alert configuration command and records the
    /// option.
    pub fn set_ring_alerts(&self, value: bool) -> IridiumResult<()> {
        if !self.is_port_connected() {
            self.notify(
                Severity::Error,
                "Serial port not connected",
                PORT_CLOSED.to_string(),
            );
            return Err(Error::NotConnected);
        }
        self.set_option("ring_alerts", value);
        self.send_command(if value {
            command::RING_ALERTS_ON
        } else {
            command::RING_ALERTS_OFF
        })
    }

    pub fn request_system_time(&self) -> IridiumResult<()> {
        self.send_command(command::SYSTEM_TIME)
    }

    pub fn queue_system_time(&self) {
        self.queue_command(command::SYSTEM_TIME);
    }

    pub fn request_serial_number(&self) -> IridiumResult<()> {
        self.send_command(command::SERIAL_NUMBER)
    }

    pub fn queue_serial_number(&self) {
        self.queue_command(command::SERIAL_NUMBER);
    }

    /// Requests the signal strength, 0 through 5 bars. Sessions are unlikely
    /// to succeed below 2.
    pub fn request_signal_quality(&self) -> IridiumResult<()> {
        self.send_command(command::SIGNAL_QUALITY)
    }

    pub fn queue_signal_quality(&self) {
        self.queue_command(command::SIGNAL_QUALITY);
    }

    /// Asks the modem whether a ring alert fired. An SBD indication above
    /// zero schedules a session when `auto_read` is on.
    pub fn check_ring(&self) -> IridiumResult<()> {
        self.send_command(command::CHECK_RING)
    }

    pub fn queue_check_ring(&self) {
        self.queue_command(command::CHECK_RING);
    }

    pub fn clear_mo_buffer(&self) -> IridiumResult<()> {
        self.send_command(command::CLEAR_MO_BUFFER)
    }

    pub fn queue_clear_mo_buffer(&self) {
        self.queue_command(command::CLEAR_MO_BUFFER);
    }

    pub fn clear_mt_buffer(&self) -> IridiumResult<()> {
        self.send_command(command::CLEAR_MT_BUFFER)
    }

    pub fn queue_clear_mt_buffer(&self) {
        self.queue_command(command::CLEAR_MT_BUFFER);
    }

    pub fn clear_both_buffers(&self) -> IridiumResult<()> {
        self.send_command(command::CLEAR_BOTH_BUFFERS)
    }

    pub fn queue_clear_both_buffers(&self) {
        self.queue_command(command::CLEAR_BOTH_BUFFERS);
    }

    /// Starts an SBD session: transmits any MO buffer and retrieves one MT
    /// message if available.
    pub fn initiate_session(&self) -> IridiumResult<()> {
        self.send_command(command::SESSION)
    }

    pub fn queue_session(&self) {
        self.queue_command(command::SESSION);
    }

    /// Checks the mailbox by running a session.
    pub fn check_message(&self) -> IridiumResult<()> {
        self.initiate_session()
    }

    /// Requests the queued MT message as a binary frame.
    pub fn read_binary_message(&self) -> IridiumResult<()> {
        self.send_command(command::READ_BINARY)
    }

    pub fn queue_read_binary_message(&self) {
        self.queue_command(command::READ_BINARY);
    }

    /// Sends an MO payload of up to 340 bytes. The payload is held until the
    /// modem answers `READY`, then transmitted with its checksum.
    pub fn send_message(&self, message: &[u8]) -> IridiumResult<()> {
        let cmd = self.stage_message(message)?;
        self.set_pending(&cmd);
        let mut frame = cmd;
        frame.push(b'\r');
        self.write_serial(&frame);
        Ok(())
    }

    /// Queue variant of [`send_message`](IridiumCommunicator::send_message).
    pub fn queue_send_message(&self, message: &[u8]) -> IridiumResult<()> {
        let cmd = self.stage_message(message)?;
        self.queue_command(&cmd);
        Ok(())
    }

    fn stage_message(&self, message: &[u8]) -> IridiumResult<Vec<u8>> {
        if !self.is_port_connected() {
            self.notify(
                Severity::Error,
                "Serial port not connected",
                PORT_CLOSED.to_string(),
            );
            return Err(Error::NotConnected);
        }
        if message.len() > config::MAX_MO_LEN {
            return Err(Error::InvalidParams(format!(
                "Message length must be no more than {} bytes.",
                config::MAX_MO_LEN
            )));
        }
        {
            let mut eng = self.shared.engine.lock().unwrap();
            push_bounded(&mut eng.binary_queue, message.to_vec());
        }
        let mut cmd = command::WRITE_BINARY.to_vec();
        cmd.extend_from_slice(message.len().to_string().as_bytes());
        Ok(cmd)
    }

    // ======= Waiters =======

    fn queued_len(&self) -> usize {
        self.shared.engine.lock().unwrap().sequential_queue.len()
    }

    /// Runs `body` inside a command window: waits up to `wait_for_previous`
    /// for the previous command and the sequential queue to drain, runs
    /// `body` (which typically writes one command), then waits up to
    /// `wait_time` for that command to finish.
    ///
    /// A timeout is not an error; detect it by observing
    /// [`pending_command`](IridiumCommunicator::pending_command) returning
    /// `Some` afterwards.
    pub fn wait_for_command<R>(
        &self,
        wait_time: Duration,
        wait_for_previous: Duration,
        body: impl FnOnce() -> R,
    ) -> R {
        let start = Instant::now();
        while (self.pending_command().is_some() || self.queued_len() > 0)
            && start.elapsed() < wait_for_previous
        {
            thread::sleep(POLL);
        }

        let result = body();

        let start = Instant::now();
        while self.pending_command().is_some() && start.elapsed() < wait_time {
            thread::sleep(POLL);
        }
        result
    }

    /// Sends `cmd` and blocks until its response value has been collected.
    ///
    /// The updater callbacks are substituted with collectors for the
    /// duration and restored afterwards; `command_finished` keeps firing to
    /// the original sink. Returns the last collected value or
    /// [`Error::NoResponse`] on deadline.
    pub fn acquire_response(
        &self,
        cmd: &[u8],
        wait_time: Duration,
        wait_for_previous: Duration,
    ) -> IridiumResult<Response> {
        let values: Arc<Mutex<Vec<Response>>> = Arc::default();

        type FinishedFn = Box<dyn FnMut(&[u8], bool, &[u8]) + Send>;
        let saved_finished: Arc<Mutex<FinishedFn>>;
        let saved_time;
        let saved_serial;
        let saved_quality;
        let saved_ring;
        {
            let mut sig = self.shared.signal.lock().unwrap();

            let sink = Arc::clone(&values);
            saved_time = mem::replace(
                &mut sig.system_time_updated,
                Box::new(move |time| sink.lock().unwrap().push(Response::SystemTime(time))),
            );
            let sink = Arc::clone(&values);
            saved_serial = mem::replace(
                &mut sig.serial_number_updated,
                Box::new(move |sn| {
                    sink.lock()
                        .unwrap()
                        .push(Response::SerialNumber(sn.to_string()))
                }),
            );
            let sink = Arc::clone(&values);
            saved_quality = mem::replace(
                &mut sig.signal_quality_updated,
                Box::new(move |quality| {
                    sink.lock().unwrap().push(Response::SignalQuality(quality))
                }),
            );
            let sink = Arc::clone(&values);
            saved_ring = mem::replace(
                &mut sig.check_ring_updated,
                Box::new(move |tri, sri| sink.lock().unwrap().push(Response::CheckRing(tri, sri))),
            );

            // command_finished keeps forwarding to the original sink while
            // also catching commands without a dedicated updater.
            saved_finished = Arc::new(Mutex::new(mem::replace(
                &mut sig.command_finished,
                Box::new(|_, _, _| {}),
            )));
            let sink = Arc::clone(&values);
            let forward = Arc::clone(&saved_finished);
            let target = cmd.to_vec();
            sig.command_finished = Box::new(move |finished, ok, content| {
                if ok && finished == target.as_slice() {
                    let mut collected = sink.lock().unwrap();
                    if collected.is_empty() {
                        collected.push(Response::Raw(content.to_vec()));
                    }
                }
                let mut original = forward.lock().unwrap();
                (*original)(finished, ok, content);
            });
        }

        self.wait_for_command(wait_time, wait_for_previous, || {
            self.set_pending(cmd);
            let mut frame = cmd.to_vec();
            frame.push(b'\r');
            self.write_serial(&frame);
        });

        {
            let mut sig = self.shared.signal.lock().unwrap();
            sig.system_time_updated = saved_time;
            sig.serial_number_updated = saved_serial;
            sig.signal_quality_updated = saved_quality;
            sig.check_ring_updated = saved_ring;
            // Dropping the collector releases its clone of the original,
            // which can then be moved back into place.
            sig.command_finished = Box::new(|_, _, _| {});
            sig.command_finished = match Arc::try_unwrap(saved_finished) {
                Ok(original) => original.into_inner().unwrap(),
                Err(_) => Box::new(|_, _, _| {}),
            };
        }

        let last = values.lock().unwrap().pop();
        last.ok_or(Error::NoResponse)
    }

    /// Blocking request for the network system time.
    pub fn acquire_system_time(
        &self,
        wait_time: Duration,
        wait_for_previous: Duration,
    ) -> IridiumResult<u64> {
        match self.acquire_response(command::SYSTEM_TIME, wait_time, wait_for_previous)? {
            Response::SystemTime(time) => Ok(time),
            _ => Err(Error::NoResponse),
        }
    }

    /// Blocking request for the modem IMEI.
    pub fn acquire_serial_number(
        &self,
        wait_time: Duration,
        wait_for_previous: Duration,
    ) -> IridiumResult<String> {
        match self.acquire_response(command::SERIAL_NUMBER, wait_time, wait_for_previous)? {
            Response::SerialNumber(sn) => Ok(sn),
            _ => Err(Error::NoResponse),
        }
    }

    /// Blocking request for the signal quality.
    pub fn acquire_signal_quality(
        &self,
        wait_time: Duration,
        wait_for_previous: Duration,
    ) -> IridiumResult<u8> {
        match self.acquire_response(command::SIGNAL_QUALITY, wait_time, wait_for_previous)? {
            Response::SignalQuality(quality) => Ok(quality),
            _ => Err(Error::NoResponse),
        }
    }

    /// Blocking request for the telephony and SBD ring indicators.
    pub fn acquire_ring(
        &self,
        wait_time: Duration,
        wait_for_previous: Duration,
    ) -> IridiumResult<(u16, u16)> {
        match self.acquire_response(command::CHECK_RING, wait_time, wait_for_previous)? {
            Response::CheckRing(tri, sri) => Ok((tri, sri)),
            _ => Err(Error::NoResponse),
        }
    }

    /// Runs a session and blocks until one MT message has been read,
    /// returning its content.
    ///
    /// `auto_read` is turned off for the duration so only a single message
    /// is retrieved. Content that fails its checksum is still returned; hook
    /// `message_receive_failed` to tell the cases apart.
    pub fn acquire_message(
        &self,
        wait_time: Duration,
        wait_for_previous: Duration,
    ) -> IridiumResult<Vec<u8>> {
        let values: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
        let old_auto_read = self.get_option("auto_read");
        self.set_option("auto_read", false);

        let saved_received;
        let saved_failed;
        {
            let mut sig = self.shared.signal.lock().unwrap();
            let sink = Arc::clone(&values);
            saved_received = mem::replace(
                &mut sig.message_received,
                Box::new(move |content| sink.lock().unwrap().push(content.to_vec())),
            );
            let sink = Arc::clone(&values);
            saved_failed = mem::replace(
                &mut sig.message_receive_failed,
                Box::new(move |_, content, _, _| sink.lock().unwrap().push(content.to_vec())),
            );
        }

        let start = Instant::now();
        while (self.pending_command().is_some() || self.queued_len() > 0)
            && start.elapsed() < wait_for_previous
        {
            thread::sleep(POLL);
        }

        self.set_pending(command::SESSION);
        let mut frame = command::SESSION.to_vec();
        frame.push(b'\r');
        self.write_serial(&frame);

        // The nested clear-buffer and read-binary commands must drain too.
        let start = Instant::now();
        while (self.pending_command().is_some() || self.queued_len() > 0)
            && start.elapsed() < wait_time
        {
            thread::sleep(POLL);
        }

        {
            let mut sig = self.shared.signal.lock().unwrap();
            sig.message_received = saved_received;
            sig.message_receive_failed = saved_failed;
        }
        self.set_option("auto_read", old_auto_read);

        let last = values.lock().unwrap().pop();
        last.ok_or(Error::NoResponse)
    }

    // ======= Test hooks =======

    #[cfg(test)]
    pub(crate) fn sequential_queue_snapshot(&self) -> Vec<Vec<u8>> {
        self.shared
            .engine
            .lock()
            .unwrap()
            .sequential_queue
            .iter()
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn clear_sequential_queue(&self) {
        self.shared.engine.lock().unwrap().sequential_queue.clear();
    }

    #[cfg(test)]
    pub(crate) fn read_buf_snapshot(&self) -> Vec<u8> {
        self.shared.engine.lock().unwrap().read_buf.to_vec()
    }

    #[cfg(test)]
    pub(crate) fn mt_retry_count(&self) -> u8 {
        self.shared.engine.lock().unwrap().mt_retry
    }
}

/// The data for a clear-buffer command should strip to `0` once any echoed
/// clear command is removed.
fn clear_buffer_ok(data: &[u8]) -> bool {
    let mut resp = data.to_vec();
    for echo in [
        command::CLEAR_MO_BUFFER,
        command::CLEAR_MT_BUFFER,
        command::CLEAR_BOTH_BUFFERS,
    ] {
        while let Some(idx) = find(&resp, echo) {
            resp.drain(idx..idx + echo.len());
        }
    }
    resp.trim_ascii() == b"0"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{PipeLink, pipe};
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    /// Driver on one end of a pipe, with the far end kept for inspection.
    fn pipe_communicator() -> (IridiumCommunicator, PipeLink) {
        let (host, modem) = pipe();
        (IridiumCommunicator::new(host), modem)
    }

    #[test]
    fn session_schedules_clear_read_and_follow_up() {
        let (comm, _modem) = pipe_communicator();
        let (tx, rx) = mpsc::channel();

        let mut signal = Signal::silent();
        signal.message_transferred = Box::new(move |msn| tx.send(msn).unwrap());
        comm.set_signal(signal);

        comm.initiate_session().unwrap();
        comm.check_io(b"+SBDIX: 1, 42, 1, 7, 5, 2\r\n\r\nOK\r\n");

        assert_eq!(rx.try_recv().unwrap(), 42);
        assert!(comm.pending_command().is_none());
        assert_eq!(
            comm.sequential_queue_snapshot(),
            vec![
                command::CLEAR_MO_BUFFER.to_vec(),
                command::READ_BINARY.to_vec(),
                command::SESSION.to_vec(),
            ],
        );
    }

    #[test]
    fn failed_transfer_reports_mo_status_text() {
        let (comm, _modem) = pipe_communicator();
        let (tx, rx) = mpsc::channel();
        let (notice_tx, notice_rx) = mpsc::channel();

        let mut signal = Signal::silent();
        signal.message_transfer_failed = Box::new(move |msn| tx.send(msn).unwrap());
        signal.notification = Box::new(move |severity, _, detail| {
            notice_tx.send((severity, detail.to_string())).unwrap();
        });
        comm.set_signal(signal);

        comm.initiate_session().unwrap();
        comm.check_io(b"+SBDIX: 18, 9, 0, 0, 0, 0\r\n\r\nOK\r\n");

        assert_eq!(rx.try_recv().unwrap(), 9);
        let (severity, detail) = notice_rx.try_recv().unwrap();
        assert_eq!(severity, Severity::Error);
        assert_eq!(detail, "Connection lost (RF drop).");
        // No clear-buffer follow-up for a failed transfer.
        assert!(comm.sequential_queue_snapshot().is_empty());
    }

    #[test]
    fn binary_message_with_valid_checksum_is_received() {
        let (comm, _modem) = pipe_communicator();
        let (tx, rx) = mpsc::channel();

        let mut signal = Signal::silent();
        signal.message_received = Box::new(move |content| tx.send(content.to_vec()).unwrap());
        comm.set_signal(signal);

        comm.read_binary_message().unwrap();
        comm.check_io(b"AT+SBDRB\r\x00\x05hello\x02\x14\r\nOK\r\n");

        assert_eq!(rx.try_recv().unwrap(), b"hello");
        assert!(comm.pending_command().is_none());
    }

    #[test]
    fn binary_message_split_across_reads_is_deferred() {
        let (comm, _modem) = pipe_communicator();
        let (tx, rx) = mpsc::channel();

        let mut signal = Signal::silent();
        signal.message_received = Box::new(move |content| tx.send(content.to_vec()).unwrap());
        comm.set_signal(signal);

        comm.read_binary_message().unwrap();
        // First chunk ends inside the content.
        comm.check_io(b"AT+SBDRB\r\x00\x05he");
        assert!(rx.try_recv().is_err());
        assert_eq!(comm.pending_command().unwrap(), command::READ_BINARY);

        comm.check_io(b"llo\x02\x14\r\nOK\r\n");
        assert_eq!(rx.try_recv().unwrap(), b"hello");
        assert!(comm.pending_command().is_none());
    }

    #[test]
    fn binary_message_containing_ok_is_reassembled() {
        let (comm, _modem) = pipe_communicator();
        let (tx, rx) = mpsc::channel();

        let mut signal = Signal::silent();
        signal.message_received = Box::new(move |content| tx.send(content.to_vec()).unwrap());
        comm.set_signal(signal);

        let content = b"abOKcd";
        let mut wire = b"AT+SBDRB\r".to_vec();
        wire.extend_from_slice(&codec::frame_binary(content));
        wire.extend_from_slice(b"\r\nOK\r\n");

        comm.read_binary_message().unwrap();
        comm.check_io(&wire);
        assert_eq!(rx.try_recv().unwrap(), content);
    }

    #[test]
    fn corrupt_binary_checksum_reports_receive_failed() {
        let (comm, _modem) = pipe_communicator();
        let (tx, rx) = mpsc::channel();

        let mut signal = Signal::silent();
        signal.message_receive_failed =
            Box::new(move |len, content, checksum, computed| {
                tx.send((len, content.to_vec(), checksum, computed)).unwrap()
            });
        comm.set_signal(signal);

        comm.read_binary_message().unwrap();
        comm.check_io(b"AT+SBDRB\r\x00\x05hello\xff\xff\r\nOK\r\n");

        let (len, content, checksum, computed) = rx.try_recv().unwrap();
        assert_eq!(len, 5);
        assert_eq!(content, b"hello");
        assert_eq!(checksum, [0xff, 0xff]);
        assert_eq!(computed, [0x02, 0x14]);
    }

    #[test]
    fn ring_alert_queues_a_single_session() {
        let (comm, _modem) = pipe_communicator();

        comm.check_io(b"SBDRING\r\n");
        comm.check_io(b"SBDRING\r\n");
        assert_eq!(
            comm.sequential_queue_snapshot(),
            vec![command::SESSION.to_vec()],
        );

        // The next idle tick transmits the queued session.
        comm.check_io(b"");
        assert_eq!(comm.pending_command().unwrap(), command::SESSION);
        assert!(comm.sequential_queue_snapshot().is_empty());
    }

    #[test]
    fn mailbox_check_error_retries_with_last_queue_depth() {
        let (comm, _modem) = pipe_communicator();
        comm.set_signal(Signal::silent());

        // First session learns there were two messages queued.
        comm.initiate_session().unwrap();
        comm.check_io(b"+SBDIX: 0, 1, 1, 7, 5, 2\r\n\r\nOK\r\n");
        comm.clear_sequential_queue();

        // Next mailbox check fails claiming an empty queue.
        comm.initiate_session().unwrap();
        comm.check_io(b"+SBDIX: 0, 2, 2, 0, 0, 0\r\n\r\nOK\r\n");

        assert_eq!(comm.mt_retry_count(), 1);
        // The retry falls through to the auto-read path and re-runs a
        // session (after the clear-buffer scheduled by the MO success).
        assert_eq!(
            comm.sequential_queue_snapshot(),
            vec![command::CLEAR_MO_BUFFER.to_vec(), command::SESSION.to_vec()],
        );
    }

    #[test]
    fn clear_buffer_response_accepts_any_clear_echo() {
        let (comm, _modem) = pipe_communicator();
        let (tx, rx) = mpsc::channel();

        let mut signal = Signal::silent();
        signal.command_finished =
            Box::new(move |cmd, ok, _| tx.send((cmd.to_vec(), ok)).unwrap());
        comm.set_signal(signal);

        comm.clear_mt_buffer().unwrap();
        comm.check_io(b"AT+SBDD1\r\r\n0\r\n\r\nOK\r\n");

        let (cmd, ok) = rx.try_recv().unwrap();
        assert_eq!(cmd, command::CLEAR_MT_BUFFER);
        assert!(ok);
    }

    #[test]
    fn clear_buffer_rejects_error_status() {
        assert!(clear_buffer_ok(b"AT+SBDD0\r\r\n0\r\n"));
        assert!(clear_buffer_ok(b"\r\n0\r\n"));
        assert!(!clear_buffer_ok(b"AT+SBDD0\r\r\n1\r\n"));
        assert!(!clear_buffer_ok(b""));
    }

    #[test]
    fn idle_noise_is_trimmed_to_the_tail_after_last_newline() {
        let (comm, _modem) = pipe_communicator();

        comm.check_io(b"line noise\r\npartial");
        assert_eq!(comm.read_buf_snapshot(), b"partial");

        comm.check_io(b" more\r\n");
        assert_eq!(comm.read_buf_snapshot(), b"");
    }

    #[test]
    fn overwriting_a_pending_command_reports_it_failed() {
        let (comm, _modem) = pipe_communicator();
        let (tx, rx) = mpsc::channel();

        let mut signal = Signal::silent();
        signal.command_finished =
            Box::new(move |cmd, ok, _| tx.send((cmd.to_vec(), ok)).unwrap());
        comm.set_signal(signal);

        comm.ping().unwrap();
        comm.request_signal_quality().unwrap();

        let (cmd, ok) = rx.try_recv().unwrap();
        assert_eq!(cmd, command::PING);
        assert!(!ok);
        assert_eq!(comm.pending_command().unwrap(), command::SIGNAL_QUALITY);
    }

    #[test]
    fn requests_fail_without_a_port() {
        let (comm, _modem) = pipe_communicator();
        comm.set_signal(Signal::silent());
        comm.close();

        assert!(!comm.is_connected());
        assert!(matches!(comm.ping(), Err(Error::NotConnected)));
        assert!(matches!(
            comm.send_message(b"hi"),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn oversized_mo_payload_is_rejected() {
        let (comm, _modem) = pipe_communicator();
        comm.set_signal(Signal::silent());
        let too_big = vec![0u8; config::MAX_MO_LEN + 1];
        assert!(matches!(
            comm.send_message(&too_big),
            Err(Error::InvalidParams(_))
        ));
    }

    #[test]
    fn ready_transmits_the_staged_payload_with_checksum() {
        let (comm, modem) = pipe_communicator();
        comm.set_signal(Signal::silent());
        let short = Duration::from_millis(50);

        comm.send_message(b"ping").unwrap();
        assert_eq!(modem.read_line(short).unwrap(), b"AT+SBDWB=4\r");

        comm.check_io(b"READY\r\n");
        assert_eq!(modem.read_line(short).unwrap(), b"ping\x01\xae");
        assert!(comm.pending_command().is_none());
    }

    #[test]
    fn second_listener_is_refused() {
        let (comm, _modem) = pipe_communicator();
        comm.set_signal(Signal::silent());
        comm.start_thread().unwrap();
        let start = Instant::now();
        while !comm.is_listening() && start.elapsed() < WAIT {
            thread::sleep(POLL);
        }
        assert!(comm.is_listening());
        assert!(matches!(comm.listen(), Err(Error::Config(_))));
        comm.close();
        assert!(!comm.is_listening());
    }
}
