//! Modem-side emulator for the 9602.
//!
//! Shares the engine skeleton with the driver but inverts the role: it reads
//! `\r`-terminated AT command lines from the serial link and writes
//! byte-accurate modem responses. Tests and log replay wire it to an
//! [`crate::IridiumCommunicator`] through [`crate::transport::pipe`].
//!
//! Observed quirks of real hardware are reproduced deliberately: commands
//! are echoed with the trailing `\r` intact, `ATE0` itself is never echoed,
//! and `AT+SBDRB` answers with the `AT+SBDRB\r` framing prefix instead of an
//! echo.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use crate::codec;
use crate::command;
use crate::config::{self, Options};
use crate::transport::SerialLink;
use crate::{Error, IridiumResult};

const POLL: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct EmuState {
    read_buf: BytesMut,
    /// MT payloads queued for delivery to the host.
    write_queue: VecDeque<Vec<u8>>,
    /// Responses of recent commands, for `A/`.
    history: VecDeque<Vec<u8>>,
    options: Options,
    serial_number: u16,
    session_counter: u16,
    signal_quality: u8,
    mo_status: u16,
    mt_msn: u16,
    read_timeout: Duration,
}

struct EmuShared {
    link: Mutex<Option<Arc<dyn SerialLink>>>,
    state: Mutex<EmuState>,
    listening: AtomicBool,
    connected: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// Fired with the content of every checksum-valid MO payload.
    on_mobile_originated: Mutex<Box<dyn FnMut(&[u8]) + Send>>,
}

impl std::fmt::Debug for EmuShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmuShared")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for EmuShared {
    fn drop(&mut self) {
        self.listening.store(false, Ordering::SeqCst);
    }
}

/// An Iridium 9602 stand-in that answers AT commands on a byte duplex.
#[derive(Debug, Clone)]
pub struct IridiumEmulator {
    shared: Arc<EmuShared>,
}

impl IridiumEmulator {
    /// Creates an emulator bound to `link` with default options.
    pub fn new(link: impl SerialLink + 'static) -> Self {
        Self::with_options(link, Options::emulator_defaults())
    }

    /// Creates an emulator bound to `link` with explicit options.
    pub fn with_options(link: impl SerialLink + 'static, options: Options) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        Self {
            shared: Arc::new(EmuShared {
                link: Mutex::new(Some(Arc::new(link))),
                state: Mutex::new(EmuState {
                    read_buf: BytesMut::new(),
                    write_queue: VecDeque::new(),
                    history: VecDeque::new(),
                    options,
                    serial_number: nanos as u16,
                    session_counter: 0,
                    signal_quality: 5,
                    mo_status: 0,
                    mt_msn: 0,
                    read_timeout: config::DEFAULT_READ_TIMEOUT,
                }),
                listening: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                listener: Mutex::new(None),
                on_mobile_originated: Mutex::new(Box::new(|_| {})),
            }),
        }
    }

    /// Opens the named serial port at 19200 8-N-1 and binds an emulator to
    /// it, for loopback setups with two tied-together ports.
    #[cfg(feature = "serial")]
    pub fn open(path: &str) -> IridiumResult<Self> {
        let port = crate::transport::open(path, config::DEFAULT_READ_TIMEOUT)?;
        Ok(Self::new(port))
    }

    /// Installs the handler fired with every checksum-valid MO payload the
    /// host transfers.
    pub fn set_mobile_originated_handler(
        &self,
        handler: impl FnMut(&[u8]) + Send + 'static,
    ) {
        *self.shared.on_mobile_originated.lock().unwrap() = Box::new(handler);
    }

    pub fn get_option(&self, name: &str) -> bool {
        self.shared.state.lock().unwrap().options.get(name)
    }

    pub fn set_option(&self, name: &str, value: bool) {
        self.shared.state.lock().unwrap().options.set(name, value);
    }

    /// The emulated IMEI, rendered as ASCII decimal on the wire.
    pub fn serial_number(&self) -> u16 {
        self.shared.state.lock().unwrap().serial_number
    }

    /// Sets the bar count returned for signal quality requests.
    pub fn set_signal_quality(&self, quality: u8) {
        self.shared.state.lock().unwrap().signal_quality = quality;
    }

    /// How many MT payloads are still queued for the host.
    pub fn queued_message_count(&self) -> usize {
        self.shared.state.lock().unwrap().write_queue.len()
    }

    pub fn is_port_connected(&self) -> bool {
        self.shared.link.lock().unwrap().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.is_port_connected() && self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        self.shared.listening.load(Ordering::SeqCst)
    }

    // ======= Lifecycle =======

    /// Starts answering commands: opens the listener and marks the emulator
    /// connected. There is no handshake on this side.
    pub fn connect(&self) -> IridiumResult<()> {
        if !self.is_port_connected() {
            return Err(Error::Connect(
                "The serial port would not open!".to_string(),
            ));
        }
        if !self.is_listening() {
            self.start_thread()?;
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        debug!("emulator connected");
        Ok(())
    }

    pub fn close(&self) {
        self.stop_listening();
        *self.shared.link.lock().unwrap() = None;
        self.shared.connected.store(false, Ordering::SeqCst);
        debug!("emulator closed");
    }

    fn start_thread(&self) -> IridiumResult<()> {
        let mut guard = self.shared.listener.lock().unwrap();
        if self.is_listening() || guard.is_some() {
            return Ok(());
        }
        self.shared.listening.store(true, Ordering::SeqCst);
        let weak = Arc::downgrade(&self.shared);
        let spawned = thread::Builder::new()
            .name("iridium-emulator".to_string())
            .spawn(move || {
                while let Some(shared) = weak.upgrade() {
                    let emu = IridiumEmulator { shared };
                    if !emu.is_listening() {
                        break;
                    }
                    if emu.is_port_connected() {
                        let data = emu.read_direct();
                        emu.check_io(&data);
                    }
                    drop(emu);
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

    pub fn stop_listening(&self) {
        self.shared.listening.store(false, Ordering::SeqCst);
        let handle = self.shared.listener.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    // ======= MT injection =======

    /// Queues an MT payload for the host and raises a ring alert.
    pub fn send_message(&self, message: &[u8]) -> IridiumResult<()> {
        if message.len() > config::MAX_MT_LEN {
            return Err(Error::InvalidParams(format!(
                "Message length must be no more than {} bytes.",
                config::MAX_MT_LEN
            )));
        }
        self.shared
            .state
            .lock()
            .unwrap()
            .write_queue
            .push_back(message.to_vec());
        self.write(b"SBDRING\n");
        Ok(())
    }

    // ======= Command handling =======

    /// Feeds raw bytes and dispatches every complete `\r`-terminated command
    /// line. Public so tests can drive the emulator without a listener.
    pub fn check_io(&self, incoming: &[u8]) {
        let mut lines = Vec::new();
        {
            let mut st = self.shared.state.lock().unwrap();
            if !incoming.is_empty() {
                st.read_buf.extend_from_slice(incoming);
            }
            while let Some(pos) = st.read_buf.iter().position(|&b| b == b'\r') {
                let line = st.read_buf[..=pos].to_vec();
                st.read_buf.advance(pos + 1);
                lines.push(line);
            }
        }
        for line in lines {
            self.handle_command(&line);
        }
    }

    /// Answers one command line (trailing `\r` included).
    fn handle_command(&self, raw: &[u8]) {
        let cmd = raw.strip_suffix(b"\r").unwrap_or(raw);
        let cmd = cmd.trim_ascii();

        if cmd.starts_with(command::WRITE_BINARY) {
            self.handle_write_binary(cmd, raw);
            return;
        }

        if cmd == command::REPEAT_LAST {
            self.echo(raw);
            let previous = self.shared.state.lock().unwrap().history.back().cloned();
            match previous {
                Some(resp) => self.write(&resp),
                None => self.write(b"OK\r\n"),
            }
            return;
        }

        if cmd == command::READ_BINARY {
            // No echo; the response carries its own framing prefix.
            let mut resp = Vec::new();
            let popped = self.shared.state.lock().unwrap().write_queue.pop_front();
            if let Some(msg) = popped {
                resp.extend_from_slice(command::READ_BINARY_RECEIVE);
                resp.extend_from_slice(&codec::frame_binary(&msg));
                resp.extend_from_slice(b"\r\n\r\n");
            }
            resp.extend_from_slice(b"OK\r\n");
            self.respond(resp);
            return;
        }

        if cmd == command::ECHO_OFF {
            // Turning echo off suppresses the echo of the command itself.
            self.set_option("echo", false);
            self.respond(b"OK\r\n".to_vec());
            return;
        }

        self.echo(raw);

        let resp: Vec<u8> = if cmd == command::PING {
            b"OK\r\n".to_vec()
        } else if cmd == command::ECHO_ON {
            self.set_option("echo", true);
            b"OK\r\n".to_vec()
        } else if cmd == command::FLOW_CONTROL_ON {
            self.set_option("flow_control", true);
            b"OK\r\n".to_vec()
        } else if cmd == command::FLOW_CONTROL_OFF {
            self.set_option("flow_control", false);
            b"OK\r\n".to_vec()
        } else if cmd == command::RING_ALERTS_ON {
            self.set_option("ring_alerts", true);
            b"OK\r\n".to_vec()
        } else if cmd == command::RING_ALERTS_OFF {
            self.set_option("ring_alerts", false);
            b"OK\r\n".to_vec()
        } else if cmd == command::RETURN_ECHO {
            let value = u8::from(self.get_option("echo"));
            format!("{value}\r\n\r\nOK\r\n").into_bytes()
        } else if cmd == command::RETURN_IDENTIFICATION {
            // 4 identifies the 9602 family.
            b"4\r\n\r\nOK\r\n".to_vec()
        } else if cmd == command::SYSTEM_TIME {
            let mut resp = format!("-MSSTM: {:08x}\r\n\r\n", network_time()).into_bytes();
            resp.extend_from_slice(b"OK\r\n");
            resp
        } else if cmd == command::SIGNAL_QUALITY {
            let quality = self.shared.state.lock().unwrap().signal_quality;
            format!("+CSQ:{quality}\r\n\r\nOK\r\n").into_bytes()
        } else if cmd == command::SERIAL_NUMBER {
            let sn = self.serial_number();
            format!("{sn}\r\n\r\nOK\r\n").into_bytes()
        } else if cmd == command::CHECK_RING {
            let queued = self.queued_message_count();
            format!("+CRIS: 0,{queued}\r\n\r\nOK\r\n").into_bytes()
        } else if cmd == command::CLEAR_MO_BUFFER
            || cmd == command::CLEAR_MT_BUFFER
            || cmd == command::CLEAR_BOTH_BUFFERS
        {
            b"0\r\n\r\nOK\r\n".to_vec()
        } else if cmd == command::SESSION {
            self.session_response()
        } else {
            // Anything else line-shaped still gets acknowledged.
            b"OK\r\n".to_vec()
        };

        self.respond(resp);
    }

    fn session_response(&self) -> Vec<u8> {
        let mut st = self.shared.state.lock().unwrap();
        let mt_status = u16::from(!st.write_queue.is_empty());
        let (mt_len, queue_len) = match st.write_queue.front() {
            Some(msg) => (msg.len(), st.write_queue.len() - 1),
            None => (0, 0),
        };
        let mut resp = format!(
            "+SBDIX: {},{},{},{},{},{}\r\n\r\n",
            st.mo_status, st.session_counter, mt_status, st.mt_msn, mt_len, queue_len
        )
        .into_bytes();
        resp.extend_from_slice(b"OK\r\n");

        st.session_counter = st.session_counter.wrapping_add(1);
        st.mt_msn = st.mt_msn.wrapping_add(1);
        st.mo_status = 0;
        resp
    }

    /// Stage one answers `READY`, then exactly `length + 2` payload bytes are
    /// pulled off the wire and validated.
    fn handle_write_binary(&self, cmd: &[u8], raw: &[u8]) {
        self.echo(raw);

        let digits = &cmd[command::WRITE_BINARY.len()..];
        let length: Option<usize> = std::str::from_utf8(digits)
            .ok()
            .and_then(|text| text.trim().parse().ok());
        let Some(length) = length else {
            self.set_mo_status(14);
            self.respond(b"\r\n14\r\n\r\nOK\r\n".to_vec());
            return;
        };

        self.write(b"READY\r\n");

        // The payload may contain \r and \n bytes, so it is consumed here
        // rather than by the line dispatch in check_io.
        let deadline = Instant::now() + config::WRITE_BINARY_TIMEOUT;
        let mut payload = Vec::new();
        let timed_out = loop {
            if payload.len() >= length + 2 {
                break false;
            }
            if Instant::now() >= deadline {
                break true;
            }
            payload.extend_from_slice(&self.read_direct());
        };

        let status: &[u8] = if timed_out {
            warn!("write binary timed out waiting for payload");
            self.set_mo_status(18);
            b"18"
        } else {
            let content = &payload[..length];
            let carried = [payload[length], payload[length + 1]];
            if carried == codec::checksum(content) {
                let mut handler = self.shared.on_mobile_originated.lock().unwrap();
                (*handler)(content);
                drop(handler);
                self.set_mo_status(1);
                b"0"
            } else {
                self.set_mo_status(18);
                b"18"
            }
        };

        let mut resp = Vec::new();
        resp.extend_from_slice(b"\r\n");
        resp.extend_from_slice(status);
        resp.extend_from_slice(b"\r\n\r\nOK\r\n");
        self.respond(resp);
    }

    fn set_mo_status(&self, status: u16) {
        self.shared.state.lock().unwrap().mo_status = status;
    }

    /// Echoes a received command (with its `\r` intact) when echo is on.
    fn echo(&self, raw: &[u8]) {
        if self.get_option("echo") {
            let mut echoed = raw.to_vec();
            echoed.extend_from_slice(b"\r\n");
            self.write(&echoed);
        }
    }

    /// Writes a response and records it for `A/`.
    fn respond(&self, resp: Vec<u8>) {
        self.write(&resp);
        let mut st = self.shared.state.lock().unwrap();
        if st.history.len() >= config::HISTORY_CAPACITY {
            st.history.pop_front();
        }
        st.history.push_back(resp);
    }

    fn write(&self, data: &[u8]) {
        let link = self.shared.link.lock().unwrap().clone();
        let Some(link) = link else {
            return;
        };
        if let Err(err) = link.write(data) {
            warn!(%err, "emulator write failed, closing");
            self.close();
        }
    }

    fn read_direct(&self) -> Vec<u8> {
        let link = self.shared.link.lock().unwrap().clone();
        let Some(link) = link else {
            return Vec::new();
        };
        let timeout = self.shared.state.lock().unwrap().read_timeout;
        match link.read_line(timeout) {
            Ok(data) => data,
            Err(err) => {
                warn!(%err, "emulator read failed, closing");
                self.close();
                Vec::new()
            }
        }
    }
}

/// Milliseconds since the Iridium epoch in 90 ms ticks, the unit of the
/// `-MSSTM` reply.
fn network_time() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    ((now - config::IRIDIUM_EPOCH_UNIX as f64) * 1000.0 / 90.0) as u64
}
