// Contains protocol constants and the runtime option map for the driver
use std::collections::HashMap;
use std::time::Duration;

/// Line rate required by the 9602. 8 data bits, no parity, one stop bit.
pub const BAUD_RATE: u32 = 19_200;

/// Largest mobile-originated payload the modem accepts.
pub const MAX_MO_LEN: usize = 340;
/// Largest mobile-terminated payload the gateway delivers.
pub const MAX_MT_LEN: usize = 270;

/// Capacity of the sequential and binary write queues. Appending past this
/// drops the oldest entry.
pub const QUEUE_CAPACITY: usize = 100;
/// How many command responses the emulator keeps for `A/`.
pub const HISTORY_CAPACITY: usize = 10;

/// Listener readline timeout. Short so queued commands drain promptly.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);
/// Per-step deadline while configuring and pinging during `connect`.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Default deadline for the blocking `wait_for_command`/`acquire_*` helpers.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(120);
/// Pause before re-trying a failed mailbox check.
pub const MT_RETRY_DELAY: Duration = Duration::from_millis(500);
/// How long the emulator waits for write-binary payload bytes.
pub const WRITE_BINARY_TIMEOUT: Duration = Duration::from_secs(60);

/// Iridium network time origin, 2007-03-08T03:50:35Z as a Unix timestamp.
/// The network epoch moves roughly every 12 years.
pub const IRIDIUM_EPOCH_UNIX: u64 = 1_173_325_835;

/// Runtime behavior switches for the driver and the emulator.
///
/// Option names are matched case-insensitively and unknown names read as
/// `false`. The driver defaults enable `echo`, `ring_alerts` and `auto_read`;
/// the emulator defaults swap `auto_read` for `auto_session`.
#[derive(Debug, Clone)]
pub struct Options {
    values: HashMap<String, bool>,
}

impl Options {
    /// Defaults for [`crate::IridiumCommunicator`].
    pub fn modem_defaults() -> Self {
        let mut values = HashMap::new();
        values.insert("echo".to_string(), true);
        values.insert("ring_alerts".to_string(), true);
        values.insert("auto_read".to_string(), true);
        values.insert("flow_control".to_string(), false);
        values.insert("telephone".to_string(), false);
        Self { values }
    }

    /// Defaults for [`crate::IridiumEmulator`].
    pub fn emulator_defaults() -> Self {
        let mut values = HashMap::new();
        values.insert("echo".to_string(), true);
        values.insert("ring_alerts".to_string(), true);
        values.insert("auto_session".to_string(), true);
        values.insert("flow_control".to_string(), false);
        values.insert("telephone".to_string(), false);
        Self { values }
    }

    /// Returns the value for `name`. Unknown options are `false`.
    pub fn get(&self, name: &str) -> bool {
        self.values
            .get(&name.to_ascii_lowercase())
            .copied()
            .unwrap_or(false)
    }

    /// Sets `name` to `value`.
    ///
    /// Options that shape the connect handshake (`echo`, `flow_control`,
    /// `ring_alerts`) must be set before the connection is made.
    pub fn set(&mut self, name: &str, value: bool) {
        self.values.insert(name.to_ascii_lowercase(), value);
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::modem_defaults()
    }
}
