//! The observer sink the protocol engine reports through.
//!
//! [`Signal`] is a struct of boxed closures rather than a trait so individual
//! callbacks can be swapped at runtime; the synchronous `acquire_*` helpers
//! rely on that to temporarily substitute collectors and restore the
//! originals afterwards. Every field defaults to a no-op except
//! `notification`, which logs through `tracing`.
//!
//! Callbacks run on the listener thread. Keep them non-blocking and do not
//! call back into blocking driver methods from inside one; the `queue_*`
//! methods are safe to call.

use tracing::{error, info, warn};

/// Weight of a [`Signal::notification`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Severity {
    Error,
    Warning,
    Info,
    Success,
}

/// Callback set fired by [`crate::IridiumCommunicator`].
pub struct Signal {
    /// The connection process is about to start.
    pub connecting: Box<dyn FnMut() + Send>,
    /// The connection has been verified.
    pub connected: Box<dyn FnMut() + Send>,
    /// The disconnect process is about to start.
    pub disconnecting: Box<dyn FnMut() + Send>,
    /// The connection has been closed.
    pub disconnected: Box<dyn FnMut() + Send>,
    /// A system time response parsed.
    pub system_time_updated: Box<dyn FnMut(u64) + Send>,
    /// A serial number response parsed. The value is the modem IMEI.
    pub serial_number_updated: Box<dyn FnMut(&str) + Send>,
    /// A signal quality response parsed, 0 through 5 bars.
    pub signal_quality_updated: Box<dyn FnMut(u8) + Send>,
    /// A check-ring response parsed, telephony and SBD indicators.
    pub check_ring_updated: Box<dyn FnMut(u16, u16) + Send>,
    /// An MT message arrived with matching length and checksum. The slice is
    /// the content without framing.
    pub message_received: Box<dyn FnMut(&[u8]) + Send>,
    /// An MT message arrived but failed the length or checksum check.
    /// Arguments are the announced length, the content, the carried checksum
    /// and the recomputed checksum.
    pub message_receive_failed: Box<dyn FnMut(usize, &[u8], [u8; 2], [u8; 2]) + Send>,
    /// A session reported the MO buffer transferred; the value is the MO
    /// message sequence number.
    pub message_transferred: Box<dyn FnMut(u16) + Send>,
    /// A session reported the MO transfer failed.
    pub message_transfer_failed: Box<dyn FnMut(u16) + Send>,
    /// Any non-fatal driver event, with a short message and detail text.
    pub notification: Box<dyn FnMut(Severity, &str, &str) + Send>,
    /// Fired for every command, success or failure, with the raw response
    /// slice that preceded the terminator.
    pub command_finished: Box<dyn FnMut(&[u8], bool, &[u8]) + Send>,
}

impl Signal {
    /// A sink that ignores everything, including notifications.
    pub fn silent() -> Self {
        Self {
            notification: Box::new(|_, _, _| {}),
            ..Self::default()
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self {
            connecting: Box::new(|| {}),
            connected: Box::new(|| {}),
            disconnecting: Box::new(|| {}),
            disconnected: Box::new(|| {}),
            system_time_updated: Box::new(|_| {}),
            serial_number_updated: Box::new(|_| {}),
            signal_quality_updated: Box::new(|_| {}),
            check_ring_updated: Box::new(|_, _| {}),
            message_received: Box::new(|_| {}),
            message_receive_failed: Box::new(|_, _, _, _| {}),
            message_transferred: Box::new(|_| {}),
            message_transfer_failed: Box::new(|_| {}),
            notification: Box::new(|severity, message, detail| match severity {
                Severity::Error => error!(%message, %detail, "modem notification"),
                Severity::Warning => warn!(%message, %detail, "modem notification"),
                Severity::Info | Severity::Success => {
                    info!(%message, %detail, "modem notification")
                }
            }),
            command_finished: Box::new(|_, _, _| {}),
        }
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Signal { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn default_callbacks_are_callable() {
        let mut signal = Signal::default();
        (signal.connecting)();
        (signal.system_time_updated)(100_000);
        (signal.message_received)(b"hello");
        (signal.command_finished)(b"AT", true, b"");
    }

    #[test]
    fn callbacks_are_replaceable_at_runtime() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut signal = Signal::silent();
        signal.signal_quality_updated = Box::new(move |sig| sink.lock().unwrap().push(sig));

        (signal.signal_quality_updated)(4);
        (signal.signal_quality_updated)(2);
        assert_eq!(*seen.lock().unwrap(), vec![4, 2]);
    }
}
