//! Driver for the Iridium 9602 short-burst-data (SBD) satellite modem.
//!
//! The `iridium9602` crate speaks the 9602's line-oriented AT dialect over an
//! asynchronous serial link, including the binary transfer commands for
//! mobile-originated (MO) and mobile-terminated (MT) payloads and the
//! unsolicited `SBDRING` alerts the modem raises when MT traffic is waiting.
//!
//! A background listener thread owns all reads; callers either fire
//! non-blocking `request_*`/`queue_*` methods and observe results through a
//! [`Signal`] sink, or block on the `acquire_*` helpers for a synchronous
//! answer.
//!
//! # Example
//! Connect over a serial port, then read the signal quality and wait for one
//! incoming message.
//!
//! ```no_run
//! # fn example() -> iridium9602::IridiumResult<()> {
//! use std::time::Duration;
//! use iridium9602::IridiumCommunicator;
//!
//! let wait = Duration::from_secs(120);
//! let modem = IridiumCommunicator::open("/dev/ttyUSB0")?;
//! modem.connect()?;
//! let quality = modem.acquire_signal_quality(wait, wait)?;
//! if quality >= 2 {
//!     let msg = modem.acquire_message(wait, wait)?;
//!     println!("received {} bytes", msg.len());
//! }
//! modem.close();
//! # Ok(())
//! # }
//! ```
//!
//! # Example
//! Run against the in-process modem emulator over an in-memory duplex, which
//! is how the integration tests exercise the full protocol.
//!
//! ```
//! # fn example() -> iridium9602::IridiumResult<()> {
//! use iridium9602::{transport, IridiumCommunicator, IridiumEmulator};
//!
//! let (host_side, modem_side) = transport::pipe();
//! let emulator = IridiumEmulator::new(modem_side);
//! emulator.connect()?;
//!
//! let modem = IridiumCommunicator::new(host_side);
//! modem.connect()?;
//! modem.send_message(b"hello")?;
//! # Ok(())
//! # }
//! ```
use std::io;

use thiserror::Error;

pub mod codec;
pub mod command;
pub mod communicator;
pub mod config;
pub mod emulator;
pub mod signal;
pub mod transport;

pub use codec::{BinaryMessage, SessionStatus};
pub use communicator::{IridiumCommunicator, Response};
pub use config::Options;
pub use emulator::IridiumEmulator;
pub use signal::{Severity, Signal};
pub use transport::SerialLink;

/// Errors for the modem driver api
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A wire response did not have the expected shape.
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    InvalidParams(String),
    #[error("{0}")]
    Config(String),
    #[error("Serial port not connected.")]
    NotConnected,
    #[error("The command timed out or completed without returning a value.")]
    NoResponse,
    #[error("Could not connect: {0}")]
    Connect(String),
}

pub type IridiumResult<T> = std::result::Result<T, Error>;
