//! Client side of the CTRL protocol: a persistent, authenticated,
//! at-least-once message channel from a small device ("Base") to its
//! server, over one TCP connection.
//!
//! Frames are AES-128-CBC encrypted and AES-CMAC authenticated
//! (encrypt-then-MAC) with a chained IV; delivery runs on sliding
//! TXserver/TXbase counters with duplicate suppression, out-of-sync
//! recovery and a backoff barrier. Unacked outbound messages wait in a
//! RAM FIFO that survives reconnects within a process lifetime; the server
//! keeps our progress counter so the device never has to.
//!
//! [`session::CtrlSession`] runs the whole thing as a single tokio task;
//! [`stack::Stack`] is the I/O-free core underneath it.

pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod outbox;
pub mod rxbuf;
pub mod session;
pub mod stack;
pub mod system;

pub use config::Config;
pub use error::CtrlError;
pub use frame::CtrlMessage;
pub use session::{ConnState, CtrlApp, CtrlHandle, CtrlSession, SessionOptions};
pub use system::RtcTime;
