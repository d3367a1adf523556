#![doc = include_str!("../README.md")]

pub mod addr;
pub mod error;
pub mod readiness;
pub mod socket;

#[cfg_attr(target_family = "unix", path = "sys/unix.rs")]
mod sys;

pub use addr::{Candidate, TransportKind};
pub use error::{Result, SocketError};
pub use readiness::Interest;
pub use socket::{Socket, State, Timeouts};
