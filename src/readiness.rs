//! Bounded readiness waits over a single descriptor.
//!
//! Every blocking-looking operation in this crate suspends here and
//! nowhere else: descriptors stay non-blocking while a bounded `poll`
//! wait gives them their apparent blocking behavior.

use std::{fmt, time::Duration};

use crate::sys::{self, RawFd, Ready};

/// What a wait is for. Selects the poll direction and the timeout
/// category it falls back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Connect,
    Read,
    Write,
}

impl Interest {
    fn wants_read(&self) -> bool {
        matches!(self, Interest::Read)
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interest::Connect => write!(f, "awaiting connect"),
            Interest::Read => write!(f, "awaiting read"),
            Interest::Write => write!(f, "awaiting write"),
        }
    }
}

/// Why a wait did not end in readiness.
#[derive(Debug)]
pub(crate) enum WaitError {
    /// Expired with no pending socket error.
    Timeout,
    /// The descriptor carries a pending error; its description.
    Pending(String),
    /// The wait call itself failed; the OS error text.
    Sys(String),
}

impl WaitError {
    pub(crate) fn describe(self, interest: Interest) -> String {
        match self {
            WaitError::Timeout => format!("timed out {}", interest),
            WaitError::Pending(text) | WaitError::Sys(text) => text,
        }
    }
}

/// Readiness view over one descriptor. Rebuilt whenever the owning
/// socket's descriptor changes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    fd: RawFd,
}

impl Readiness {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Wait until the descriptor is ready for `interest` or `timeout`
    /// elapses; `None` waits indefinitely.
    ///
    /// A wait that expires consults the descriptor's pending socket
    /// error to tell a plain timeout apart from an asynchronous failure
    /// (the non-blocking connect case).
    pub(crate) fn wait(
        &self,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<(), WaitError> {
        log::trace!("fd({}) {} timeout({:?})", self.fd, interest, timeout);

        match sys::poll_one(self.fd, interest.wants_read(), timeout) {
            Ok(Ready::Fired { error: false }) => Ok(()),
            Ok(Ready::Fired { error: true }) => Err(WaitError::Pending(self.error_description())),
            Ok(Ready::Expired) => match sys::pending_error(self.fd) {
                Ok(None) => Err(WaitError::Timeout),
                Ok(Some(err)) => Err(WaitError::Pending(err.to_string())),
                Err(err) => Err(WaitError::Sys(err.to_string())),
            },
            Err(err) => Err(WaitError::Sys(err.to_string())),
        }
    }

    /// Zero-timeout probe: is more data pending right now? Used by the
    /// receive loop's opportunistic drain.
    pub(crate) fn read_pending(&self) -> bool {
        matches!(
            sys::poll_one(self.fd, true, Some(Duration::ZERO)),
            Ok(Ready::Fired { .. })
        )
    }

    fn error_description(&self) -> String {
        match sys::pending_error(self.fd) {
            Ok(Some(err)) => err.to_string(),
            _ => "descriptor reported an error condition".to_string(),
        }
    }
}
