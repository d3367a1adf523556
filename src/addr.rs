//! Transport kinds and candidate-address resolution.

use crate::{
    error::{Result, SocketError},
    sys,
};

pub use crate::sys::Candidate;

/// The three transports sharing one connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Remote stream socket (TCP).
    Stream,
    /// Remote datagram socket (UDP).
    Datagram,
    /// Local stream socket addressed by a filesystem path.
    Local,
}

impl TransportKind {
    pub(crate) fn is_datagram(&self) -> bool {
        matches!(self, TransportKind::Datagram)
    }

    pub(crate) fn is_local(&self) -> bool {
        matches!(self, TransportKind::Local)
    }
}

/// Turn `(kind, peer, port)` into the ordered candidate list.
///
/// Local transport synthesizes a single path candidate; remote transports
/// go through system name resolution with the family left unspecified.
/// The list is produced once, at socket construction, and never
/// re-resolved afterwards.
pub(crate) fn resolve_candidates(
    kind: TransportKind,
    peer: &str,
    port: Option<u16>,
) -> Result<Vec<Candidate>> {
    if peer.is_empty() {
        return Err(SocketError::Resolution(
            "peer identifier is empty".to_string(),
        ));
    }

    if kind.is_local() {
        let candidate = sys::local_candidate(peer).map_err(SocketError::Resolution)?;

        return Ok(vec![candidate]);
    }

    let port = port.ok_or_else(|| {
        SocketError::Resolution(format!("{:?} transport requires a port", kind))
    })?;

    sys::resolve(peer, port, kind.is_datagram()).map_err(|failure| match failure {
        sys::ResolveFailure::Sys(text) => {
            SocketError::Resolution(format!("system failure resolving `{}`: {}", peer, text))
        }
        sys::ResolveFailure::Gai(text) => {
            SocketError::Resolution(format!("cannot resolve `{}`: {}", peer, text))
        }
    })
}
