//! The socket facade: state machine, connection establishment, the
//! listen/accept path and the buffered I/O engine.

use std::{io::ErrorKind, thread, time::Duration};

use crate::{
    addr::{resolve_candidates, Candidate, TransportKind},
    error::{Result, SocketError},
    readiness::{Interest, Readiness, WaitError},
    sys::{self, ConnectStart, RawFd},
};

/// Scratch capacity for one native receive.
const RECV_CHUNK: usize = 32768;

/// Grace period between the bidirectional shutdown request and the
/// descriptor release on an orderly close.
const CLOSE_GRACE: Duration = Duration::from_millis(10);

/// Lifecycle states. Transitions are monotonic within one connection
/// attempt; [`Socket::close`] resets to `Unbound` from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed, resolved, no descriptor yet.
    Unbound,
    /// Datagram socket ready for I/O; no connection handshake exists.
    Stateless,
    /// Stream socket ready for I/O or for listening.
    Connected,
    /// Stream server accepting connections.
    Listening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Bind,
    Connect,
    Listen,
    Accept,
    Recv,
    Send,
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::Bind => "bind",
            Op::Connect => "connect",
            Op::Listen => "listen",
            Op::Accept => "accept",
            Op::Recv => "recv",
            Op::Send => "send",
        }
    }
}

impl State {
    /// The central (state, operation) legality table.
    fn permits(&self, op: Op) -> bool {
        matches!(
            (self, op),
            (State::Unbound, Op::Bind | Op::Connect)
                | (State::Stateless, Op::Recv | Op::Send)
                | (State::Connected, Op::Listen | Op::Recv | Op::Send)
                | (State::Listening, Op::Accept)
        )
    }
}

/// Per-category timeout bounds; `None` waits indefinitely.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
    pub connect: Option<Duration>,
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

impl Timeouts {
    fn for_interest(&self, interest: Interest) -> Option<Duration> {
        match interest {
            Interest::Connect => self.connect,
            Interest::Read => self.read,
            Interest::Write => self.write,
        }
    }
}

/// Exclusively owned native descriptor, released exactly once.
#[derive(Debug)]
struct OwnedFd(RawFd);

impl OwnedFd {
    fn raw(&self) -> RawFd {
        self.0
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        sys::close(self.0);
    }
}

/// A blocking-style socket over one of the three transports.
///
/// Construction resolves the peer once and performs no I/O; the
/// descriptor appears on [`bind`](Socket::bind), [`connect`](Socket::connect)
/// or [`accept`](Socket::accept). One instance is not safe for concurrent
/// use from multiple threads; a socket produced by `accept` is fully
/// independent of its parent and may move to another thread immediately.
#[derive(Debug)]
pub struct Socket {
    kind: TransportKind,
    peer: String,
    port: Option<u16>,
    state: State,
    fd: Option<OwnedFd>,
    ready: Readiness,
    timeouts: Timeouts,
    candidates: Vec<Candidate>,
    chunk: Box<[u8; RECV_CHUNK]>,
}

impl Socket {
    /// Resolve `peer` and build an `Unbound` socket with no timeouts
    /// configured. `port` is required for the remote transports and
    /// ignored for [`TransportKind::Local`].
    pub fn new(kind: TransportKind, peer: &str, port: Option<u16>) -> Result<Self> {
        Self::with_timeouts(kind, peer, port, Timeouts::default())
    }

    pub fn with_timeouts(
        kind: TransportKind,
        peer: &str,
        port: Option<u16>,
        timeouts: Timeouts,
    ) -> Result<Self> {
        let candidates = resolve_candidates(kind, peer, port)?;

        Ok(Self {
            kind,
            peer: peer.to_string(),
            port,
            state: State::Unbound,
            fd: None,
            ready: Readiness::new(-1),
            timeouts,
            candidates,
            chunk: Box::new([0u8; RECV_CHUNK]),
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn set_timeouts(&mut self, timeouts: Timeouts) {
        self.timeouts = timeouts;
    }

    pub fn set_connect_timeout(&mut self, timeout: Option<Duration>) {
        self.timeouts.connect = timeout;
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.timeouts.read = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.timeouts.write = timeout;
    }

    fn ensure(&self, op: Op) -> Result<()> {
        if self.state.permits(op) {
            Ok(())
        } else {
            Err(SocketError::InvalidState {
                op: op.name(),
                state: self.state,
            })
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_ref().map(|fd| fd.raw()).unwrap_or(-1)
    }

    /// Take ownership of a fresh descriptor and rebuild the readiness
    /// view for it.
    fn install(&mut self, fd: RawFd, state: State) {
        self.fd = Some(OwnedFd(fd));
        self.state = state;
        self.ready = Readiness::new(fd);
    }

    fn wait_for(&self, interest: Interest) -> std::result::Result<(), WaitError> {
        self.ready.wait(interest, self.timeouts.for_interest(interest))
    }

    /// Bind for local service. Shares the candidate-iteration driver with
    /// [`connect`](Socket::connect); a stream descriptor is left blocking
    /// here since only a connect needs completion detection, while a
    /// datagram descriptor goes non-blocking for its I/O loops.
    pub fn bind(&mut self) -> Result<()> {
        self.establish(Op::Bind)
    }

    /// Connect to the resolved peer, trying each candidate address in
    /// resolution order under the configured connect timeout.
    pub fn connect(&mut self) -> Result<()> {
        self.establish(Op::Connect)
    }

    fn establish(&mut self, op: Op) -> Result<()> {
        self.ensure(op)?;

        let mut last_error = String::from("no usable candidate address");

        for candidate in self.candidates.clone() {
            let fd = match sys::create(&candidate) {
                Ok(fd) => fd,
                Err(err) => {
                    last_error = err.to_string();
                    continue;
                }
            };

            // The connect syscall needs completion detection, and every
            // descriptor that will carry I/O goes non-blocking so the
            // readiness waits keep bounding recv/send mid-call. Stream
            // bind descriptors become listeners and stay blocking: the
            // accept path has no readiness wait.
            if op == Op::Connect || self.kind.is_datagram() {
                if let Err(err) = sys::noblock(fd) {
                    last_error = err.to_string();
                    sys::close(fd);
                    continue;
                }
            }

            // No handshake for datagram transport.
            if self.kind.is_datagram() {
                self.install(fd, State::Stateless);

                log::debug!("fd({}) datagram socket ready", fd);

                return Ok(());
            }

            let outcome = if op == Op::Bind {
                self.start_bind(fd, &candidate)
            } else {
                self.start_connect(fd, &candidate)
            };

            match outcome {
                Ok(()) => {
                    self.install(fd, State::Connected);

                    log::debug!("fd({}) {} `{}` ({:?})", fd, op.name(), self.peer, candidate);

                    return Ok(());
                }
                Err(text) => {
                    last_error = text;
                    sys::close(fd);
                }
            }
        }

        Err(SocketError::Connection {
            peer: self.peer.clone(),
            last_error,
        })
    }

    fn start_bind(&self, fd: RawFd, candidate: &Candidate) -> std::result::Result<(), String> {
        sys::reuse_addr(fd).map_err(|err| err.to_string())?;

        sys::bind(fd, candidate).map_err(|err| err.to_string())
    }

    fn start_connect(&self, fd: RawFd, candidate: &Candidate) -> std::result::Result<(), String> {
        match sys::connect(fd, candidate) {
            Ok(ConnectStart::Done) => Ok(()),
            Ok(ConnectStart::Pending) => Readiness::new(fd)
                .wait(Interest::Connect, self.timeouts.connect)
                .map_err(|err| err.describe(Interest::Connect)),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Start listening for incoming connections with the given backlog
    /// (the lifecycle default is 1).
    pub fn listen(&mut self, backlog: i32) -> Result<()> {
        self.ensure(Op::Listen)?;

        sys::listen(self.raw_fd(), backlog).map_err(|err| SocketError::Listen(err.to_string()))?;

        self.state = State::Listening;

        Ok(())
    }

    /// Accept one incoming connection, producing an independent
    /// `Connected` socket. The listener is unaffected and stays
    /// `Listening`.
    pub fn accept(&mut self) -> Result<Socket> {
        self.ensure(Op::Accept)?;

        // The child resolves the same (kind, peer, port) tuple and owns
        // its own descriptor and buffer; it inherits the listener's
        // timeout configuration and shares no mutable state with it.
        let mut child = Socket::with_timeouts(self.kind, &self.peer, self.port, self.timeouts)?;

        loop {
            match sys::accept(self.raw_fd()) {
                Ok((fd, peer)) => {
                    // The child carries I/O, so it goes non-blocking like
                    // a connected descriptor; otherwise the read/write
                    // timeouts would stop bounding recv/send after the
                    // first byte.
                    if let Err(err) = sys::noblock(fd) {
                        sys::close(fd);

                        return Err(SocketError::Accept(err.to_string()));
                    }

                    child.install(fd, State::Connected);

                    log::debug!("fd({}) accepted fd({}) from {:?}", self.raw_fd(), fd, peer);

                    return Ok(child);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(SocketError::Accept(err.to_string())),
            }
        }
    }

    /// Receive at least `min` and, when `max` is set, at most `max`
    /// bytes.
    ///
    /// With no `max`, a completely filled buffer plus an immediate
    /// zero-timeout readiness probe lets the loop keep draining without
    /// waiting again, so the result may exceed `min`. The greedy drain is
    /// a documented policy choice of this engine, not an accident of the
    /// loop shape.
    pub fn recv(&mut self, min: usize, max: Option<usize>) -> Result<Vec<u8>> {
        self.ensure(Op::Recv)?;

        self.wait_for(Interest::Read).map_err(Self::recv_wait_error)?;

        let mut out = Vec::new();

        loop {
            let limit = match max {
                Some(max) => RECV_CHUNK.min(max - out.len()),
                None => RECV_CHUNK,
            };

            if limit == 0 {
                break;
            }

            match sys::recv(self.raw_fd(), &mut self.chunk[..limit]) {
                Ok(0) => {
                    // Peer closed mid-receive; release the descriptor so
                    // the caller does not have to.
                    self.close();

                    return Err(SocketError::ConnectionClosed);
                }
                Ok(n) => {
                    out.extend_from_slice(&self.chunk[..n]);

                    if let Some(max) = max {
                        if out.len() >= max {
                            break;
                        }
                    } else if n == limit && self.ready.read_pending() {
                        continue;
                    }

                    if out.len() >= min {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.wait_for(Interest::Read).map_err(Self::recv_wait_error)?;
                }
                Err(err) => return Err(SocketError::Receive(err.to_string())),
            }
        }

        Ok(out)
    }

    fn recv_wait_error(err: WaitError) -> SocketError {
        match err {
            WaitError::Timeout => SocketError::Timeout(Interest::Read),
            other => SocketError::Receive(other.describe(Interest::Read)),
        }
    }

    /// Send the whole buffer, in order, across as many native calls as
    /// the transport needs. Datagram sockets target the first resolved
    /// candidate address.
    pub fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.ensure(Op::Send)?;

        let mut sent = 0;

        while sent < buf.len() {
            self.wait_for(Interest::Write).map_err(|err| match err {
                WaitError::Timeout => SocketError::Timeout(Interest::Write),
                other => SocketError::Send(other.describe(Interest::Write)),
            })?;

            let result = if self.state == State::Stateless {
                sys::send_to(self.raw_fd(), &buf[sent..], &self.candidates[0])
            } else {
                sys::send(self.raw_fd(), &buf[sent..])
            };

            match result {
                Ok(n) => sent += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(SocketError::Send(err.to_string())),
            }
        }

        Ok(())
    }

    /// Arbitrary-sender datagram receive. Part of the surface,
    /// deliberately unsupported.
    pub fn recv_from(&mut self) -> Result<(Vec<u8>, std::net::SocketAddr)> {
        Err(SocketError::NotImplemented("recv_from"))
    }

    /// Close the socket and return to `Unbound`. A `Connected` socket
    /// gets a bidirectional shutdown and a short grace period before the
    /// descriptor is released. Idempotent, never fails.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            if self.state == State::Connected {
                sys::shutdown(fd.raw());

                thread::sleep(CLOSE_GRACE);
            }

            drop(fd);
        }

        self.state = State::Unbound;
        self.ready = Readiness::new(-1);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // Plain descriptor release; the orderly-shutdown grace period is
        // reserved for explicit close.
        self.fd.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_socket() -> Socket {
        Socket::new(TransportKind::Stream, "127.0.0.1", Some(4242)).unwrap()
    }

    #[test]
    fn construction_is_resolved_and_unbound() {
        let socket = stream_socket();

        assert_eq!(socket.state(), State::Unbound);
        assert_eq!(socket.kind(), TransportKind::Stream);
        assert_eq!(socket.raw_fd(), -1);
    }

    #[test]
    fn empty_peer_fails_before_any_descriptor() {
        let err = Socket::new(TransportKind::Stream, "", Some(80)).unwrap_err();

        assert!(matches!(err, SocketError::Resolution(_)));
    }

    #[test]
    fn state_table_matches_lifecycle() {
        for (state, op, allowed) in [
            (State::Unbound, Op::Bind, true),
            (State::Unbound, Op::Connect, true),
            (State::Unbound, Op::Listen, false),
            (State::Unbound, Op::Accept, false),
            (State::Unbound, Op::Recv, false),
            (State::Unbound, Op::Send, false),
            (State::Stateless, Op::Recv, true),
            (State::Stateless, Op::Send, true),
            (State::Stateless, Op::Bind, false),
            (State::Stateless, Op::Listen, false),
            (State::Connected, Op::Listen, true),
            (State::Connected, Op::Recv, true),
            (State::Connected, Op::Send, true),
            (State::Connected, Op::Connect, false),
            (State::Connected, Op::Accept, false),
            (State::Listening, Op::Accept, true),
            (State::Listening, Op::Recv, false),
            (State::Listening, Op::Connect, false),
        ] {
            assert_eq!(state.permits(op), allowed, "({:?}, {:?})", state, op);
        }
    }

    #[test]
    fn illegal_operation_names_current_state() {
        let mut socket = stream_socket();

        let err = socket.listen(1).unwrap_err();

        match err {
            SocketError::InvalidState { op, state } => {
                assert_eq!(op, "listen");
                assert_eq!(state, State::Unbound);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(format!("{}", socket.accept().unwrap_err()).contains("Unbound"));
    }

    #[test]
    fn recv_from_is_unsupported() {
        let mut socket = Socket::new(TransportKind::Datagram, "127.0.0.1", Some(4242)).unwrap();

        assert!(matches!(
            socket.recv_from().unwrap_err(),
            SocketError::NotImplemented("recv_from")
        ));
    }

    #[test]
    fn close_is_idempotent_from_any_state() {
        let mut socket = stream_socket();

        socket.close();
        socket.close();

        assert_eq!(socket.state(), State::Unbound);
    }
}
