//! Unix implementation of the platform socket adapter.
//!
//! Everything that touches `libc` lives here: descriptor creation and
//! teardown, the non-blocking connect dance, single-descriptor `poll(2)`
//! waits, the `SO_ERROR` pending-error query and `getaddrinfo` name
//! resolution. Upper layers only see [`Candidate`] and the safe wrappers.

use std::{
    ffi::{CStr, CString},
    io::{Error, Result},
    mem::size_of,
    net::SocketAddr,
    ptr,
    time::Duration,
};

use errno::{errno, set_errno};
use libc::{
    addrinfo, c_char, c_int, c_void, pollfd, sa_family_t, sockaddr, sockaddr_storage, sockaddr_un,
    socklen_t, AF_INET, AF_INET6, AF_UNIX, AF_UNSPEC, EAI_SYSTEM, F_GETFL, F_SETFL, O_NONBLOCK,
    POLLERR, POLLIN, POLLNVAL, POLLOUT, SHUT_RDWR, SOCK_DGRAM, SOCK_STREAM, SOL_SOCKET, SO_ERROR,
    SO_REUSEADDR,
};
use os_socketaddr::OsSocketAddr;

pub type RawFd = i32;

/// One resolved native address/protocol triple a connection attempt may
/// try, in resolution order. Only produced by resolution, never built ad
/// hoc by callers.
#[derive(Clone, Copy)]
pub struct Candidate {
    family: c_int,
    socktype: c_int,
    protocol: c_int,
    storage: sockaddr_storage,
    len: socklen_t,
}

impl Candidate {
    fn as_ptr(&self) -> *const sockaddr {
        &self.storage as *const sockaddr_storage as *const sockaddr
    }

    /// Inet candidates render as a std socket address; local-path
    /// candidates have none.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        if self.family == AF_INET || self.family == AF_INET6 {
            unsafe { OsSocketAddr::copy_from_raw(self.as_ptr() as *mut sockaddr, self.len) }
                .into_addr()
        } else {
            None
        }
    }
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.socket_addr() {
            Some(addr) => write!(f, "Candidate({})", addr),
            None => write!(f, "Candidate(local path)"),
        }
    }
}

/// Create a descriptor matching the candidate's family/type/protocol.
pub fn create(candidate: &Candidate) -> Result<RawFd> {
    let fd = unsafe { libc::socket(candidate.family, candidate.socktype, candidate.protocol) };

    if fd < 0 {
        return Err(Error::last_os_error());
    }

    log::trace!("open fd({})", fd);

    Ok(fd)
}

/// Put the descriptor into non-blocking mode.
pub fn noblock(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, F_GETFL);

        if flags < 0 {
            return Err(Error::last_os_error());
        }

        if libc::fcntl(fd, F_SETFL, flags | O_NONBLOCK) < 0 {
            return Err(Error::last_os_error());
        }
    }

    Ok(())
}

pub fn reuse_addr(fd: RawFd) -> Result<()> {
    let on: c_int = 1;

    if unsafe {
        libc::setsockopt(
            fd,
            SOL_SOCKET,
            SO_REUSEADDR,
            &on as *const c_int as *const c_void,
            size_of::<c_int>() as socklen_t,
        )
    } < 0
    {
        return Err(Error::last_os_error());
    }

    Ok(())
}

pub fn bind(fd: RawFd, candidate: &Candidate) -> Result<()> {
    if unsafe { libc::bind(fd, candidate.as_ptr(), candidate.len) } < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

/// Outcome of starting a non-blocking connect.
pub enum ConnectStart {
    Done,
    /// The platform reported "operation now in progress"; completion must
    /// be awaited through a writable readiness wait.
    Pending,
}

pub fn connect(fd: RawFd, candidate: &Candidate) -> Result<ConnectStart> {
    let ret = unsafe { libc::connect(fd, candidate.as_ptr(), candidate.len) };

    log::trace!("fd({}) connect({})", fd, ret);

    if ret == 0 {
        return Ok(ConnectStart::Done);
    }

    let e = errno();

    set_errno(e);

    if e.0 == libc::EINPROGRESS || e.0 == libc::EAGAIN || e.0 == libc::EWOULDBLOCK {
        Ok(ConnectStart::Pending)
    } else if e.0 == libc::EISCONN {
        Ok(ConnectStart::Done)
    } else {
        Err(Error::from_raw_os_error(e.0))
    }
}

pub fn listen(fd: RawFd, backlog: i32) -> Result<()> {
    if unsafe { libc::listen(fd, backlog) } < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

pub fn accept(fd: RawFd) -> Result<(RawFd, Option<SocketAddr>)> {
    let mut remote = [0u8; size_of::<sockaddr_storage>()];

    let mut len = remote.len() as socklen_t;

    let conn_fd = unsafe {
        libc::accept(
            fd,
            remote.as_mut_ptr() as *mut sockaddr,
            &mut len as *mut socklen_t,
        )
    };

    if conn_fd < 0 {
        return Err(Error::last_os_error());
    }

    let peer =
        unsafe { OsSocketAddr::copy_from_raw(remote.as_mut_ptr() as *mut sockaddr, len) }
            .into_addr();

    log::trace!("fd({}) accept connection({}) from ({:?})", fd, conn_fd, peer);

    Ok((conn_fd, peer))
}

/// Native receive; a return of 0 means the peer closed the connection.
pub fn recv(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let len = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };

    log::trace!("fd({}) recv {}", fd, len);

    if len < 0 {
        return Err(Error::last_os_error());
    }

    Ok(len as usize)
}

pub fn send(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let len = unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), 0) };

    log::trace!("fd({}) send {}", fd, len);

    if len < 0 {
        return Err(Error::last_os_error());
    }

    Ok(len as usize)
}

pub fn send_to(fd: RawFd, buf: &[u8], to: &Candidate) -> Result<usize> {
    let len = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            0,
            to.as_ptr(),
            to.len,
        )
    };

    log::trace!("fd({}) sendto({:?}) {}", fd, to, len);

    if len < 0 {
        return Err(Error::last_os_error());
    }

    Ok(len as usize)
}

/// Best-effort bidirectional shutdown.
pub fn shutdown(fd: RawFd) {
    log::trace!("fd({}) shutdown", fd);

    unsafe { libc::shutdown(fd, SHUT_RDWR) };
}

pub fn close(fd: RawFd) {
    log::trace!("close fd({})", fd);

    unsafe { libc::close(fd) };
}

/// Query the descriptor's pending socket error (`SO_ERROR`).
pub fn pending_error(fd: RawFd) -> Result<Option<Error>> {
    let mut err_no: c_int = 0;

    let mut len = size_of::<c_int>() as socklen_t;

    if unsafe {
        libc::getsockopt(
            fd,
            SOL_SOCKET,
            SO_ERROR,
            &mut err_no as *mut c_int as *mut c_void,
            &mut len as *mut socklen_t,
        )
    } < 0
    {
        return Err(Error::last_os_error());
    }

    if err_no == 0 {
        Ok(None)
    } else {
        Ok(Some(Error::from_raw_os_error(err_no)))
    }
}

/// Result of a single-descriptor readiness poll.
pub enum Ready {
    /// The descriptor fired. `error` is set when the revents carry an
    /// error condition rather than plain readiness.
    Fired { error: bool },
    /// The wait expired.
    Expired,
}

/// Wait for the descriptor to become readable or writable, at most
/// `timeout`. `None` waits indefinitely.
pub fn poll_one(fd: RawFd, want_read: bool, timeout: Option<Duration>) -> Result<Ready> {
    let mut set = pollfd {
        fd,
        events: if want_read { POLLIN } else { POLLOUT },
        revents: 0,
    };

    // Sub-millisecond positive timeouts round up so they cannot turn into
    // an unintended immediate probe; oversized ones clamp instead of
    // truncating into a zero or negative wait.
    let millis = match timeout {
        Some(timeout) if timeout.is_zero() => 0,
        Some(timeout) => c_int::try_from(timeout.as_millis())
            .unwrap_or(c_int::MAX)
            .max(1),
        None => -1,
    };

    let fired = unsafe { libc::poll(&mut set as *mut pollfd, 1, millis) };

    if fired < 0 {
        return Err(Error::last_os_error());
    }

    if fired == 0 {
        return Ok(Ready::Expired);
    }

    Ok(Ready::Fired {
        error: set.revents & (POLLERR | POLLNVAL) != 0,
    })
}

/// How system name resolution failed.
pub enum ResolveFailure {
    /// System-level failure, carries the OS error text.
    Sys(String),
    /// Resolution-protocol failure, carries the resolver's own text.
    Gai(String),
}

/// Full ordered candidate list for `(node, port)` with the address family
/// unspecified.
pub fn resolve(
    node: &str,
    port: u16,
    datagram: bool,
) -> std::result::Result<Vec<Candidate>, ResolveFailure> {
    let node = CString::new(node)
        .map_err(|_| ResolveFailure::Gai("peer identifier contains a NUL byte".to_string()))?;

    let service = CString::new(port.to_string()).unwrap();

    let mut hints: addrinfo = unsafe { std::mem::zeroed() };

    hints.ai_family = AF_UNSPEC;
    hints.ai_socktype = if datagram { SOCK_DGRAM } else { SOCK_STREAM };

    let mut list: *mut addrinfo = ptr::null_mut();

    let ret = unsafe { libc::getaddrinfo(node.as_ptr(), service.as_ptr(), &hints, &mut list) };

    if ret != 0 {
        if ret == EAI_SYSTEM {
            return Err(ResolveFailure::Sys(Error::last_os_error().to_string()));
        }

        let text = unsafe { CStr::from_ptr(libc::gai_strerror(ret)) }
            .to_string_lossy()
            .into_owned();

        return Err(ResolveFailure::Gai(text));
    }

    let mut candidates = vec![];

    let mut cursor = list;

    while !cursor.is_null() {
        unsafe {
            let entry = &*cursor;

            let mut storage: sockaddr_storage = std::mem::zeroed();

            ptr::copy_nonoverlapping(
                entry.ai_addr as *const u8,
                &mut storage as *mut sockaddr_storage as *mut u8,
                entry.ai_addrlen as usize,
            );

            candidates.push(Candidate {
                family: entry.ai_family,
                socktype: entry.ai_socktype,
                protocol: entry.ai_protocol,
                storage,
                len: entry.ai_addrlen,
            });

            cursor = entry.ai_next;
        }
    }

    unsafe { libc::freeaddrinfo(list) };

    log::trace!("resolved {:?}:{} -> {:?}", node, port, candidates);

    Ok(candidates)
}

/// Synthesize the single candidate for a filesystem-path stream socket,
/// validating that the path fits the native address structure.
pub fn local_candidate(path: &str) -> std::result::Result<Candidate, String> {
    let mut un: sockaddr_un = unsafe { std::mem::zeroed() };

    un.sun_family = AF_UNIX as sa_family_t;

    let bytes = path.as_bytes();

    // One byte stays for the trailing NUL.
    if bytes.len() >= un.sun_path.len() {
        return Err(format!(
            "local path `{}` exceeds the native limit of {} bytes",
            path,
            un.sun_path.len() - 1
        ));
    }

    for (dst, src) in un.sun_path.iter_mut().zip(bytes) {
        *dst = *src as c_char;
    }

    let mut storage: sockaddr_storage = unsafe { std::mem::zeroed() };

    unsafe {
        ptr::copy_nonoverlapping(
            &un as *const sockaddr_un as *const u8,
            &mut storage as *mut sockaddr_storage as *mut u8,
            size_of::<sockaddr_un>(),
        );
    }

    Ok(Candidate {
        family: AF_UNIX,
        socktype: SOCK_STREAM,
        protocol: 0,
        storage,
        len: size_of::<sockaddr_un>() as socklen_t,
    })
}
