//! Sockets opened on behalf of libcurl and their readiness state.
//!
//! libcurl opens connection sockets through the transfer's open-socket
//! callback and closes them through the close-socket callback installed by
//! [`attach_close_hook`]. In between, the multi handle's socket callback
//! tells the driver which directions to watch. Readiness comes from tokio's
//! reactor, which is edge triggered, so after every socket action the driver
//! asks [`SocketRegistry::recheck`] to look at the descriptor again and keep
//! reporting it while it stays ready.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::task::{Context, Poll};

use libc::{c_int, c_void};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tracing::{debug, error, info, warn};

const CURLOPT_CLOSESOCKETFUNCTION: curl_sys::CURLoption = curl_sys::CURLOPTTYPE_FUNCTIONPOINT + 208;
const CURLOPT_CLOSESOCKETDATA: curl_sys::CURLoption = curl_sys::CURLOPTTYPE_OBJECTPOINT + 209;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// Directions libcurl wants watched on one socket. All false means remove.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Watch {
    pub read: bool,
    pub write: bool,
}

impl Watch {
    pub fn is_none(&self) -> bool {
        !self.read && !self.write
    }

    fn get(&self, direction: Direction) -> bool {
        match direction {
            Direction::Read => self.read,
            Direction::Write => self.write,
        }
    }

    fn set(&mut self, direction: Direction, value: bool) {
        match direction {
            Direction::Read => self.read = value,
            Direction::Write => self.write = value,
        }
    }
}

impl From<curl::multi::SocketEvents> for Watch {
    fn from(events: curl::multi::SocketEvents) -> Self {
        if events.remove() {
            Watch::default()
        } else {
            Watch {
                read: events.input(),
                write: events.output(),
            }
        }
    }
}

struct Entry {
    // registered lazily: a socket that has not started connecting yet
    // reports hang-up, and tokio never clears that readiness
    io: Option<AsyncFd<RawFd>>,
    // None for descriptors libcurl opened itself (resolver wakeups)
    owned: Option<Socket>,
    watch: Watch,
    pending: Watch,
}

impl Entry {
    fn new(owned: Option<Socket>) -> Self {
        Self {
            io: None,
            owned,
            watch: Watch::default(),
            pending: Watch::default(),
        }
    }
}

/// Counters describing the registry, exposed through session stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    /// Sockets currently tracked, owned or not.
    pub tracked: usize,
    /// Sockets opened for libcurl over the session's lifetime.
    pub opened: u64,
    /// Sockets closed for libcurl over the session's lifetime.
    pub closed: u64,
}

#[derive(Default)]
pub(crate) struct SocketRegistry {
    sockets: HashMap<RawFd, Entry>,
    opened: u64,
    closed: u64,
}

impl SocketRegistry {
    /// Open a non-blocking socket for libcurl and start tracking it.
    pub fn open(&mut self, family: c_int, socktype: c_int, protocol: c_int) -> io::Result<RawFd> {
        let domain = match family {
            libc::AF_INET => Domain::IPV4,
            libc::AF_INET6 => Domain::IPV6,
            libc::AF_UNIX => Domain::UNIX,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported address family: {other}"),
                ));
            }
        };
        let socket = Socket::new(domain, Type::from(socktype), Some(Protocol::from(protocol)))?;
        socket.set_nonblocking(true)?;

        let fd = socket.as_raw_fd();
        if let Some(stale) = self.sockets.insert(fd, Entry::new(Some(socket))) {
            // libcurl closed this descriptor behind our back
            warn!(socket = fd, "replacing stale socket entry");
            drop(stale.io);
            // the number now belongs to the new socket, do not close it
            let _ = stale.owned.map(IntoRawFd::into_raw_fd);
        }
        self.opened += 1;
        info!(socket = fd, "opened socket");
        Ok(fd)
    }

    /// Stop tracking and close a socket. Returns the `close(2)` result.
    pub fn close(&mut self, fd: RawFd) -> c_int {
        match self.sockets.remove(&fd) {
            Some(entry) => {
                drop(entry.io);
                self.closed += 1;
                info!(socket = fd, "closing socket");
                match entry.owned {
                    Some(socket) => {
                        drop(socket);
                        0
                    }
                    None => unsafe { libc::close(fd) },
                }
            }
            None => {
                warn!(socket = fd, "closing unknown socket");
                unsafe { libc::close(fd) }
            }
        }
    }

    /// Apply a watch request from the multi handle's socket callback.
    pub fn watch(&mut self, fd: RawFd, watch: Watch) {
        if watch.is_none() {
            match self.sockets.get_mut(&fd) {
                Some(entry) if entry.owned.is_some() => {
                    debug!(socket = fd, "unwatching socket");
                    entry.watch = Watch::default();
                    entry.pending = Watch::default();
                }
                Some(_) => {
                    debug!(socket = fd, "forgetting foreign descriptor");
                    self.sockets.remove(&fd);
                }
                None => debug!(socket = fd, "unwatching unknown socket"),
            }
            return;
        }

        let entry = self.sockets.entry(fd).or_insert_with(|| {
            debug!(socket = fd, "watching foreign descriptor");
            Entry::new(None)
        });
        debug!(socket = fd, read = watch.read, write = watch.write, "watching socket");
        entry.watch = watch;
        entry.pending.read &= watch.read;
        entry.pending.write &= watch.write;

        if entry.io.is_none() {
            match AsyncFd::new(fd) {
                Ok(io) => entry.io = Some(io),
                Err(e) => error!(socket = fd, error = %e, "failed to register socket"),
            }
        }
    }

    /// Collect every watched direction that is ready, clearing it as it is
    /// reported. Registers wakers for everything still pending.
    pub fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Vec<(RawFd, Direction)>> {
        let mut ready = Vec::new();
        for (&fd, entry) in self.sockets.iter_mut() {
            let Some(io) = entry.io.as_ref() else {
                continue;
            };

            if entry.watch.read {
                if std::mem::take(&mut entry.pending.read) {
                    ready.push((fd, Direction::Read));
                } else if let Poll::Ready(result) = io.poll_read_ready(cx) {
                    if let Ok(mut guard) = result {
                        guard.clear_ready();
                    }
                    ready.push((fd, Direction::Read));
                }
            }

            if entry.watch.write {
                if std::mem::take(&mut entry.pending.write) {
                    ready.push((fd, Direction::Write));
                } else if let Poll::Ready(result) = io.poll_write_ready(cx) {
                    if let Ok(mut guard) = result {
                        guard.clear_ready();
                    }
                    ready.push((fd, Direction::Write));
                }
            }
        }

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    }

    /// Mark a direction ready again if libcurl still wants it and the
    /// descriptor still reports it.
    pub fn recheck(&mut self, fd: RawFd, direction: Direction) {
        let Some(entry) = self.sockets.get_mut(&fd) else {
            return;
        };
        if entry.watch.get(direction) && still_ready(fd, direction) {
            entry.pending.set(direction, true);
        }
    }

    pub fn stats(&self) -> SocketStats {
        SocketStats {
            tracked: self.sockets.len(),
            opened: self.opened,
            closed: self.closed,
        }
    }
}

fn still_ready(fd: RawFd, direction: Direction) -> bool {
    let events = match direction {
        Direction::Read => libc::POLLIN,
        Direction::Write => libc::POLLOUT,
    };
    let mut pollfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut pollfd, 1, 0) };
    n > 0 && pollfd.revents & (events | libc::POLLERR | libc::POLLHUP) != 0
}

extern "C" fn close_socket(clientp: *mut c_void, fd: curl_sys::curl_socket_t) -> c_int {
    if clientp.is_null() {
        return unsafe { libc::close(fd) };
    }
    // the registry outlives the multi handle and every connection it caches
    let registry = unsafe { &*(clientp as *const Mutex<SocketRegistry>) };
    registry.lock().close(fd)
}

/// Route libcurl's socket closes for this easy handle through `registry`.
///
/// The pointer handed to libcurl is borrowed from the `Arc`, so the registry
/// must stay alive until the multi handle has been cleaned up.
pub(crate) fn attach_close_hook(
    raw: *mut curl_sys::CURL,
    registry: &Arc<Mutex<SocketRegistry>>,
) -> Result<(), curl::Error> {
    let callback: extern "C" fn(*mut c_void, curl_sys::curl_socket_t) -> c_int = close_socket;
    unsafe {
        cvt(curl_sys::curl_easy_setopt(
            raw,
            CURLOPT_CLOSESOCKETFUNCTION,
            callback as *const c_void,
        ))?;
        cvt(curl_sys::curl_easy_setopt(
            raw,
            CURLOPT_CLOSESOCKETDATA,
            Arc::as_ptr(registry) as *mut c_void,
        ))
    }
}

/// Undo [`attach_close_hook`]. Connections already opened keep the hook.
pub(crate) fn detach_close_hook(raw: *mut curl_sys::CURL) -> Result<(), curl::Error> {
    unsafe {
        cvt(curl_sys::curl_easy_setopt(
            raw,
            CURLOPT_CLOSESOCKETFUNCTION,
            ptr::null::<c_void>(),
        ))?;
        cvt(curl_sys::curl_easy_setopt(
            raw,
            CURLOPT_CLOSESOCKETDATA,
            ptr::null_mut::<c_void>(),
        ))
    }
}

pub(crate) fn cvt(code: curl_sys::CURLcode) -> Result<(), curl::Error> {
    if code == curl_sys::CURLE_OK {
        Ok(())
    } else {
        Err(curl::Error::new(code))
    }
}
