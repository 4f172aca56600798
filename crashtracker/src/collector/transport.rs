// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of a crash report from inside the signal handler.
//!
//! Everything that can allocate (address resolution, the request head, the metadata JSON) is
//! done once by [`PreparedTransport::new`]. [`PreparedTransport::send`] then only uses raw
//! sockets, `poll` and stack buffers. A fresh connection is opened for every report, so the
//! same prepared transport works unchanged in a forked child.

use super::crash_record::CrashRecord;
use super::emitters::{emit_crashreport, generate_boundary};
use crate::shared::constants::DD_CRASHTRACK_CHUNK_SIZE;
use crate::shared::endpoint::Endpoint;
use crate::shared::timeout::TimeoutManager;
use errno::{errno, Errno};
use libc::{c_int, c_void, nfds_t, poll, pollfd, POLLERR, POLLHUP, POLLNVAL, POLLOUT};
use nix::sys::socket::{SockaddrIn, SockaddrIn6, SockaddrLike, UnixAddr};
use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use thiserror::Error;

/// Failures while delivering a report. These never leave the crash handler; they exist so that
/// the delivery code can use `?` without allocating.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Unable to create socket: {0}")]
    Socket(Errno),
    #[error("Unable to connect: {0}")]
    Connect(Errno),
    #[error("Unable to write report: {0}")]
    Write(Errno),
    #[error("poll failed: {0}")]
    Poll(Errno),
    #[error("Timed out")]
    Timeout,
    #[error("Connection closed by receiver")]
    Closed,
}

/// A resolved peer address, kept in the form `connect(2)` takes.
#[derive(Debug, Clone, Copy)]
pub enum SocketAddress {
    Inet(SockaddrIn),
    Inet6(SockaddrIn6),
    Unix(UnixAddr),
}

impl SocketAddress {
    /// Resolves an `http://` or `unix://` endpoint. May block on DNS, so this is only ever
    /// called at startup.
    pub fn resolve(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Http { host, port, .. } => {
                let addr = (host.as_str(), *port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, format!("{host} did not resolve"))
                    })?;
                Ok(addr.into())
            }
            Endpoint::Unix { path } => Self::unix(path),
            Endpoint::File { .. } => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file endpoints are served by the receiver process",
            )),
        }
    }

    /// A unix socket address. On Linux a path without a leading `/` is an abstract name.
    pub fn unix(path: &str) -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        if !path.starts_with('/') {
            return Ok(SocketAddress::Unix(UnixAddr::new_abstract(path.as_bytes())?));
        }
        Ok(SocketAddress::Unix(UnixAddr::new(path)?))
    }

    fn family(&self) -> c_int {
        match self {
            SocketAddress::Inet(_) => libc::AF_INET,
            SocketAddress::Inet6(_) => libc::AF_INET6,
            SocketAddress::Unix(_) => libc::AF_UNIX,
        }
    }

    fn as_raw(&self) -> (*const libc::sockaddr, libc::socklen_t) {
        match self {
            SocketAddress::Inet(a) => (a.as_ptr(), a.len()),
            SocketAddress::Inet6(a) => (a.as_ptr(), a.len()),
            // nix's inherent `UnixAddr::as_ptr` returns the concrete `sockaddr_un`.
            SocketAddress::Unix(a) => (a.as_ptr() as *const libc::sockaddr, a.len()),
        }
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(v4) => SocketAddress::Inet(v4.into()),
            SocketAddr::V6(v6) => SocketAddress::Inet6(v6.into()),
        }
    }
}

/// Everything the crash handler needs to send a report, computed ahead of time.
#[derive(Debug)]
pub struct PreparedTransport {
    address: SocketAddress,
    request_head: Vec<u8>,
    boundary: String,
    metadata_json: String,
}

impl PreparedTransport {
    pub fn new(address: SocketAddress, host: &str, path: &str, metadata_json: String) -> Self {
        let boundary = generate_boundary();
        let request_head = format!(
            "POST {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             User-Agent: crashtracker/{}\r\n\
             Content-Type: multipart/form-data; boundary={boundary}\r\n\
             Transfer-Encoding: chunked\r\n\
             Connection: close\r\n\r\n",
            env!("CARGO_PKG_VERSION")
        )
        .into_bytes();
        Self {
            address,
            request_head,
            boundary,
            metadata_json,
        }
    }

    /// Resolves `endpoint` and prepares a transport that posts to it.
    pub fn for_endpoint(endpoint: &Endpoint, metadata_json: String) -> io::Result<Self> {
        let address = SocketAddress::resolve(endpoint)?;
        Ok(Self::new(
            address,
            &endpoint.host_header(),
            endpoint.request_path(),
            metadata_json,
        ))
    }

    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Opens a new connection and streams `record` over it as a chunked multipart POST. Waits
    /// for the receiver to hang up, bounded by `timeout`, so the process isn't torn down while
    /// the report is still in flight.
    ///
    /// Chunks are assembled in `buf`, which the crash handler keeps outside its own stack frame.
    ///
    /// SIGNAL SAFETY:
    ///     socket/connect/send/poll/shutdown/close are async-signal-safe. Nothing allocates.
    pub fn send(
        &self,
        record: &CrashRecord,
        buf: &mut ChunkBuffer,
        timeout: &TimeoutManager,
    ) -> Result<(), TransportError> {
        let socket = connect(&self.address, timeout)?;
        let fd = socket.as_raw_fd();
        send_all(fd, &self.request_head, timeout)?;

        let mut writer = ChunkedWriter::new(fd, buf, timeout);
        let emitted = emit_crashreport(&mut writer, &self.boundary, &self.metadata_json, record);
        if let Some(e) = writer.error {
            return Err(e);
        }
        // Only I/O can fail, and the writer records every I/O failure.
        if emitted.is_err() {
            return Err(TransportError::Closed);
        }
        writer.finish()?;

        // SAFETY: fd is a valid, connected socket owned by `socket`.
        unsafe { libc::shutdown(fd, libc::SHUT_WR) };
        wait_for_pollhup(fd, timeout)?;
        Ok(())
    }
}

fn connect(address: &SocketAddress, timeout: &TimeoutManager) -> Result<OwnedFd, TransportError> {
    // SAFETY: no preconditions.
    let raw = unsafe { libc::socket(address.family(), libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(TransportError::Socket(errno()));
    }
    // SAFETY: `raw` was just returned by socket(2) and nothing else owns it.
    let socket = unsafe { OwnedFd::from_raw_fd(raw) };
    set_socket_options(raw)?;

    let (addr, len) = address.as_raw();
    // SAFETY: addr/len describe a live sockaddr owned by `address`.
    if unsafe { libc::connect(raw, addr, len) } != 0 {
        let e = errno();
        if e.0 != libc::EINPROGRESS && e.0 != libc::EINTR {
            return Err(TransportError::Connect(e));
        }
        wait_for_events(raw, POLLOUT, timeout)?;
        let mut so_error: c_int = 0;
        let mut so_len = std::mem::size_of::<c_int>() as libc::socklen_t;
        // SAFETY: so_error/so_len are valid for the duration of the call.
        let rval = unsafe {
            libc::getsockopt(
                raw,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut so_error as *mut c_int as *mut c_void,
                &mut so_len,
            )
        };
        if rval != 0 {
            return Err(TransportError::Connect(errno()));
        }
        if so_error != 0 {
            return Err(TransportError::Connect(Errno(so_error)));
        }
    }
    Ok(socket)
}

fn set_socket_options(fd: RawFd) -> Result<(), TransportError> {
    // SAFETY: fd is a valid socket.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(TransportError::Socket(errno()));
        }
    }
    // There is no MSG_NOSIGNAL on macOS; a write to a closed peer must not raise SIGPIPE
    // while we're already handling a crash.
    #[cfg(target_os = "macos")]
    {
        let one: c_int = 1;
        // SAFETY: `one` outlives the call.
        let rval = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const c_int as *const c_void,
                std::mem::size_of::<c_int>() as libc::socklen_t,
            )
        };
        if rval != 0 {
            return Err(TransportError::Socket(errno()));
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: c_int = 0;

fn send_all(fd: RawFd, mut bytes: &[u8], timeout: &TimeoutManager) -> Result<(), TransportError> {
    while !bytes.is_empty() {
        if timeout.expired() {
            return Err(TransportError::Timeout);
        }
        // SAFETY: `bytes` is a valid buffer for its length.
        let n = unsafe { libc::send(fd, bytes.as_ptr() as *const c_void, bytes.len(), SEND_FLAGS) };
        if n >= 0 {
            bytes = &bytes[n as usize..];
            continue;
        }
        let e = errno();
        match e.0 {
            libc::EINTR => continue,
            code if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                wait_for_events(fd, POLLOUT, timeout)?;
            }
            libc::EPIPE | libc::ECONNRESET => return Err(TransportError::Closed),
            _ => return Err(TransportError::Write(e)),
        }
    }
    Ok(())
}

/// Polls until one of `events` is ready on `fd`. Error conditions count as ready; the
/// following syscall reports them properly.
fn wait_for_events(
    fd: RawFd,
    events: libc::c_short,
    timeout: &TimeoutManager,
) -> Result<libc::c_short, TransportError> {
    let mut poll_fds = [pollfd {
        fd,
        events,
        revents: 0,
    }];
    loop {
        if timeout.expired() {
            return Err(TransportError::Timeout);
        }
        // SAFETY: poll_fds is a valid array of one pollfd.
        let poll_result = unsafe {
            poll(
                poll_fds.as_mut_ptr(),
                poll_fds.len() as nfds_t,
                timeout.remaining_poll_ms(),
            )
        };
        match poll_result {
            -1 => match errno() {
                Errno(libc::EAGAIN) | Errno(libc::EINTR) => continue,
                e => return Err(TransportError::Poll(e)),
            },
            // Re-checked against the deadline at the top of the loop.
            0 => continue,
            _ => return Ok(poll_fds[0].revents),
        }
    }
}

/// Waits for the receiver to close its end. Returns `false` if the deadline passed first;
/// the report has been fully written by then, so that is not an error.
fn wait_for_pollhup(fd: RawFd, timeout: &TimeoutManager) -> Result<bool, TransportError> {
    match wait_for_events(fd, POLLHUP, timeout) {
        Ok(revents) if revents & (POLLHUP | POLLERR) != 0 => Ok(true),
        Ok(revents) if revents & POLLNVAL != 0 => Err(TransportError::Closed),
        Ok(_) | Err(TransportError::Timeout) => Ok(false),
        Err(e) => Err(e),
    }
}

// Room for the hex length of one chunk plus CRLF, written right-aligned in front of the data.
const CHUNK_HEADER_RESERVE: usize = 8;
const CHUNK_BUFFER_LEN: usize = CHUNK_HEADER_RESERVE + DD_CRASHTRACK_CHUNK_SIZE + 2;

/// Backing storage for one HTTP chunk: header, data and trailing CRLF.
pub struct ChunkBuffer([u8; CHUNK_BUFFER_LEN]);

impl ChunkBuffer {
    pub const fn new() -> Self {
        Self([0; CHUNK_BUFFER_LEN])
    }
}

impl Default for ChunkBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// `io::Write` adapter producing HTTP/1.1 chunked encoding on a raw socket.
///
/// Every chunk is assembled in the borrowed [`ChunkBuffer`] and goes out with a single
/// `send_all`. The first failure is kept in `error`; the `io::Error` handed to the caller is
/// built from an `ErrorKind` only, so that path doesn't allocate either.
struct ChunkedWriter<'a> {
    fd: RawFd,
    timeout: &'a TimeoutManager,
    buf: &'a mut [u8; CHUNK_BUFFER_LEN],
    len: usize,
    error: Option<TransportError>,
}

impl<'a> ChunkedWriter<'a> {
    fn new(fd: RawFd, buf: &'a mut ChunkBuffer, timeout: &'a TimeoutManager) -> Self {
        Self {
            fd,
            timeout,
            buf: &mut buf.0,
            len: 0,
            error: None,
        }
    }

    fn send_chunk(&mut self) -> Result<(), TransportError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if self.len == 0 {
            return Ok(());
        }
        let mut header = [0u8; CHUNK_HEADER_RESERVE];
        let header_len = {
            let mut cursor = io::Cursor::new(&mut header[..]);
            // Cannot fail: DD_CRASHTRACK_CHUNK_SIZE in hex plus CRLF fits the reserve.
            let _ = write!(cursor, "{:x}\r\n", self.len);
            cursor.position() as usize
        };
        let start = CHUNK_HEADER_RESERVE - header_len;
        self.buf[start..CHUNK_HEADER_RESERVE].copy_from_slice(&header[..header_len]);
        let end = CHUNK_HEADER_RESERVE + self.len;
        self.buf[end..end + 2].copy_from_slice(b"\r\n");

        let rval = send_all(self.fd, &self.buf[start..end + 2], self.timeout);
        self.len = 0;
        rval.map_err(|e| {
            self.error = Some(e);
            e
        })
    }

    /// Flushes buffered data and sends the terminating zero-length chunk.
    fn finish(mut self) -> Result<(), TransportError> {
        self.send_chunk()?;
        send_all(self.fd, b"0\r\n\r\n", self.timeout)
    }
}

fn to_io_error(e: TransportError) -> io::Error {
    match e {
        TransportError::Timeout => io::ErrorKind::TimedOut.into(),
        TransportError::Closed => io::ErrorKind::BrokenPipe.into(),
        _ => io::ErrorKind::Other.into(),
    }
}

impl Write for ChunkedWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if let Some(e) = self.error {
            return Err(to_io_error(e));
        }
        if self.len == DD_CRASHTRACK_CHUNK_SIZE {
            self.send_chunk().map_err(to_io_error)?;
        }
        let n = data.len().min(DD_CRASHTRACK_CHUNK_SIZE - self.len);
        let offset = CHUNK_HEADER_RESERVE + self.len;
        self.buf[offset..offset + n].copy_from_slice(&data[..n]);
        self.len += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_chunk().map_err(to_io_error)
    }
}
