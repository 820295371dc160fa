// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A MessagePack-RPC endpoint library: a streaming codec, a dynamic
//! value tree, request/response/notification framing, and client and
//! server endpoints built on top.

pub mod client;
pub mod codec;
pub mod message;
pub mod server;
pub mod session;
pub mod stream;
pub mod value;

use std::fmt;

pub use message::Message;
pub use session::{Received, Session};
pub use value::Value;

/// Errors that can arise from driving a session or endpoint. Internal
/// transient signals (`Eof`, short-output retries) never reach here;
/// they're resolved locally by the codec/parser/session layer.
#[derive(Debug)]
pub enum Error {
    /// A framing problem in the RPC header itself (wrong array shape,
    /// bad type code, unresolvable response id).
    Protocol(ProtocolError),

    /// A token prefix byte didn't decode to anything valid.
    Malformed,

    /// Nesting exceeded this session's configured parser depth.
    DepthExceeded,

    /// A registered handler returned an application-level error; it
    /// becomes the non-nil `error` field of the reply.
    Handler(Value),

    /// A blocking `request` was attempted after `request_async` had
    /// already started this client's background read loop, or vice
    /// versa (§4.5: the two modes never mix on one client).
    ModeMixed,

    /// Errors returned by I/O failures on the underlying transport.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Malformed => write!(f, "malformed token in input stream"),
            Self::DepthExceeded => write!(f, "value nesting exceeded configured depth"),
            Self::Handler(e) => write!(f, "handler error: {e:?}"),
            Self::ModeMixed => write!(f, "client already committed to the other call mode"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<session::ReceiveStatus> for Error {
    fn from(s: session::ReceiveStatus) -> Self {
        match s {
            session::ReceiveStatus::Eof => {
                unreachable!("Eof is recoverable and must be handled by the read loop")
            }
            // `Session::receive` grows its parser depth and retries
            // internally, so this can only arise from `encode_request`'s
            // id-space exhaustion path (all in-flight ids taken).
            session::ReceiveStatus::NoMem => Error::DepthExceeded,
            session::ReceiveStatus::Error => Error::Malformed,
            session::ReceiveStatus::Protocol(p) => Error::Protocol(p),
        }
    }
}

/// Framing-level protocol violations (§6 error codes `EArray`,
/// `EArrayLen`, `EType`, `EMsgId`, `EResId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Expected an array header but found something else.
    EArray,
    /// The array's length didn't match its type code (3 for
    /// notification, 4 for request/response).
    EArrayLen,
    /// The type code wasn't 0 (request), 1 (response), or 2
    /// (notification).
    EType,
    /// The id field was missing, out of range, or the wrong type.
    EMsgId,
    /// A response's id has no matching outstanding request.
    EResId,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::EArray => "expected a MessagePack-RPC framing array",
                Self::EArrayLen => "framing array length does not match its type code",
                Self::EType => "framing type code is not 0, 1, or 2",
                Self::EMsgId => "message id is missing, too large, or the wrong type",
                Self::EResId => "response id has no matching outstanding request",
            }
        )
    }
}

/// A byte transport that can hand out a second, independent handle to
/// the same connection, so a read loop and a writer can live on
/// different threads without sharing a `Read + Write` value.
pub trait DuplexTransport: std::io::Read + std::io::Write + Send + 'static {
    fn try_clone(&self) -> std::io::Result<Self>
    where
        Self: Sized;
}

impl DuplexTransport for std::net::TcpStream {
    fn try_clone(&self) -> std::io::Result<Self> {
        std::net::TcpStream::try_clone(self)
    }
}

impl DuplexTransport for std::os::unix::net::UnixStream {
    fn try_clone(&self) -> std::io::Result<Self> {
        std::os::unix::net::UnixStream::try_clone(self)
    }
}

impl DuplexTransport for pipe::Endpoint {
    fn try_clone(&self) -> std::io::Result<Self> {
        pipe::Endpoint::try_clone(self)
    }
}

/// A pipe constructed with `socketpair(2)`, used for exercising
/// client/server behavior without binding a TCP port.
pub mod pipe {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    pub struct Endpoint {
        fd: std::os::fd::OwnedFd,
    }

    pub fn pipe() -> std::io::Result<(Endpoint, Endpoint)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;

        Ok((Endpoint { fd: a }, Endpoint { fd: b }))
    }

    impl std::io::Read for Endpoint {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(nix::unistd::read(&self.fd, buf)?)
        }
    }

    impl std::io::Write for Endpoint {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(nix::unistd::write(&self.fd, buf)?)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Endpoint {
        /// A second handle to the same underlying descriptor, so a
        /// connection's read loop and writer can be owned separately.
        pub fn try_clone(&self) -> std::io::Result<Endpoint> {
            use std::os::fd::{AsRawFd, FromRawFd};
            let raw = nix::unistd::dup(self.fd.as_raw_fd())?;
            // SAFETY: `dup` returns a freshly owned, open descriptor.
            let fd = unsafe { std::os::fd::OwnedFd::from_raw_fd(raw) };
            Ok(Endpoint { fd })
        }
    }
}
