// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The transport contract (§6): the runtime consumes a bidirectional byte
//! stream and does its own framing. Concrete transports (TCP, Unix socket,
//! HTTP/2) are external collaborators; this module only states the contract
//! and wires it up for the two transports the test suite and any embedder
//! actually need out of the box.

use std::{
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use anyhow::Result;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

/// A bidirectional byte stream. Reads must preserve byte order; writes are
/// plain bytes, framing is the runtime's job, not the transport's.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Whether bytes on this transport travel over a secure channel (TLS,
    /// mutual-auth Unix socket, ...). Credential gating (§4.3, §5) consults
    /// this before sending bytes for a call whose credentials demand
    /// security.
    fn is_secure(&self) -> bool {
        false
    }

    fn local_addr_string(&self) -> String {
        "unknown".to_string()
    }

    fn remote_addr_string(&self) -> String {
        "unknown".to_string()
    }
}

/// One TCP connection split into owned halves, the same shape the teacher's
/// `ClientConnection::connect` builds from `TcpStream::into_split`.
pub struct TcpTransport {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    local: SocketAddr,
    remote: SocketAddr,
    secure: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, secure: bool) -> Result<Self> {
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        Ok(Self {
            read,
            write,
            local,
            remote,
            secure,
        })
    }
}

impl AsyncRead for TcpTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.read).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.write).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.write).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.write).poll_shutdown(cx)
    }
}

impl Transport for TcpTransport {
    fn is_secure(&self) -> bool {
        self.secure
    }

    fn local_addr_string(&self) -> String {
        self.local.to_string()
    }

    fn remote_addr_string(&self) -> String {
        self.remote.to_string()
    }
}

/// In-process loopback transport used by the test suite (§2.4 of
/// SPEC_FULL.md): wraps one half of a `tokio::io::duplex` pair so a client
/// and a server can exchange `Message`s without a real socket.
pub struct DuplexTransport {
    inner: DuplexStream,
}

impl DuplexTransport {
    pub fn pair(max_buf: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(max_buf);
        (Self { inner: a }, Self { inner: b })
    }
}

impl AsyncRead for DuplexTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Transport for DuplexTransport {
    fn is_secure(&self) -> bool {
        true
    }
}

// Silence unused-import on platforms where we don't split further; kept for
// symmetry with `OwnedReadHalf`/`OwnedWriteHalf` style split transports.
#[allow(dead_code)]
type _Unused<T> = (ReadHalf<T>, WriteHalf<T>);

/// `Dialer: Dial(ctx) -> Transport` (§6). Implemented as an async trait so a
/// `Subconnection` can hold one as a trait object.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> Result<Box<dyn Transport>>;
}

/// `Listener: Accept(ctx) -> Transport, Close, Addr` (§6).
#[async_trait::async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn accept(&self) -> Result<Box<dyn Transport>>;
    fn local_addr(&self) -> String;
}

/// Dials a plain TCP address. The one concrete `Dialer` this crate ships,
/// matching the teacher shipping exactly one concrete transport (TCP).
pub struct TcpDialer {
    pub addr: String,
    pub secure: bool,
}

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> Result<Box<dyn Transport>> {
        let stream = TcpStream::connect(&self.addr).await?;
        Ok(Box::new(TcpTransport::new(stream, self.secure)?))
    }
}

/// Listens on a plain TCP address.
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    secure: bool,
}

impl TcpListener {
    pub async fn bind(addr: &str, secure: bool) -> Result<Self> {
        Ok(Self {
            inner: tokio::net::TcpListener::bind(addr).await?,
            secure,
        })
    }
}

#[async_trait::async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<Box<dyn Transport>> {
        let (stream, _peer) = self.inner.accept().await?;
        Ok(Box::new(TcpTransport::new(stream, self.secure)?))
    }

    fn local_addr(&self) -> String {
        self.inner
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}
