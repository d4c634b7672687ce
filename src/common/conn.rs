//! Connection seams shared with outbound adapters
//!
//! Outbound dialers hand back streams and packet sockets that know which
//! proxy chain carried them. The statistic layer only needs that chain plus
//! byte-level I/O, so this module keeps the contract narrow.

use serde::Serialize;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

/// Name of the built-in direct outbound
pub const DIRECT: &str = "DIRECT";

/// Ordered list of outbound names a connection traversed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Chain(Vec<String>);

impl Chain {
    pub fn new(hops: Vec<String>) -> Self {
        Chain(hops)
    }

    /// Terminal hop, which decides direct vs proxy attribution
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// True when traffic leaves through the direct outbound
    pub fn is_direct(&self) -> bool {
        self.last() == Some(DIRECT)
    }

    pub fn hops(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Chain {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Chain(iter.into_iter().map(Into::into).collect())
    }
}

impl From<Vec<String>> for Chain {
    fn from(hops: Vec<String>) -> Self {
        Chain(hops)
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" -> "))
    }
}

/// Anything the registry can close out of band
pub trait Closer: Send + Sync {
    fn close(&self) -> io::Result<()>;
}

/// Stream connection returned by an outbound dialer
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {
    fn chains(&self) -> &Chain;
}

/// Datagram connection returned by an outbound dialer
pub trait ProxyPacketConn: Send + Sync {
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<SocketAddr>>;

    fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<io::Result<usize>>;

    fn chains(&self) -> &Chain;
}

/// Pairs a raw stream or socket with the chain that carried it
#[derive(Debug)]
pub struct Chained<S> {
    inner: S,
    chain: Chain,
}

impl<S> Chained<S> {
    pub fn new(inner: S, chain: Chain) -> Self {
        Chained { inner, chain }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Chained<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Chained<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for Chained<S> {
    fn chains(&self) -> &Chain {
        &self.chain
    }
}

impl ProxyPacketConn for Chained<UdpSocket> {
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<SocketAddr>> {
        self.inner.poll_recv_from(cx, buf)
    }

    fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<io::Result<usize>> {
        self.inner.poll_send_to(cx, buf, target)
    }

    fn chains(&self) -> &Chain {
        &self.chain
    }
}
