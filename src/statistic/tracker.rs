//! Connection tracker implementation

use super::store::{Route, StoreSlot};
use crate::common::{Chain, Closer, Metadata, ProxyPacketConn, ProxyStream};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use uuid::Uuid;

/// Identity and traffic of one tracked connection
///
/// Shared between the live registry, the history ring and the tracker.
#[derive(Debug)]
pub struct TrackerInfo {
    /// Unique connection ID
    pub id: Uuid,
    /// Connection metadata
    pub metadata: Arc<Metadata>,
    /// Proxy chain used
    pub chain: Chain,
    /// Matched rule type
    pub rule: String,
    /// Matched rule payload
    pub rule_payload: String,
    /// Start time
    pub start: DateTime<Utc>,
    end: OnceLock<DateTime<Utc>>,
    upload: AtomicU64,
    download: AtomicU64,
}

impl TrackerInfo {
    pub(crate) fn new(
        id: Uuid,
        metadata: Arc<Metadata>,
        chain: Chain,
        rule: String,
        rule_payload: String,
    ) -> Self {
        TrackerInfo {
            id,
            metadata,
            chain,
            rule,
            rule_payload,
            start: Utc::now(),
            end: OnceLock::new(),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
        }
    }

    /// Get upload bytes
    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    /// Get download bytes
    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }

    /// Close time, once the connection is closed
    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end.get().copied()
    }

    pub fn is_closed(&self) -> bool {
        self.end.get().is_some()
    }
}

impl Serialize for TrackerInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("TrackerInfo", 9)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("metadata", &*self.metadata)?;
        state.serialize_field("upload", &self.upload())?;
        state.serialize_field("download", &self.download())?;
        state.serialize_field("start", &self.start)?;
        state.serialize_field("end", &self.end())?;
        state.serialize_field("chains", &self.chain)?;
        state.serialize_field("rule", &self.rule)?;
        state.serialize_field("rulePayload", &self.rule_payload)?;
        state.end()
    }
}

pub(crate) type Dispose = Box<dyn FnOnce() + Send>;

/// Per-connection accounting shared by the wrapper and the registry
pub struct Tracker {
    info: Arc<TrackerInfo>,
    counters: Arc<StoreSlot>,
    route: Route,
    closed: AtomicBool,
    dispose: Mutex<Option<Dispose>>,
    cancel: CancellationToken,
}

impl Tracker {
    pub(crate) fn new(
        info: Arc<TrackerInfo>,
        counters: Arc<StoreSlot>,
        route: Route,
        dispose: Dispose,
    ) -> Self {
        Tracker {
            info,
            counters,
            route,
            closed: AtomicBool::new(false),
            dispose: Mutex::new(Some(dispose)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn info(&self) -> &Arc<TrackerInfo> {
        &self.info
    }

    pub fn route(&self) -> Route {
        self.route
    }

    fn push_uploaded(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.counters.with(|s| s.add_upload(self.route, bytes));
        self.info.upload.fetch_add(bytes, Ordering::Relaxed);
    }

    fn push_downloaded(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.counters.with(|s| s.add_download(self.route, bytes));
        self.info.download.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Stamp the end time, leave the registry and signal the wrapper
    ///
    /// Only the first call has any effect.
    pub fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let _ = self.info.end.set(Utc::now());

        let dispose = self.dispose.lock().take();
        if let Some(dispose) = dispose {
            dispose();
        }

        self.cancel.cancel();
        true
    }

    fn closed_signal(&self) -> ClosedSignal {
        Box::pin(self.cancel.clone().cancelled_owned())
    }
}

impl Closer for Tracker {
    fn close(&self) -> io::Result<()> {
        self.mark_closed();
        Ok(())
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

/// Which side of a wrapper is polling
///
/// Each side waits on its own close signal, so split halves parked in
/// different tasks are all woken.
#[derive(Clone, Copy)]
enum Side {
    Read,
    Write,
}

type ClosedSignal = Pin<Box<WaitForCancellationFutureOwned>>;

/// Stream wrapper that attributes every byte to its tracker
///
/// Reads count as download, writes as upload. Closing by id through the
/// manager drops the inner stream on the next poll; any pending read or write
/// is woken and fails with `ConnectionAborted`.
pub struct TrackedConn<S> {
    inner: Option<S>,
    tracker: Arc<Tracker>,
    read_closed: ClosedSignal,
    write_closed: ClosedSignal,
}

impl<S: std::fmt::Debug> std::fmt::Debug for TrackedConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedConn")
            .field("inner", &self.inner)
            .field("info", &self.tracker.info)
            .finish()
    }
}

impl<S> TrackedConn<S> {
    pub(crate) fn new(inner: S, tracker: Arc<Tracker>) -> Self {
        TrackedConn {
            inner: Some(inner),
            read_closed: tracker.closed_signal(),
            write_closed: tracker.closed_signal(),
            tracker,
        }
    }

    pub fn id(&self) -> Uuid {
        self.tracker.info.id
    }

    pub fn info(&self) -> &Arc<TrackerInfo> {
        &self.tracker.info
    }

    /// Inner stream, until the connection is closed
    pub fn get_ref(&self) -> Option<&S> {
        self.inner.as_ref()
    }

    /// Borrow the inner stream unless a close has been signalled
    fn poll_open(&mut self, side: Side, cx: &mut Context<'_>) -> io::Result<&mut S> {
        let signal = match side {
            Side::Read => &mut self.read_closed,
            Side::Write => &mut self.write_closed,
        };
        if self.inner.is_some() && signal.as_mut().poll(cx).is_ready() {
            self.inner = None;
        }
        self.inner.as_mut().ok_or_else(aborted)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let inner = match this.poll_open(Side::Read, cx) {
            Ok(inner) => inner,
            Err(e) => return Poll::Ready(Err(e)),
        };

        let before = buf.filled().len();
        let result = Pin::new(inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let after = buf.filled().len();
            this.tracker.push_downloaded((after - before) as u64);
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let inner = match this.poll_open(Side::Write, cx) {
            Ok(inner) => inner,
            Err(e) => return Poll::Ready(Err(e)),
        };

        let result = Pin::new(inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.tracker.push_uploaded(*n as u64);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_open(Side::Write, cx) {
            Ok(inner) => Pin::new(inner).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // Leave the registry before the inner shutdown, which may block.
        this.tracker.mark_closed();

        let result = match this.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_shutdown(cx),
            None => return Poll::Ready(Ok(())),
        };
        if result.is_ready() {
            this.inner = None;
        }
        result
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for TrackedConn<S> {
    fn chains(&self) -> &Chain {
        &self.tracker.info.chain
    }
}

impl<S> Drop for TrackedConn<S> {
    fn drop(&mut self) {
        self.tracker.mark_closed();
    }
}

/// Datagram wrapper that attributes every packet to its tracker
pub struct TrackedPacketConn<P> {
    inner: Option<P>,
    tracker: Arc<Tracker>,
    recv_closed: ClosedSignal,
    send_closed: ClosedSignal,
}

impl<P: ProxyPacketConn> TrackedPacketConn<P> {
    pub(crate) fn new(inner: P, tracker: Arc<Tracker>) -> Self {
        TrackedPacketConn {
            inner: Some(inner),
            recv_closed: tracker.closed_signal(),
            send_closed: tracker.closed_signal(),
            tracker,
        }
    }

    pub fn id(&self) -> Uuid {
        self.tracker.info.id
    }

    pub fn info(&self) -> &Arc<TrackerInfo> {
        &self.tracker.info
    }

    pub fn chains(&self) -> &Chain {
        &self.tracker.info.chain
    }

    fn poll_open(&mut self, side: Side, cx: &mut Context<'_>) -> io::Result<&P> {
        let signal = match side {
            Side::Read => &mut self.recv_closed,
            Side::Write => &mut self.send_closed,
        };
        if self.inner.is_some() && signal.as_mut().poll(cx).is_ready() {
            self.inner = None;
        }
        self.inner.as_ref().ok_or_else(aborted)
    }

    pub fn poll_recv_from(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<SocketAddr>> {
        let inner = match self.poll_open(Side::Read, cx) {
            Ok(inner) => inner,
            Err(e) => return Poll::Ready(Err(e)),
        };

        let before = buf.filled().len();
        let result = inner.poll_recv_from(cx, buf);
        if let Poll::Ready(Ok(_)) = &result {
            let after = buf.filled().len();
            self.tracker.push_downloaded((after - before) as u64);
        }
        result
    }

    pub fn poll_send_to(
        &mut self,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<io::Result<usize>> {
        let inner = match self.poll_open(Side::Write, cx) {
            Ok(inner) => inner,
            Err(e) => return Poll::Ready(Err(e)),
        };

        let result = inner.poll_send_to(cx, buf, target);
        if let Poll::Ready(Ok(n)) = &result {
            self.tracker.push_uploaded(*n as u64);
        }
        result
    }

    /// Receive one datagram, counting it as download
    pub async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut read_buf = ReadBuf::new(buf);
        let addr = poll_fn(|cx| self.poll_recv_from(cx, &mut read_buf)).await?;
        Ok((read_buf.filled().len(), addr))
    }

    /// Send one datagram, counting it as upload
    pub async fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        poll_fn(|cx| self.poll_send_to(cx, buf, target)).await
    }

    /// Close the tracker, then release the inner socket
    pub fn close(&mut self) {
        self.tracker.mark_closed();
        self.inner = None;
    }
}

impl<P> Drop for TrackedPacketConn<P> {
    fn drop(&mut self) {
        self.tracker.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistic::store::CounterStore;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn tracker_with(chain: Chain, disposed: Arc<AtomicUsize>) -> (Arc<Tracker>, Arc<StoreSlot>) {
        let counters = Arc::new(StoreSlot::new(CounterStore::memory()));
        let route = Route::of(&chain);
        let info = Arc::new(TrackerInfo::new(
            Uuid::new_v4(),
            Arc::new(Metadata::tcp()),
            chain,
            "DOMAIN-SUFFIX".to_string(),
            "example.com".to_string(),
        ));
        let tracker = Arc::new(Tracker::new(
            info,
            counters.clone(),
            route,
            Box::new(move || {
                disposed.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        (tracker, counters)
    }

    fn direct() -> Chain {
        ["DIRECT"].into_iter().collect()
    }

    #[tokio::test]
    async fn test_tracked_conn_counts_bytes() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let (tracker, counters) = tracker_with(direct(), disposed.clone());

        let mock = tokio_test::io::Builder::new()
            .write(b"GET / HTTP/1.1\r\n")
            .read(b"HTTP/1.1 200 OK\r\n")
            .build();
        let mut conn = TrackedConn::new(mock, tracker.clone());

        conn.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let mut buf = vec![0u8; 17];
        conn.read_exact(&mut buf).await.unwrap();

        assert_eq!(conn.info().upload(), 16);
        assert_eq!(conn.info().download(), 17);
        assert_eq!(counters.with(|s| s.direct()), (16, 17));
        assert_eq!(counters.with(|s| s.proxy()), (0, 0));
        assert_eq!(disposed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_marks_closed_once() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let (tracker, _) = tracker_with(direct(), disposed.clone());
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = TrackedConn::new(a, tracker.clone());

        conn.shutdown().await.unwrap();
        let end = tracker.info().end().unwrap();
        assert!(end >= tracker.info().start);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);

        drop(conn);
        assert!(!tracker.mark_closed());
        assert_eq!(tracker.info().end(), Some(end));
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_disposes() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let (tracker, _) = tracker_with(direct(), disposed.clone());
        let (a, _b) = tokio::io::duplex(64);

        drop(TrackedConn::new(a, tracker.clone()));
        assert!(tracker.info().is_closed());
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let (tracker, _) = tracker_with(direct(), disposed.clone());
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = TrackedConn::new(a, tracker.clone());

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            conn.read(&mut buf).await
        });
        tokio::task::yield_now().await;

        tracker.close().unwrap();
        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_reader_after_split_write() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let (tracker, counters) = tracker_with(direct(), disposed.clone());
        let (a, mut b) = tokio::io::duplex(64);
        let (mut read_half, mut write_half) =
            tokio::io::split(TrackedConn::new(a, tracker.clone()));

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            read_half.read(&mut buf).await
        });
        tokio::task::yield_now().await;

        // The write polls after the reader has parked.
        let writer = tokio::spawn(async move {
            write_half.write_all(b"x").await.unwrap();
            write_half
        });
        let write_half = writer.await.unwrap();
        let mut sink = [0u8; 1];
        b.read_exact(&mut sink).await.unwrap();

        tracker.close().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(counters.with(|s| s.direct()), (1, 0));
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        drop(write_half);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let (tracker, counters) = tracker_with(direct(), disposed);
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = TrackedConn::new(a, tracker.clone());

        tracker.close().unwrap();
        let err = conn.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(conn.get_ref().is_none());
        assert_eq!(counters.with(|s| s.direct()), (0, 0));
    }

    #[tokio::test]
    async fn test_packet_conn_counts_datagrams() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let chain: Chain = ["hk-01"].into_iter().collect();
        let (tracker, counters) = tracker_with(chain.clone(), disposed.clone());

        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let local_addr = socket.local_addr().unwrap();

        let mut conn = TrackedPacketConn::new(crate::common::Chained::new(socket, chain), tracker);
        assert_eq!(conn.send_to(b"hello", peer_addr).await.unwrap(), 5);

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, local_addr);

        peer.send_to(b"world!", local_addr).await.unwrap();
        let (n, from) = conn.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 6);
        assert_eq!(from, peer_addr);

        assert_eq!(counters.with(|s| s.proxy()), (5, 6));
        assert_eq!(conn.chains().last(), Some("hk-01"));

        conn.close();
        assert!(conn.info().is_closed());
        let err = conn.send_to(b"x", peer_addr).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_info_serialize() {
        let info = TrackerInfo::new(
            Uuid::nil(),
            Arc::new(Metadata::tcp()),
            direct(),
            "MATCH".to_string(),
            String::new(),
        );
        info.upload.store(100, Ordering::Relaxed);

        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["id"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(value["upload"], 100);
        assert_eq!(value["download"], 0);
        assert!(value["end"].is_null());
        assert_eq!(value["chains"], serde_json::json!(["DIRECT"]));
        assert_eq!(value["rule"], "MATCH");
        assert_eq!(value["rulePayload"], "");
        assert_eq!(value["metadata"]["network"], "tcp");
    }
}
