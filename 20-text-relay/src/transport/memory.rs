//! Channel-backed connections that never touch a socket.
//!
//! [`channel`] returns the two halves the hub or client uses plus a
//! [`MemoryPeer`] standing in for the remote side. The peer can feed lines,
//! observe everything written, and inject read or write failures.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use super::{Connection, FrameSink, FrameSource};
use crate::error::TransportError;

#[derive(Debug)]
enum Feed {
    Line(String),
    Fail,
}

pub struct MemorySource {
    feed: mpsc::UnboundedReceiver<Feed>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        match self.feed.recv().await {
            Some(Feed::Line(line)) => Ok(Some(line)),
            Some(Feed::Fail) => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))),
            None => Ok(None),
        }
    }
}

#[derive(Debug)]
pub struct MemorySink {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    fail_writes: AtomicBool,
    close_calls: AtomicUsize,
}

impl MemorySink {
    /// Makes every later `send` fail as if the peer had stalled.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// How many times `close` has been called, including repeated calls.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub async fn is_closed(&self) -> bool {
        self.outbound.lock().await.is_none()
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&self, line: &str) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }
        let guard = self.outbound.lock().await;
        let outbound = guard.as_ref().ok_or(TransportError::Closed)?;
        outbound
            .send(line.to_string())
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.outbound.lock().await.take();
    }
}

/// The remote end of an in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    feed: Option<mpsc::UnboundedSender<Feed>>,
    inbox: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Delivers a line to whoever reads the [`MemorySource`].
    pub fn send(&self, line: &str) -> bool {
        self.feed
            .as_ref()
            .is_some_and(|feed| feed.send(Feed::Line(line.to_string())).is_ok())
    }

    /// Makes the next read fail with a connection reset.
    pub fn fail_reads(&self) {
        if let Some(feed) = &self.feed {
            let _ = feed.send(Feed::Fail);
        }
    }

    /// Ends the inbound stream cleanly once queued lines are consumed.
    pub fn hang_up(&mut self) {
        self.feed.take();
    }

    /// Next line written to the sink, or `None` once the sink is closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbox.recv().await
    }

    /// Everything written so far, without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.inbox.try_recv() {
            lines.push(line);
        }
        lines
    }
}

/// Creates a connected source/sink pair and the peer that drives it.
pub fn channel() -> (MemorySource, Arc<MemorySink>, MemoryPeer) {
    let (feed_tx, feed_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let source = MemorySource { feed: feed_rx };
    let sink = Arc::new(MemorySink {
        outbound: Mutex::new(Some(out_tx)),
        fail_writes: AtomicBool::new(false),
        close_calls: AtomicUsize::new(0),
    });
    let peer = MemoryPeer {
        feed: Some(feed_tx),
        inbox: out_rx,
    };
    (source, sink, peer)
}

impl Connection {
    /// Wraps an in-memory pair, keeping a typed handle on the sink.
    pub fn in_memory() -> (Self, Arc<MemorySink>, MemoryPeer) {
        let (source, sink, peer) = channel();
        let connection = Connection {
            source: Box::new(source),
            sink: Arc::clone(&sink) as Arc<dyn FrameSink>,
        };
        (connection, sink, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_sees_sent_lines_until_close() {
        let (mut source, sink, mut peer) = channel();

        assert!(peer.send("hello hub"));
        assert_eq!(source.receive().await.expect("receive"), Some("hello hub".into()));

        sink.send("hello peer").await.expect("send");
        assert_eq!(peer.recv().await, Some("hello peer".into()));

        sink.close().await;
        sink.close().await;
        assert_eq!(sink.close_calls(), 2);
        assert!(sink.is_closed().await);
        assert!(matches!(sink.send("late").await, Err(TransportError::Closed)));
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_transport_errors() {
        let (mut source, sink, mut peer) = channel();

        peer.fail_reads();
        assert!(source.receive().await.is_err());

        sink.fail_writes();
        assert!(sink.send("x").await.is_err());

        peer.hang_up();
        assert_eq!(source.receive().await.expect("clean eof"), None);
    }
}
