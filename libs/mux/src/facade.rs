//! Secondary listeners fed by the multiplexer.
//!
//! A [`MuxListener`] looks like any other [`Listen`] implementation to the
//! downstream server driving it, but its `accept` dequeues connections the
//! multiplexer has assigned to that server instead of calling into the OS.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use crate::error::MuxError;
use crate::listen::{signaled, Listen};
use crate::sniff::SniffedConn;

/// Connection waiting in a queue, with its peer address.
pub(crate) type Queued<C> = (SniffedConn<C>, SocketAddr);

/// Bounded queue of connections assigned to one downstream server.
pub(crate) struct ConnQueue<C> {
    rx: Mutex<mpsc::Receiver<Queued<C>>>,
    closed: watch::Sender<bool>,
}

impl<C> ConnQueue<C> {
    /// Create a queue holding at most `capacity` undelivered connections.
    pub(crate) fn new(capacity: usize) -> (mpsc::Sender<Queued<C>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        (
            tx,
            Self {
                rx: Mutex::new(rx),
                closed,
            },
        )
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn recv(&self) -> Result<Queued<C>, MuxError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(MuxError::ListenerClosed);
        }

        let mut rx = tokio::select! {
            rx = self.rx.lock() => rx,
            _ = signaled(&mut closed) => return Err(MuxError::ListenerClosed),
        };

        tokio::select! {
            biased;
            _ = signaled(&mut closed) => Err(MuxError::ListenerClosed),
            queued = rx.recv() => queued.ok_or(MuxError::ListenerClosed),
        }
    }

    /// Close the queue, dropping connections that were never accepted.
    ///
    /// Returns the number of connections dropped. Closing twice is a no-op.
    pub(crate) async fn close(&self) -> usize {
        if self.closed.send_replace(true) {
            return 0;
        }

        let mut rx = self.rx.lock().await;
        rx.close();

        let mut dropped = 0;
        while let Ok((_conn, peer_addr)) = rx.try_recv() {
            debug!(peer_addr = %peer_addr, "Dropping queued connection on shutdown");
            dropped += 1;
        }
        dropped
    }
}

/// Listener facade handed to a downstream server by `serve_async`.
///
/// Everything but `accept` is delegated to the multiplexer's bound
/// listener, so `close` stops the whole multiplexer.
pub struct MuxListener<L: Listen> {
    root: Arc<L>,
    queue: Arc<ConnQueue<L::Conn>>,
}

impl<L: Listen> MuxListener<L> {
    pub(crate) fn new(root: Arc<L>, queue: Arc<ConnQueue<L::Conn>>) -> Self {
        Self { root, queue }
    }

    /// Returns true once the queue feeding this listener is closed.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl<L: Listen> Clone for MuxListener<L> {
    fn clone(&self) -> Self {
        Self {
            root: Arc::clone(&self.root),
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<L: Listen> fmt::Debug for MuxListener<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxListener")
            .field("local_addr", &self.root.local_addr().ok())
            .field("closed", &self.queue.is_closed())
            .finish()
    }
}

#[async_trait]
impl<L: Listen> Listen for MuxListener<L> {
    type Conn = SniffedConn<L::Conn>;

    /// Wait for the multiplexer to assign a connection.
    ///
    /// Once the queue is closed, pending and future calls return
    /// [`MuxError::ListenerClosed`].
    async fn accept(&self) -> Result<(Self::Conn, SocketAddr), MuxError> {
        self.queue.recv().await
    }

    fn local_addr(&self) -> Result<SocketAddr, MuxError> {
        self.root.local_addr()
    }

    fn close(&self) -> Result<(), MuxError> {
        self.root.close()
    }
}
