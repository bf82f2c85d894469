//! The network-listener capability and the real bound TCP listener.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{closed_listener_error, MuxError};

/// A source of inbound stream connections.
#[async_trait]
pub trait Listen: Send + Sync + 'static {
    /// Connection type produced by `accept`.
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next connection.
    async fn accept(&self) -> Result<(Self::Conn, SocketAddr), MuxError>;

    /// Address this listener is bound to.
    fn local_addr(&self) -> Result<SocketAddr, MuxError>;

    /// Stop accepting. Pending and future `accept` calls fail.
    fn close(&self) -> Result<(), MuxError>;
}

/// A TCP listener that can be closed while another task is accepting on it.
#[derive(Debug)]
pub struct BoundListener {
    listener: ArcSwapOption<TcpListener>,
    local_addr: SocketAddr,
    closed: watch::Sender<bool>,
}

impl BoundListener {
    /// Bind to `host:port`. An empty host, as in `:8080`, binds all
    /// interfaces. Binding to a hostname listens on only one of its
    /// addresses.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let addr = normalize_bind_addr(addr);
        let listener = TcpListener::bind(&*addr).await?;
        Self::from_tcp(listener)
    }

    /// Wrap an already bound tokio listener.
    pub fn from_tcp(listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            listener: ArcSwapOption::from_pointee(listener),
            local_addr,
            closed,
        })
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Listen for BoundListener {
    type Conn = TcpStream;

    async fn accept(&self) -> Result<(TcpStream, SocketAddr), MuxError> {
        let mut closed = self.closed.subscribe();
        let Some(listener) = self.listener.load_full() else {
            return Err(closed_listener_error());
        };

        tokio::select! {
            accepted = listener.accept() => Ok(accepted?),
            _ = signaled(&mut closed) => Err(closed_listener_error()),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, MuxError> {
        Ok(self.local_addr)
    }

    fn close(&self) -> Result<(), MuxError> {
        // The socket is released once the last in-flight accept drops its handle.
        match self.listener.swap(None) {
            Some(_) => {
                self.closed.send_replace(true);
                debug!(bind_addr = %self.local_addr, "Bound listener closed");
                Ok(())
            }
            None => Err(closed_listener_error()),
        }
    }
}

#[async_trait]
impl<L: Listen> Listen for Arc<L> {
    type Conn = L::Conn;

    async fn accept(&self) -> Result<(Self::Conn, SocketAddr), MuxError> {
        (**self).accept().await
    }

    fn local_addr(&self) -> Result<SocketAddr, MuxError> {
        (**self).local_addr()
    }

    fn close(&self) -> Result<(), MuxError> {
        (**self).close()
    }
}

/// Resolve once a `false -> true` signal has fired.
pub(crate) async fn signaled(rx: &mut watch::Receiver<bool>) {
    // A dropped sender can no longer fire; treat it as fired.
    let _ = rx.wait_for(|fired| *fired).await;
}

/// Rewrite an empty host (`:8080`) to the unspecified address.
fn normalize_bind_addr(addr: &str) -> std::borrow::Cow<'_, str> {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr).into()
    } else {
        addr.into()
    }
}
