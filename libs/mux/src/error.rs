//! Error taxonomy and the error-handling policy.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the multiplexer and its listeners.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Transport error from the bound listener or a connection.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// No registered server claimed the connection.
    #[error("mux: connection from {peer_addr} not matched")]
    NotMatched { peer_addr: SocketAddr },

    /// A secondary listener's queue has been closed.
    #[error("mux: listener closed")]
    ListenerClosed,
}

impl MuxError {
    /// Returns true if the condition is transient and accepting may continue.
    pub fn is_temporary(&self) -> bool {
        match self {
            MuxError::Io(err) => is_temporary_io(err),
            MuxError::NotMatched { .. } => true,
            MuxError::ListenerClosed => false,
        }
    }

    /// Returns true if the error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MuxError::Io(err) if err.kind() == io::ErrorKind::TimedOut)
    }

    /// Returns true for the secondary listener's closed sentinel.
    pub fn is_listener_closed(&self) -> bool {
        matches!(self, MuxError::ListenerClosed)
    }
}

/// Classify a transport error the way accept loops treat it.
///
/// Aborted handshakes, resets, interrupts, timeouts and descriptor
/// exhaustion clear up on their own; everything else is fatal.
pub fn is_temporary_io(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    #[cfg(unix)]
    {
        // ENFILE and EMFILE share their numbers on Linux and the BSDs.
        const ENFILE: i32 = 23;
        const EMFILE: i32 = 24;
        if let Some(code) = err.raw_os_error() {
            return code == ENFILE || code == EMFILE;
        }
    }

    false
}

/// Error returned by a bound listener once it has been closed.
pub(crate) fn closed_listener_error() -> MuxError {
    MuxError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "use of closed network connection",
    ))
}

/// Policy deciding whether service continues after an error.
///
/// May be invoked concurrently from the accept loop and from
/// per-connection tasks.
pub struct ErrorHandler(Box<dyn Fn(&MuxError) -> bool + Send + Sync>);

impl ErrorHandler {
    /// Wrap a predicate; `true` means keep serving.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&MuxError) -> bool + Send + Sync + 'static,
    {
        Self(Box::new(handler))
    }

    /// Policy that always continues.
    pub fn always_continue() -> Self {
        Self::new(|_| true)
    }

    /// Ask the policy about an error.
    pub fn handle(&self, err: &MuxError) -> bool {
        (self.0)(err)
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::always_continue()
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorHandler").finish_non_exhaustive()
    }
}
