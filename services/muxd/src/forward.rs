//! Forwarding downstream servers.

use std::io;
use std::sync::Arc;

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn, Instrument};

use connmux::{matcher, Listen, Matcher, MuxError, MuxListener};

use crate::config::MatchConfig;

/// Build the matcher a route is configured with.
pub fn route_matcher(config: &MatchConfig) -> impl Matcher {
    let inner: Box<dyn Matcher> = match config {
        MatchConfig::Prefix { value } => Box::new(matcher::prefix(value.clone())),
        MatchConfig::Tls => Box::new(matcher::tls()),
        MatchConfig::Any => Box::new(matcher::any()),
    };
    move |peeked: &[u8]| inner.matches(peeked)
}

/// Accept connections from `listener` and proxy each one to `upstream`
/// until the listener closes.
///
/// Bytes peeked while matching reach the upstream first.
pub async fn forward<L: Listen>(
    listener: MuxListener<L>,
    route: Arc<str>,
    upstream: Arc<str>,
) -> Result<(), MuxError> {
    loop {
        let (mut client, peer_addr) = listener.accept().await?;
        let upstream = Arc::clone(&upstream);

        tokio::spawn(
            async move {
                match proxy(&mut client, &upstream).await {
                    Ok((to_upstream, from_upstream)) => debug!(
                        bytes_to_upstream = to_upstream,
                        bytes_from_upstream = from_upstream,
                        "Connection closed"
                    ),
                    Err(e) => warn!(error = %e, "Forwarding failed"),
                }
            }
            .instrument(tracing::info_span!(
                "forward",
                route = %route,
                peer = %peer_addr
            )),
        );
    }
}

/// Connect to `upstream` and copy in both directions until both sides close.
///
/// Returns (bytes_to_upstream, bytes_from_upstream).
async fn proxy<S>(client: &mut S, upstream: &str) -> io::Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut backend = TcpStream::connect(upstream).await?;
    debug!(upstream = %upstream, "Connected to upstream");
    copy_bidirectional(client, &mut backend).await
}
