//! Protocol matchers.
//!
//! A matcher decides, from the bytes peeked off a connection so far,
//! whether the connection belongs to a downstream server. It is first
//! consulted with an empty slice, before anything is read, so protocols
//! where the server speaks first can be claimed without waiting on the
//! client.
//!
//! Matchers are consulted in registration order and an undecided matcher
//! holds back the ones after it. Once no more bytes will be peeked (the
//! client hit EOF, the sniff limit was reached, or a matching read timed
//! out) undecided matchers count as rejected, so a trailing [`any`] still
//! catches the connection. A server-speaks-first route placed behind an
//! undecided one is only reached through the read timeout.

/// TLS record content type for handshake messages.
const TLS_HANDSHAKE: u8 = 0x16;

/// Major version byte shared by SSL 3.0 and every TLS version.
const TLS_MAJOR_VERSION: u8 = 0x03;

/// Verdict of a matcher over the bytes peeked so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// The connection belongs to this server.
    Matched,
    /// The connection can never belong to this server.
    Rejected,
    /// Undecided; peek more bytes and ask again.
    NeedMore,
}

/// Decides whether a connection belongs to a server.
pub trait Matcher: Send + Sync + 'static {
    /// Inspect every byte peeked so far.
    fn matches(&self, peeked: &[u8]) -> MatchResult;
}

impl<F> Matcher for F
where
    F: Fn(&[u8]) -> MatchResult + Send + Sync + 'static,
{
    fn matches(&self, peeked: &[u8]) -> MatchResult {
        self(peeked)
    }
}

/// Matches every connection without reading from it.
pub fn any() -> impl Matcher {
    |_: &[u8]| MatchResult::Matched
}

/// Matches connections whose first bytes equal `prefix`.
pub fn prefix(prefix: impl Into<Vec<u8>>) -> impl Matcher {
    let prefix = prefix.into();
    move |peeked: &[u8]| {
        let n = peeked.len().min(prefix.len());
        if peeked[..n] != prefix[..n] {
            MatchResult::Rejected
        } else if n == prefix.len() {
            MatchResult::Matched
        } else {
            MatchResult::NeedMore
        }
    }
}

/// Matches connections opening with a TLS handshake record.
pub fn tls() -> impl Matcher {
    |peeked: &[u8]| match peeked {
        [] => MatchResult::NeedMore,
        [TLS_HANDSHAKE] => MatchResult::NeedMore,
        [TLS_HANDSHAKE, TLS_MAJOR_VERSION, ..] => MatchResult::Matched,
        _ => MatchResult::Rejected,
    }
}
