//! Transparent sniffing of connection bytes.
//!
//! A [`SniffedConn`] lets detection logic read the first bytes of a
//! connection and then hand the connection on as if nothing had been read:
//!
//! - `start_sniffing` mirrors every byte read from the connection into an
//!   internal buffer
//! - `done_sniffing` arms replay; the next reads drain the buffer in
//!   original order before reads go back to the socket
//!
//! Writes are never sniffed.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Buffer that records reads while sniffing and replays them afterwards.
///
/// While `read < size`, reads are served from the buffer only. Once the
/// buffer is drained and sniffing is off, it is released and reads pass
/// straight through to the source.
#[derive(Debug, Default)]
struct SniffBuffer {
    buffer: BytesMut,
    /// Replay cursor.
    read: usize,
    /// Replay ceiling.
    size: usize,
    sniffing: bool,
}

impl SniffBuffer {
    /// Switch modes. The ceiling is taken before anything is released, so
    /// `reset(false)` replays everything recorded since `reset(true)`.
    fn reset(&mut self, sniffing: bool) {
        self.sniffing = sniffing;
        self.read = 0;
        self.size = self.buffer.len();
    }

    fn poll_read_from<S>(
        &mut self,
        source: &mut S,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>>
    where
        S: AsyncRead + Unpin,
    {
        if self.size > self.read {
            let pending = &self.buffer[self.read..self.size];
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending[..n]);
            self.read += n;
            return Poll::Ready(Ok(()));
        } else if !self.sniffing && self.buffer.capacity() != 0 {
            self.buffer = BytesMut::new();
        }

        let before = buf.filled().len();
        ready!(Pin::new(source).poll_read(cx, buf))?;

        if self.sniffing {
            let fresh = &buf.filled()[before..];
            if !fresh.is_empty() {
                self.buffer.extend_from_slice(fresh);
            }
        }

        Poll::Ready(Ok(()))
    }
}

/// A connection whose reads can be sniffed and replayed.
#[derive(Debug)]
pub struct SniffedConn<S> {
    inner: S,
    buffer: SniffBuffer,
}

impl<S> SniffedConn<S> {
    /// Wrap a connection. Nothing is recorded until `start_sniffing`.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: SniffBuffer::default(),
        }
    }

    /// Start recording reads and return a reader for detection logic.
    ///
    /// Bytes pulled through the returned reader (or through the connection
    /// itself) are replayed after [`done_sniffing`](Self::done_sniffing).
    pub fn start_sniffing(&mut self) -> Sniff<'_, S> {
        self.buffer.reset(true);
        Sniff { conn: self }
    }

    /// Stop recording and arm replay of everything recorded so far.
    pub fn done_sniffing(&mut self) {
        self.buffer.reset(false);
    }

    /// Returns true while reads are being recorded.
    pub fn is_sniffing(&self) -> bool {
        self.buffer.sniffing
    }

    /// Bytes recorded and not yet released.
    pub fn peeked(&self) -> &[u8] {
        &self.buffer.buffer
    }

    /// Bytes still waiting to be replayed.
    pub fn replay_pending(&self) -> usize {
        self.buffer.size.saturating_sub(self.buffer.read)
    }

    /// Shared access to the connection.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Direct access to the connection. Reads made through it bypass the
    /// sniff buffer.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl SniffedConn<TcpStream> {
    /// Remote address of the underlying socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Local address of the underlying socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SniffedConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.buffer.poll_read_from(&mut this.inner, cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SniffedConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Reader handed to detection logic by [`SniffedConn::start_sniffing`].
#[derive(Debug)]
pub struct Sniff<'a, S> {
    conn: &'a mut SniffedConn<S>,
}

impl<S> Sniff<'_, S> {
    /// Bytes recorded so far.
    pub fn peeked(&self) -> &[u8] {
        self.conn.peeked()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Sniff<'_, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().conn).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;
    use tokio::io::AsyncReadExt;

    /// One scripted outcome of a source read.
    #[derive(Debug, Clone)]
    enum Step {
        Data(Vec<u8>),
        Fail(io::ErrorKind),
    }

    /// Source that replays a script, then reports EOF. Counts polls so tests
    /// can tell whether the source was touched.
    #[derive(Debug, Clone, Default)]
    struct Scripted {
        steps: Arc<Mutex<VecDeque<Step>>>,
        polls: Arc<Mutex<usize>>,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Arc::new(Mutex::new(steps.into())),
                polls: Arc::default(),
            }
        }

        fn push(&self, step: Step) {
            self.steps.lock().unwrap().push_back(step);
        }

        fn polls(&self) -> usize {
            *self.polls.lock().unwrap()
        }
    }

    impl AsyncRead for Scripted {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            *self.polls.lock().unwrap() += 1;
            let mut steps = self.steps.lock().unwrap();
            match steps.pop_front() {
                Some(Step::Data(mut data)) => {
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    if n < data.len() {
                        steps.push_front(Step::Data(data.split_off(n)));
                    }
                    Poll::Ready(Ok(()))
                }
                Some(Step::Fail(kind)) => Poll::Ready(Err(io::Error::new(kind, "scripted"))),
                None => Poll::Ready(Ok(())),
            }
        }
    }

    async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let n = reader.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn test_replay_after_sniffing() {
        let source = Scripted::new(vec![
            Step::Data(b"HEL".to_vec()),
            Step::Data(b"LO".to_vec()),
            Step::Data(b" WORLD".to_vec()),
        ]);
        let mut conn = SniffedConn::new(source.clone());

        let mut sniff = conn.start_sniffing();
        assert_eq!(read_chunk(&mut sniff, 16).await, b"HEL");
        assert_eq!(read_chunk(&mut sniff, 16).await, b"LO");
        assert_eq!(sniff.peeked(), b"HELLO");
        conn.done_sniffing();

        let polls = source.polls();
        assert_eq!(read_chunk(&mut conn, 16).await, b"HELLO");
        assert_eq!(source.polls(), polls, "replay must not touch the source");
        assert_eq!(conn.get_ref().polls(), polls);
        assert_eq!(read_chunk(&mut conn, 16).await, b" WORLD");
        assert!(conn.peeked().is_empty());
    }

    #[tokio::test]
    async fn test_replay_respects_small_reads() {
        let source = Scripted::new(vec![Step::Data(b"abcdef".to_vec())]);
        let mut conn = SniffedConn::new(source);

        let mut sniff = conn.start_sniffing();
        assert_eq!(read_chunk(&mut sniff, 6).await, b"abcdef");
        conn.done_sniffing();

        assert_eq!(conn.replay_pending(), 6);
        assert_eq!(read_chunk(&mut conn, 4).await, b"abcd");
        assert_eq!(conn.replay_pending(), 2);
        assert_eq!(read_chunk(&mut conn, 4).await, b"ef");
        assert_eq!(conn.replay_pending(), 0);
    }

    #[tokio::test]
    async fn test_empty_sniff_is_noop() {
        let source = Scripted::new(vec![Step::Data(b"data".to_vec())]);
        let mut conn = SniffedConn::new(source);

        drop(conn.start_sniffing());
        conn.done_sniffing();

        assert!(!conn.is_sniffing());
        assert_eq!(conn.buffer.buffer.capacity(), 0);
        assert_eq!(read_chunk(&mut conn, 16).await, b"data");
        assert_eq!(conn.buffer.buffer.capacity(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_not_recorded() {
        let source = Scripted::new(vec![
            Step::Data(b"ok".to_vec()),
            Step::Fail(io::ErrorKind::WouldBlock),
        ]);
        let mut conn = SniffedConn::new(source.clone());

        let mut sniff = conn.start_sniffing();
        assert_eq!(read_chunk(&mut sniff, 8).await, b"ok");
        let mut buf = [0u8; 8];
        let err = sniff.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        conn.done_sniffing();

        source.push(Step::Data(b"later".to_vec()));
        assert_eq!(read_chunk(&mut conn, 8).await, b"ok");
        assert_eq!(read_chunk(&mut conn, 8).await, b"later");
    }

    #[tokio::test]
    async fn test_eof_reobserved_after_replay() {
        let source = Scripted::new(vec![Step::Data(b"bye".to_vec())]);
        let mut conn = SniffedConn::new(source);

        let mut sniff = conn.start_sniffing();
        assert_eq!(read_chunk(&mut sniff, 8).await, b"bye");
        assert!(read_chunk(&mut sniff, 8).await.is_empty());
        conn.done_sniffing();

        assert_eq!(read_chunk(&mut conn, 8).await, b"bye");
        assert!(read_chunk(&mut conn, 8).await.is_empty());
    }

    #[tokio::test]
    async fn test_resniff_during_replay_keeps_earlier_bytes() {
        let source = Scripted::new(vec![Step::Data(b"one".to_vec()), Step::Data(b"two".to_vec())]);
        let mut conn = SniffedConn::new(source);

        let mut sniff = conn.start_sniffing();
        assert_eq!(read_chunk(&mut sniff, 3).await, b"one");
        conn.done_sniffing();

        // A second session starts before the first replay drained.
        let mut sniff = conn.start_sniffing();
        assert_eq!(read_chunk(&mut sniff, 8).await, b"one");
        assert_eq!(read_chunk(&mut sniff, 8).await, b"two");
        conn.done_sniffing();

        assert_eq!(read_chunk(&mut conn, 16).await, b"onetwo");
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut conn = SniffedConn::new(client);
        drop(conn.start_sniffing());

        tokio::io::AsyncWriteExt::write_all(&mut conn, b"ping")
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(conn.peeked().is_empty());
    }

    #[tokio::test]
    async fn test_interleaved_io_after_replay() {
        let source = tokio_test::io::Builder::new()
            .read(b"GET ")
            .write(b"HTTP/1.0 200 OK\r\n")
            .read(b"/index")
            .build();
        let mut conn = SniffedConn::new(source);

        let mut sniff = conn.start_sniffing();
        assert_eq!(read_chunk(&mut sniff, 16).await, b"GET ");
        conn.done_sniffing();

        assert_eq!(read_chunk(&mut conn, 16).await, b"GET ");
        tokio::io::AsyncWriteExt::write_all(&mut conn, b"HTTP/1.0 200 OK\r\n")
            .await
            .unwrap();
        assert_eq!(read_chunk(&mut conn, 16).await, b"/index");
    }

    fn chunks() -> impl Strategy<Value = Vec<Vec<u8>>> {
        prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 0..8)
    }

    proptest! {
        #[test]
        fn prop_replay_reproduces_sniffed_reads(
            sniffed in chunks(),
            live in chunks(),
            read_len in 1usize..48,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let steps = sniffed.iter().chain(live.iter()).cloned().map(Step::Data).collect();
                let mut conn = SniffedConn::new(Scripted::new(steps));

                let mut observed = Vec::new();
                let mut sniff = conn.start_sniffing();
                for _ in 0..sniffed.len() {
                    observed.extend(read_chunk(&mut sniff, read_len).await);
                }
                conn.done_sniffing();

                let mut replayed = Vec::new();
                while replayed.len() < observed.len() {
                    replayed.extend(read_chunk(&mut conn, read_len).await);
                }
                prop_assert_eq!(&replayed, &observed);

                let mut rest = Vec::new();
                loop {
                    let chunk = read_chunk(&mut conn, read_len).await;
                    if chunk.is_empty() {
                        break;
                    }
                    rest.extend(chunk);
                }
                let all: Vec<u8> = sniffed.concat().into_iter().chain(live.concat()).collect();
                prop_assert_eq!(&all[observed.len()..], &rest[..]);
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
