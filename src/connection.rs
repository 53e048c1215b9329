//! Connection handler lifecycle.
//!
//! One handler task per registered session:
//!
//! ```text
//! Connecting -> Registered -> Active -> Closing -> Closed
//!      \                                  ^
//!       `-------- (registry full) --------'
//! ```
//!
//! The dispatcher performs `Connecting -> Registered` (or rejects the
//! connection). The handler then welcomes the session, announces it, and
//! loops: lines read from the peer go to the command interpreter, lines
//! queued on the session's inbox go out to the peer. The loop ends on
//! `/quit`, EOF, an I/O error, or a hang-up from the registry.
//!
//! Leaving the registry is tied to a drop guard so it happens exactly once
//! even if the task unwinds. A peer that stops reading cannot pin its slot:
//! every write races the hang-up, and output still pending once the
//! session is closing gets at most [`FLUSH_TIMEOUT`].

use crate::commands::{interpret, Flow};
use crate::protocol::Reply;
use crate::registry::Registry;
use crate::session::{Inbox, SlotId};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, info, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 1024;

/// Longest line accepted from a client, in bytes, not counting the line
/// ending. The rest of a longer line is discarded.
pub const MAX_LINE_LEN: usize = 1024;

/// How long a closing session may spend writing what is left for its peer.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, not yet in the registry.
    Connecting,
    /// Holds a registry slot.
    Registered,
    /// Welcomed and announced; exchanging lines.
    Active,
    /// Slot released, departure announced; flushing output.
    Closing,
    /// Terminal.
    Closed,
}

/// A handler's hold on its registry slot.
struct Membership {
    slot: SlotId,
    registry: Arc<Registry>,
    state: ConnState,
}

impl Membership {
    fn new(slot: SlotId, registry: Arc<Registry>) -> Self {
        Membership {
            slot,
            registry,
            state: ConnState::Registered,
        }
    }

    fn transition(&mut self, next: ConnState) {
        trace!(slot = %self.slot, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    /// Welcome the session and announce it to everyone else.
    fn activate(&mut self) {
        if let Some(name) = self.registry.name_of(self.slot) {
            self.registry.send_to(self.slot, &Reply::welcome(&name));
            self.registry
                .broadcast(&Reply::joined(&name), Some(self.slot));
            info!(
                slot = %self.slot,
                name = %name,
                online = self.registry.count_active(),
                "Client joined"
            );
        }
        self.transition(ConnState::Active);
    }

    /// Release the slot and announce the departure. Does nothing after the
    /// first call. No notice is sent if the slot was already freed (forced
    /// shutdown).
    fn close(&mut self) {
        if matches!(self.state, ConnState::Closing | ConnState::Closed) {
            return;
        }
        self.transition(ConnState::Closing);
        if let Some(name) = self.registry.remove(self.slot) {
            self.registry.broadcast(&Reply::left(&name), None);
            info!(
                slot = %self.slot,
                name = %name,
                online = self.registry.count_active(),
                "Client left"
            );
        }
    }

    fn finish(&mut self) {
        self.close();
        self.transition(ConnState::Closed);
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reads newline-terminated lines of at most [`MAX_LINE_LEN`] bytes.
struct LineReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
    truncated: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: R) -> Self {
        LineReader {
            inner: BufReader::with_capacity(BUFFER_SIZE, reader),
            line: Vec::with_capacity(BUFFER_SIZE),
            truncated: false,
        }
    }

    /// Next line without its `\n`, or `None` at end of stream. A final
    /// line with no newline is still returned.
    ///
    /// Cancel safe: bytes already taken from the stream stay in `line`
    /// for the next call.
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.line.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let content = newline.unwrap_or(available.len());
            let keep = content.min(MAX_LINE_LEN.saturating_sub(self.line.len()));
            self.line.extend_from_slice(&available[..keep]);
            self.truncated |= keep < content;

            let used = newline.map_or(content, |i| i + 1);
            self.inner.consume(used);
            if newline.is_some() {
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> String {
        if self.truncated {
            // Don't leave half a character at the cut
            if let Err(e) = std::str::from_utf8(&self.line) {
                if e.error_len().is_none() {
                    self.line.truncate(e.valid_up_to());
                }
            }
            debug!(kept = self.line.len(), "Line too long, truncated");
            self.truncated = false;
        }
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        line
    }
}

/// Drive one registered session until it ends.
///
/// `inbox` must be the receiving half of the outbox registered under
/// `slot`. Returns the I/O error that ended the session, if any; a peer
/// that stopped reading ends it with [`io::ErrorKind::TimedOut`].
pub async fn handle_connection<S>(
    stream: S,
    slot: SlotId,
    mut inbox: Inbox,
    registry: Arc<Registry>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = LineReader::new(reader);

    let mut membership = Membership::new(slot, registry);
    membership.activate();

    let result = loop {
        tokio::select! {
            read = reader.next_line() => match read {
                Ok(None) => {
                    trace!(%slot, "Connection closed by client");
                    break Ok(());
                }
                Ok(Some(line)) => {
                    if interpret(&membership.registry, slot, &line) == Flow::Quit {
                        trace!(%slot, "Client quit");
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            },
            outgoing = inbox.next() => match outgoing {
                Some(text) => {
                    let write = writer.write_all(text.as_bytes());
                    tokio::pin!(write);
                    tokio::select! {
                        biased;
                        written = &mut write => {
                            if let Err(e) = written {
                                break Err(e);
                            }
                        }
                        _ = inbox.hung_up() => {
                            trace!(%slot, "Hung up by server while writing");
                            membership.close();
                            // Let the line in flight finish if the peer is
                            // still reading (e.g. the shutdown notice).
                            break match timeout(FLUSH_TIMEOUT, write).await {
                                Ok(Ok(())) => Ok(()),
                                Ok(Err(e)) => Err(e),
                                Err(_) => Err(stalled()),
                            };
                        }
                    }
                }
                None => {
                    trace!(%slot, "Hung up by server");
                    break Ok(());
                }
            },
        }
    };

    membership.close();

    // Flush anything queued before the hang-up (e.g. the shutdown notice).
    let result = match result {
        Ok(()) => {
            let flush = async {
                for text in inbox.drain() {
                    writer.write_all(text.as_bytes()).await?;
                }
                writer.shutdown().await
            };
            match timeout(FLUSH_TIMEOUT, flush).await {
                Ok(_) => Ok(()),
                Err(_) => Err(stalled()),
            }
        }
        Err(e) => Err(e),
    };

    membership.finish();
    result
}

fn stalled() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "peer stopped reading")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{self, test_peer, Session};
    use std::time::Duration;
    use tokio::io::{DuplexStream, Lines, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    const WAIT: Duration = Duration::from_secs(2);

    struct Client {
        slot: SlotId,
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
        task: JoinHandle<io::Result<()>>,
    }

    impl Client {
        async fn connect(registry: &Arc<Registry>) -> Self {
            let (local, remote) = tokio::io::duplex(4096);
            let (outbox, inbox) = session::channel(16);
            let slot = registry
                .try_register(Session::new(test_peer(), outbox))
                .unwrap();
            let task = tokio::spawn(handle_connection(
                remote,
                slot,
                inbox,
                Arc::clone(registry),
            ));
            let (read, writer) = tokio::io::split(local);
            let mut client = Client {
                slot,
                lines: BufReader::new(read).lines(),
                writer,
                task,
            };
            // Skip the welcome block
            let first = client.line().await;
            assert!(first.starts_with("欢迎来到聊天室"));
            for _ in 0..6 {
                client.line().await;
            }
            client
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn line(&mut self) -> String {
            timeout(WAIT, self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap()
                .expect("connection closed")
        }

        async fn expect_eof(&mut self) {
            let next = timeout(WAIT, self.lines.next_line()).await.unwrap();
            assert!(matches!(next, Ok(None)), "expected EOF, got {next:?}");
        }
    }

    /// A session registered without a handler, for inspecting what it is sent.
    fn observer(registry: &Registry) -> (SlotId, Inbox) {
        let (outbox, inbox) = session::channel(16);
        let slot = registry
            .try_register(Session::new(test_peer(), outbox))
            .unwrap();
        (slot, inbox)
    }

    async fn next(inbox: &mut Inbox) -> Option<String> {
        timeout(WAIT, inbox.next()).await.unwrap()
    }

    #[tokio::test]
    async fn test_join_is_announced_to_others() {
        let registry = Registry::new(4);
        let (_, mut watcher) = observer(&registry);

        let client = Client::connect(&registry).await;
        assert_eq!(client.slot.index(), 1);
        assert_eq!(next(&mut watcher).await.as_deref(), Some("[系统] 用户2 加入了聊天室\n"));
    }

    #[tokio::test]
    async fn test_quit_frees_slot_and_announces_departure() {
        let registry = Registry::new(4);
        let (_, mut watcher) = observer(&registry);
        let mut client = Client::connect(&registry).await;
        next(&mut watcher).await;

        client.send("/quit\r\n").await;
        client.expect_eof().await;
        assert_ok!(client.task.await.unwrap());

        assert_eq!(next(&mut watcher).await.as_deref(), Some("[系统] 用户2 离开了聊天室\n"));
        assert!(watcher.drain().is_empty());
        assert_eq!(registry.count_active(), 1);
        assert_eq!(registry.remove(client.slot), None);
    }

    #[tokio::test]
    async fn test_peer_drop_cleans_up_once() {
        let registry = Registry::new(4);
        let (_, mut watcher) = observer(&registry);
        let client = Client::connect(&registry).await;
        next(&mut watcher).await;

        let Client { task, lines, writer, .. } = client;
        drop(lines);
        drop(writer);
        let _ = task.await.unwrap();

        assert_eq!(next(&mut watcher).await.as_deref(), Some("[系统] 用户2 离开了聊天室\n"));
        assert!(watcher.drain().is_empty());
        assert_eq!(registry.count_active(), 1);
    }

    #[tokio::test]
    async fn test_crlf_is_stripped_before_broadcast() {
        let registry = Registry::new(4);
        let (_, mut watcher) = observer(&registry);
        let mut client = Client::connect(&registry).await;
        next(&mut watcher).await;

        client.send("hello\r\n").await;
        assert_eq!(next(&mut watcher).await.as_deref(), Some("[用户2]: hello\n"));
    }

    #[tokio::test]
    async fn test_chat_between_handlers() {
        let registry = Registry::new(4);
        let mut alice = Client::connect(&registry).await;
        let mut bob = Client::connect(&registry).await;
        assert_eq!(alice.line().await, "[系统] 用户2 加入了聊天室");

        bob.send("/msg 用户1 hi\n").await;
        assert_eq!(alice.line().await, "[私聊][用户2 -> 你]: hi");
        assert_eq!(bob.line().await, "[私聊][你 -> 用户1]: hi");

        alice.send("/msg\n").await;
        assert_eq!(alice.line().await, "[系统] 私聊格式错误！正确用法: /msg 用户名 消息内容");
    }

    #[tokio::test]
    async fn test_shutdown_notice_then_close() {
        let registry = Registry::new(4);
        let mut client = Client::connect(&registry).await;
        let (_, mut watcher) = observer(&registry);

        registry.shutdown(Reply::SERVER_SHUTDOWN);
        assert_eq!(client.line().await, "[系统] 服务器关闭");
        client.expect_eof().await;
        assert_ok!(client.task.await.unwrap());

        // Forced removal: nobody is told about the departure
        assert_eq!(watcher.drain(), vec![Reply::SERVER_SHUTDOWN.to_string()]);
        assert_eq!(registry.count_active(), 0);
    }

    #[tokio::test]
    async fn test_line_reader_caps_length() {
        let input = format!("{}\nnext\r\nlast", "你".repeat(400));
        let mut reader = LineReader::new(input.as_bytes());

        // Cut on a character boundary at or below the cap
        assert_eq!(reader.next_line().await.unwrap(), Some("你".repeat(341)));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("next\r"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("last"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_long_line_is_truncated_before_broadcast() {
        let registry = Registry::new(4);
        let (_, mut watcher) = observer(&registry);
        let mut client = Client::connect(&registry).await;
        next(&mut watcher).await;

        client.send(&format!("{}\n", "x".repeat(8 * 1024))).await;
        client.send("after\n").await;

        let expected = format!("[用户2]: {}\n", "x".repeat(MAX_LINE_LEN));
        assert_eq!(next(&mut watcher).await, Some(expected));
        assert_eq!(next(&mut watcher).await.as_deref(), Some("[用户2]: after\n"));
    }

    #[tokio::test]
    async fn test_stalled_reader_is_dropped_once() {
        let registry = Registry::new(2);
        let (watcher_slot, mut watcher) = observer(&registry);

        // Kept open but never read, so the welcome alone fills the pipe.
        let (_peer, remote) = tokio::io::duplex(64);
        let (outbox, inbox) = session::channel(2);
        let slot = registry
            .try_register(Session::new(test_peer(), outbox))
            .unwrap();
        let task = tokio::spawn(handle_connection(
            remote,
            slot,
            inbox,
            Arc::clone(&registry),
        ));
        assert_eq!(next(&mut watcher).await.as_deref(), Some("[系统] 用户2 加入了聊天室\n"));

        for i in 0..10 {
            registry.broadcast(&format!("line {i}\n"), Some(watcher_slot));
        }

        let result = timeout(FLUSH_TIMEOUT + WAIT, task)
            .await
            .expect("handler still running")
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);

        assert_eq!(next(&mut watcher).await.as_deref(), Some("[系统] 用户2 离开了聊天室\n"));
        assert!(watcher.drain().is_empty());
        assert_eq!(registry.count_active(), 1);
        assert_eq!(registry.remove(slot), None);

        let (outbox, _inbox) = session::channel(1);
        assert_ok!(registry.try_register(Session::new(test_peer(), outbox)));
    }
}
