//! Bidirectional chat over one stream.
//!
//! A session runs two independent loops: inbound lines are rendered, local
//! input is written out. When either loop stops the whole session stops; the
//! other loop is cancelled and the stream is dropped.

use crate::session::{ConsoleEvent, SessionIo};
use crate::transport::framer::{self, LineReader, LineWriter};
use crate::utils::StreamError;
use chrono::{DateTime, Utc};
use futures::io::{AsyncRead, AsyncWrite};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Upper bound for flushing and closing the outbound direction
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Session identifier
pub type SessionId = Uuid;

/// Which side opened the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Opened by the remote peer
    Inbound,
    /// Opened by this node
    Outbound,
}

/// Why a loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The remote side ended the stream
    PeerClosed,
    /// Local input ended
    InputClosed,
    /// The session was shut down
    Cancelled,
    /// Reading or writing failed
    Failed(StreamError),
    /// The loop task panicked
    Aborted(String),
}

impl LoopExit {
    /// Whether this exit counts as a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, LoopExit::Failed(_) | LoopExit::Aborted(_))
    }
}

/// How both loops of a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Exit of the loop rendering remote lines
    pub inbound: LoopExit,
    /// Exit of the loop sending local input
    pub outbound: LoopExit,
}

impl SessionOutcome {
    /// First stream failure, if any
    pub fn error(&self) -> Option<&StreamError> {
        [&self.inbound, &self.outbound]
            .into_iter()
            .find_map(|exit| match exit {
                LoopExit::Failed(e) => Some(e),
                _ => None,
            })
    }
}

/// A running chat session
pub struct ChatSession {
    id: SessionId,
    peer: PeerId,
    direction: Direction,
    opened_at: DateTime<Utc>,
    shutdown: Arc<watch::Sender<bool>>,
    finished: watch::Receiver<bool>,
    task: JoinHandle<SessionOutcome>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("opened_at", &self.opened_at)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl ChatSession {
    /// Start both loops over `stream`
    pub fn start<S>(stream: S, peer: PeerId, direction: Direction, io: SessionIo) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);
        let (finished_tx, finished) = watch::channel(false);

        let signal = Arc::clone(&shutdown);
        let task = tokio::spawn(async move {
            let SessionIo { input, output } = io;
            let _ = output.send(ConsoleEvent::SessionOpened { peer, direction });
            log::info!("Session {} with {} opened ({:?})", id, peer, direction);

            let (reader, writer) = framer::split(stream);
            let mut inbound = tokio::spawn(inbound_loop(
                reader,
                peer,
                output.clone(),
                shutdown_rx.clone(),
            ));
            let mut outbound = tokio::spawn(outbound_loop(writer, input, shutdown_rx));

            let first = tokio::select! {
                exit = &mut inbound => Finished::Inbound(joined(exit)),
                exit = &mut outbound => Finished::Outbound(joined(exit)),
            };
            signal.send_replace(true);

            let outcome = match first {
                Finished::Inbound(exit) => SessionOutcome {
                    inbound: exit,
                    outbound: joined(outbound.await),
                },
                Finished::Outbound(exit) => SessionOutcome {
                    inbound: joined(inbound.await),
                    outbound: exit,
                },
            };

            match outcome.error() {
                Some(e) => log::warn!("Session {} with {} failed: {}", id, peer, e),
                None => log::info!("Session {} with {} closed", id, peer),
            }
            let _ = output.send(ConsoleEvent::SessionClosed { peer, direction });
            let _ = finished_tx.send(true);
            outcome
        });

        Self {
            id,
            peer,
            direction,
            opened_at: Utc::now(),
            shutdown,
            finished,
            task,
        }
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote peer
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Which side opened the stream
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// When the session started
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Whether both loops have stopped
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow() || self.task.is_finished()
    }

    /// Resolves once the session has stopped
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut finished = self.finished.clone();
        async move {
            while !*finished.borrow_and_update() {
                if finished.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Ask both loops to stop without waiting
    pub fn cancel(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stop the session and wait up to `timeout` for it to wind down.
    ///
    /// Returns `None` if the session did not stop in time and was aborted.
    pub async fn close(mut self, timeout: Duration) -> Option<SessionOutcome> {
        self.cancel();
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                log::warn!("Session {} task failed: {}", self.id, e);
                None
            }
            Err(_) => {
                log::warn!("Session {} did not stop within {:?}", self.id, timeout);
                self.task.abort();
                None
            }
        }
    }

    /// Wait for the session to stop on its own
    pub async fn wait(self) -> Option<SessionOutcome> {
        self.task.await.ok()
    }
}

enum Finished {
    Inbound(LoopExit),
    Outbound(LoopExit),
}

fn joined(result: Result<LoopExit, tokio::task::JoinError>) -> LoopExit {
    result.unwrap_or_else(|e| LoopExit::Aborted(e.to_string()))
}

/// Resolves once shutdown has been requested or every requester is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn inbound_loop<R>(
    mut reader: LineReader<R>,
    peer: PeerId,
    output: mpsc::UnboundedSender<ConsoleEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> LoopExit
where
    R: AsyncRead + Unpin,
{
    loop {
        let line = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return LoopExit::Cancelled,
            line = reader.read_line() => line,
        };

        match line {
            // Blank lines carry nothing to show.
            Ok(content) if content.is_empty() => continue,
            Ok(content) => {
                if output.send(ConsoleEvent::Message { peer, content }).is_err() {
                    return LoopExit::Cancelled;
                }
            }
            Err(StreamError::Closed) => {
                log::debug!("{} closed its side of the stream", peer);
                return LoopExit::PeerClosed;
            }
            Err(e) => return LoopExit::Failed(e),
        }
    }
}

async fn outbound_loop<W>(
    mut writer: LineWriter<W>,
    mut input: broadcast::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) -> LoopExit
where
    W: AsyncWrite + Unpin,
{
    let exit = loop {
        let line = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break LoopExit::Cancelled,
            received = input.recv() => match received {
                Ok(line) => line,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Session fell behind, {} input line(s) skipped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break LoopExit::InputClosed,
            },
        };

        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break LoopExit::Cancelled,
            written = writer.write_line(&line) => match written {
                Ok(()) => {}
                Err(StreamError::EmbeddedDelimiter) => {
                    log::warn!("Input line contains a newline, not sent");
                }
                Err(e) => break LoopExit::Failed(e),
            },
        }
    };

    match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("Closing outbound direction failed: {}", e),
        Err(_) => log::debug!("Closing outbound direction timed out"),
    }
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Console;
    use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

    type Remote = (
        LineReader<futures::io::ReadHalf<Compat<tokio::io::DuplexStream>>>,
        LineWriter<futures::io::WriteHalf<Compat<tokio::io::DuplexStream>>>,
    );

    fn start_session(
        console: &Console,
        direction: Direction,
    ) -> (ChatSession, Remote, PeerId) {
        let (local, remote) = tokio::io::duplex(4096);
        let peer = PeerId::random();
        let session = ChatSession::start(local.compat(), peer, direction, console.session_io());
        (session, framer::split(remote.compat()), peer)
    }

    async fn next_message(events: &mut mpsc::UnboundedReceiver<ConsoleEvent>) -> Option<String> {
        loop {
            match events.recv().await? {
                ConsoleEvent::Message { content, .. } => return Some(content),
                ConsoleEvent::SessionOpened { .. } => continue,
                ConsoleEvent::SessionClosed { .. } => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_inbound_lines_rendered_once_in_order() {
        let (console, mut events) = Console::new(8);
        let (session, (_, mut remote_writer), peer) = start_session(&console, Direction::Inbound);

        remote_writer.write_line("hello").await.unwrap();
        remote_writer.write_line("").await.unwrap();
        remote_writer.write_line("bye").await.unwrap();

        assert_eq!(
            events.recv().await,
            Some(ConsoleEvent::SessionOpened {
                peer,
                direction: Direction::Inbound
            })
        );
        assert_eq!(next_message(&mut events).await.as_deref(), Some("hello"));
        assert_eq!(next_message(&mut events).await.as_deref(), Some("bye"));

        let outcome = session.close(Duration::from_secs(2)).await.unwrap();
        assert!(outcome.error().is_none());
    }

    #[tokio::test]
    async fn test_local_input_written_to_stream() {
        let (console, _events) = Console::new(8);
        let (session, (mut remote_reader, _), _) = start_session(&console, Direction::Outbound);

        assert_eq!(console.submit("hi there"), 1);
        assert_eq!(remote_reader.read_line().await.unwrap(), "hi there");

        session.close(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_ends_whole_session() {
        let (console, mut events) = Console::new(8);
        let (session, remote, peer) = start_session(&console, Direction::Inbound);
        drop(remote);

        let outcome = tokio::time::timeout(Duration::from_secs(2), session.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.inbound, LoopExit::PeerClosed);
        assert_eq!(outcome.outbound, LoopExit::Cancelled);
        assert!(outcome.error().is_none());

        let mut last = None;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), events.recv()).await
        {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(ConsoleEvent::SessionClosed {
                peer,
                direction: Direction::Inbound
            })
        );
    }

    #[tokio::test]
    async fn test_input_closed_ends_whole_session() {
        let (console, _events) = Console::new(8);
        let (session, (mut remote_reader, _remote_writer), _) =
            start_session(&console, Direction::Outbound);

        console.submit("last words");
        assert_eq!(remote_reader.read_line().await.unwrap(), "last words");
        console.close_input();

        let outcome = tokio::time::timeout(Duration::from_secs(2), session.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.outbound, LoopExit::InputClosed);
        assert_eq!(outcome.inbound, LoopExit::Cancelled);
        assert_eq!(remote_reader.read_line().await, Err(StreamError::Closed));
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_input_is_clean() {
        let (console, _events) = Console::new(8);
        let (session, _remote, _) = start_session(&console, Direction::Outbound);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_finished());

        let outcome = session.close(Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome.inbound, LoopExit::Cancelled);
        assert_eq!(outcome.outbound, LoopExit::Cancelled);
        assert!(!outcome.inbound.is_failure());
    }

    #[tokio::test]
    async fn test_read_failure_is_reported() {
        let (console, _events) = Console::new(8);
        let mock = tokio_test::io::Builder::new()
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let session = ChatSession::start(
            mock.compat(),
            PeerId::random(),
            Direction::Inbound,
            console.session_io(),
        );

        let outcome = tokio::time::timeout(Duration::from_secs(2), session.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome.error(), Some(StreamError::Read { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_sessions_do_not_interleave() {
        let (console_a, _events_a) = Console::new(256);
        let (console_b, _events_b) = Console::new(256);
        let (session_a, (mut reader_a, _wa), _) = start_session(&console_a, Direction::Outbound);
        let (session_b, (mut reader_b, _wb), _) = start_session(&console_b, Direction::Outbound);

        let line_a = "A".repeat(1000);
        let line_b = "B".repeat(1000);
        let feed_a = {
            let (console, line) = (console_a.clone(), line_a.clone());
            tokio::spawn(async move {
                for _ in 0..50 {
                    console.submit(line.clone());
                    tokio::task::yield_now().await;
                }
            })
        };
        let feed_b = {
            let (console, line) = (console_b.clone(), line_b.clone());
            tokio::spawn(async move {
                for _ in 0..50 {
                    console.submit(line.clone());
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..50 {
            assert_eq!(reader_a.read_line().await.unwrap(), line_a);
            assert_eq!(reader_b.read_line().await.unwrap(), line_b);
        }
        feed_a.await.unwrap();
        feed_b.await.unwrap();

        session_a.close(Duration::from_secs(2)).await.unwrap();
        session_b.close(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_future_resolves_after_stop() {
        let (console, _events) = Console::new(8);
        let (session, remote, _) = start_session(&console, Direction::Inbound);
        let closed = session.closed();

        drop(remote);
        tokio::time::timeout(Duration::from_secs(2), closed)
            .await
            .unwrap();
        assert!(session.is_finished());
    }
}
