//! Local console shared by all chat sessions.
//!
//! Standard input is read on a dedicated thread and fanned out to every live
//! session. Everything rendered to standard output goes through a single
//! renderer task, so concurrent sessions never interleave partial lines.

use crate::session::Direction;
use libp2p::PeerId;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};

const GREEN: &str = "\x1b[32m";
const RESET: &str = "\x1b[0m";
const PROMPT: &str = "> ";

/// Something to show the local user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// A line received from a peer
    Message {
        /// Sender
        peer: PeerId,
        /// Line content without the delimiter
        content: String,
    },
    /// A chat session started
    SessionOpened {
        /// Remote peer
        peer: PeerId,
        /// Who opened the stream
        direction: Direction,
    },
    /// A chat session ended
    SessionClosed {
        /// Remote peer
        peer: PeerId,
        /// Who opened the stream
        direction: Direction,
    },
}

/// Console channels handed to one session
pub struct SessionIo {
    /// Lines typed by the local user
    pub input: broadcast::Receiver<String>,
    /// Events to render
    pub output: mpsc::UnboundedSender<ConsoleEvent>,
}

/// Fan-out of local input and fan-in of session output
#[derive(Clone)]
pub struct Console {
    input: Arc<Mutex<Option<broadcast::Sender<String>>>>,
    output: mpsc::UnboundedSender<ConsoleEvent>,
}

impl Console {
    /// Create a console buffering up to `input_capacity` unread lines per
    /// session; the receiver yields everything sessions want rendered
    pub fn new(input_capacity: usize) -> (Self, mpsc::UnboundedReceiver<ConsoleEvent>) {
        let (input, _) = broadcast::channel(input_capacity.max(1));
        let (output, events) = mpsc::unbounded_channel();
        let console = Self {
            input: Arc::new(Mutex::new(Some(input))),
            output,
        };
        (console, events)
    }

    /// Channels for a new session
    ///
    /// The session only sees input submitted after this call. Once input is
    /// closed the returned receiver reports closed immediately.
    pub fn session_io(&self) -> SessionIo {
        let input = match self.lock_input().as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        };
        SessionIo {
            input,
            output: self.output.clone(),
        }
    }

    /// Hand one line of local input to every live session.
    ///
    /// Returns the number of sessions that received it.
    pub fn submit<S: Into<String>>(&self, line: S) -> usize {
        match self.lock_input().as_ref() {
            Some(sender) => sender.send(line.into()).unwrap_or(0),
            None => 0,
        }
    }

    /// End local input; every session's outbound loop finishes
    pub fn close_input(&self) {
        self.lock_input().take();
    }

    /// Whether local input has ended
    pub fn is_input_closed(&self) -> bool {
        self.lock_input().is_none()
    }

    /// Queue an event for rendering
    pub fn emit(&self, event: ConsoleEvent) {
        let _ = self.output.send(event);
    }

    /// Read standard input on a dedicated thread until end of input.
    ///
    /// The thread blocks in `read`, so it is detached rather than joined on
    /// shutdown.
    pub fn spawn_stdin_reader(&self) -> io::Result<std::thread::JoinHandle<()>> {
        let console = self.clone();
        std::thread::Builder::new()
            .name("console-stdin".to_string())
            .spawn(move || console.read_input(io::stdin().lock()))
    }

    /// Submit every line of `reader`, then close input.
    ///
    /// Bytes that are not valid UTF-8 are replaced rather than ending input;
    /// only end of input or a read error does that.
    pub fn read_input<R: BufRead>(&self, mut reader: R) {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                    }
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if self.submit(line) == 0 {
                        log::debug!("No open session, input dropped");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Failed to read standard input: {}", e);
                    break;
                }
            }
        }
        log::debug!("Standard input closed");
        self.close_input();
    }

    fn lock_input(&self) -> std::sync::MutexGuard<'_, Option<broadcast::Sender<String>>> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Write `event` the way the terminal shows it
pub fn render_event<W: Write>(out: &mut W, event: &ConsoleEvent) -> io::Result<()> {
    match event {
        ConsoleEvent::Message { content, .. } => {
            write!(out, "{GREEN}{content}{RESET}\n{PROMPT}")?;
        }
        ConsoleEvent::SessionOpened {
            peer,
            direction: Direction::Inbound,
        } => {
            write!(out, "Got a new stream from {peer}\n{PROMPT}")?;
        }
        ConsoleEvent::SessionOpened {
            peer,
            direction: Direction::Outbound,
        } => {
            write!(out, "Connected to {peer}\n{PROMPT}")?;
        }
        ConsoleEvent::SessionClosed { peer, .. } => {
            writeln!(out, "Session with {peer} closed")?;
        }
    }
    out.flush()
}

/// Render events to standard output until every sender is gone
pub async fn run_renderer(mut events: mpsc::UnboundedReceiver<ConsoleEvent>) {
    while let Some(event) = events.recv().await {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        if let Err(e) = render_event(&mut out, &event) {
            log::warn!("Failed to write to standard output: {}", e);
        }
    }
}
