//! Session logic shared by the async and the blocking connection: handshake
//! parsing, state tracking and inbound line routing.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::{EventRegistry, Sink};
use crate::protocol::{self, Command, Line, CONNECTED_MARKER, STARTED_MARKER};

/// Protocol revision assumed when the server does not advertise one
pub const DEFAULT_PROTOCOL: u32 = 1;

/// Line buffer assumed when the server does not advertise one
pub const DEFAULT_BUFFER_SIZE: usize = 20_000;

/// Handshake progress of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Connecting,
  AwaitingGreeting,
  AwaitingStart,
  Ready,
  Closed,
}

impl SessionState {
  pub fn ensure_ready(self) -> Result<()> {
    match self {
      SessionState::Ready => Ok(()),
      other => Err(Error::Protocol(format!(
        "connection not ready for commands ({:?})",
        other
      ))),
    }
  }
}

/// Values advertised in the `STARTED` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
  pub protocol: u32,
  pub buffer_size: usize,
}

impl Default for Negotiated {
  fn default() -> Self {
    Self {
      protocol: DEFAULT_PROTOCOL,
      buffer_size: DEFAULT_BUFFER_SIZE,
    }
  }
}

impl Negotiated {
  /// Largest free-text piece that keeps a line built on `overhead` within
  /// the server buffer.
  pub fn text_budget(&self, overhead: usize, text: &str) -> usize {
    let mut budget = self.buffer_size.saturating_sub(overhead).max(1);
    // A piece ending in a backslash is quoted with one extra space.
    if text.contains('\\') {
      budget = budget.saturating_sub(1).max(1);
    }
    // Each double quote grows to two bytes once escaped.
    if text.contains('"') {
      budget = (budget / 2).max(1);
    }
    budget
  }
}

/// Encode `command` once per piece of `text`, keeping every line within the
/// negotiated buffer.
pub fn chunked_lines<'a>(command: &Command<'a>, text: &'a str, negotiated: &Negotiated) -> Vec<String> {
  let overhead = command.with_text("").encode().len();
  let budget = negotiated.text_budget(overhead, text);
  protocol::split_text(text, budget)
    .into_iter()
    .map(|chunk| command.with_text(chunk).encode())
    .collect()
}

/// Form of an outbound line safe to log: the START password is masked.
pub fn loggable(line: &str) -> String {
  let line = line.trim_end();
  match line.strip_prefix("START ") {
    Some(rest) => {
      let channel = rest.split_whitespace().next().unwrap_or_default();
      format!("START {} ****", channel)
    }
    None => line.to_string(),
  }
}

/// Check the server greeting.
pub fn parse_greeting(line: &str) -> Result<()> {
  if line.split_whitespace().any(|t| t == CONNECTED_MARKER) {
    Ok(())
  } else {
    Err(Error::Protocol(line.trim_end().to_string()))
  }
}

fn protocol_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"(?i)\bPROTOCOL\((\d+)\)").expect("static regex"))
}

fn buffer_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"(?i)\bBUFFER\((\d+)\)").expect("static regex"))
}

/// Parse the reply to START. Missing or malformed modifiers keep defaults.
pub fn parse_started(line: &str) -> Result<Negotiated> {
  let reply = match protocol::classify(line)? {
    Line::Error(message) => return Err(Error::Server(message)),
    Line::Event(_) => return Err(Error::Protocol(line.trim_end().to_string())),
    Line::Reply(reply) => reply,
  };
  if reply.split_whitespace().next() != Some(STARTED_MARKER) {
    return Err(Error::Protocol(reply));
  }

  let mut negotiated = Negotiated::default();
  if let Some(n) = protocol_re()
    .captures(&reply)
    .and_then(|c| c[1].parse().ok())
  {
    negotiated.protocol = n;
  }
  if let Some(n) = buffer_re().captures(&reply).and_then(|c| c[1].parse().ok()) {
    negotiated.buffer_size = n;
  }
  Ok(negotiated)
}

/// Routes inbound lines: events to the registry, everything else back to the
/// command holding the wire.
#[derive(Debug, Default)]
pub struct Demux {
  registry: EventRegistry,
  armed: Option<Sink>,
}

impl Demux {
  pub fn new() -> Self {
    Self::default()
  }

  /// Attach the sink of an event-producing command before it is written.
  /// It is registered when the `PENDING` acknowledgment is routed.
  pub fn arm(&mut self, sink: Sink) {
    self.armed = Some(sink);
  }

  /// Drop an armed sink whose command never reached the wire.
  pub fn disarm(&mut self) {
    self.armed = None;
  }

  /// Returns `None` when the line was an event and the wait goes on.
  pub fn route(&mut self, raw: &str) -> Option<Result<String>> {
    let line = match protocol::classify(raw) {
      Ok(line) => line,
      Err(e) => {
        warn!(error = %e, "dropping malformed event line");
        return None;
      }
    };

    match line {
      Line::Event(event) => {
        debug!(event_id = %event.id, kind = %event.kind, "event received");
        if !self.registry.deliver(&event.id, event.payload) {
          warn!(event_id = %event.id, "dropping event with no waiter");
        }
        None
      }
      Line::Error(message) => {
        self.armed = None;
        Some(Err(Error::Server(message)))
      }
      Line::Reply(reply) => {
        if let Some(sink) = self.armed.take() {
          let registered =
            protocol::pending_id(&reply).and_then(|id| self.registry.register(id, sink));
          if let Err(e) = registered {
            return Some(Err(e));
          }
        }
        Some(Ok(reply))
      }
    }
  }

  pub fn pending_events(&self) -> usize {
    self.registry.len()
  }

  /// Forget every waiter, e.g. when the connection goes away.
  pub fn close(&mut self) {
    self.armed = None;
    self.registry.clear();
  }
}
