//! Line codec for the Sonic channel protocol.
//!
//! Every frame is a single CRLF-terminated line of space separated tokens.
//! Free text travels as one double-quoted token; optional modifiers travel as
//! `NAME(value)` tokens.
//!
//! ```text
//! client: QUERY messages user:0dcde3a6 "valerian saliou" LIMIT(10) OFFSET(0)
//! server: PENDING Bt2m2gYa
//! server: EVENT QUERY Bt2m2gYa conversation:71f3d63b conversation:6501e83a
//! ```

use crate::error::{Error, Result};
use crate::options::Channel;

/// Line terminator for both directions
pub const LINE_TERMINATOR: &str = "\r\n";

/// Prefix of a server error line
pub const ERR_PREFIX: &str = "ERR ";

/// Prefix of an out-of-band event line
pub const EVENT_PREFIX: &str = "EVENT ";

/// Token the server greets with
pub const CONNECTED_MARKER: &str = "CONNECTED";

/// First token of the START acknowledgment
pub const STARTED_MARKER: &str = "STARTED";

/// First token of an event-producing command's acknowledgment
pub const PENDING_MARKER: &str = "PENDING";

/// Quote free text into a single protocol token.
///
/// The server only unescapes `\"`, so double quotes are escaped and
/// backslashes pass through untouched. CR and LF become spaces so the text
/// can never terminate the command line early. A trailing backslash gets a
/// space after it so it cannot escape the closing quote.
pub fn quote(text: &str) -> String {
  let mut out = String::with_capacity(text.len() + 3);
  out.push('"');
  for c in text.chars() {
    match c {
      '"' => out.push_str("\\\""),
      '\r' | '\n' => out.push(' '),
      c => out.push(c),
    }
  }
  if out.ends_with('\\') {
    out.push(' ');
  }
  out.push('"');
  out
}

/// Render an optional `NAME(value)` modifier. Empty values are omitted.
pub fn modifier(name: &str, value: Option<&str>) -> Option<String> {
  match value {
    Some(v) if !v.trim().is_empty() => Some(format!("{}({})", name, v.trim())),
    _ => None,
  }
}

/// Join a command token and its arguments into one wire line.
pub fn encode<S: AsRef<str>>(command: &str, args: &[S]) -> String {
  let mut line = String::from(command);
  for arg in args {
    let arg = arg.as_ref().trim();
    if arg.is_empty() {
      continue;
    }
    line.push(' ');
    line.push_str(arg);
  }
  let mut line = line.trim().to_string();
  line.push_str(LINE_TERMINATOR);
  line
}

/// A command the client can put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
  Start {
    channel: Channel,
    password: &'a str,
  },
  Ping,
  Quit,
  Help(&'a str),
  Push {
    collection: &'a str,
    bucket: &'a str,
    object: &'a str,
    text: &'a str,
    lang: Option<&'a str>,
  },
  Pop {
    collection: &'a str,
    bucket: &'a str,
    object: &'a str,
    text: &'a str,
  },
  Count {
    collection: &'a str,
    bucket: &'a str,
    object: Option<&'a str>,
  },
  FlushCollection {
    collection: &'a str,
  },
  FlushBucket {
    collection: &'a str,
    bucket: &'a str,
  },
  FlushObject {
    collection: &'a str,
    bucket: &'a str,
    object: &'a str,
  },
  Query {
    collection: &'a str,
    bucket: &'a str,
    terms: &'a str,
    limit: usize,
    offset: usize,
    lang: Option<&'a str>,
  },
  Suggest {
    collection: &'a str,
    bucket: &'a str,
    word: &'a str,
    limit: usize,
  },
  Trigger(Option<&'a str>),
}

impl<'a> Command<'a> {
  pub fn name(&self) -> &'static str {
    match self {
      Command::Start { .. } => "START",
      Command::Ping => "PING",
      Command::Quit => "QUIT",
      Command::Help(_) => "HELP",
      Command::Push { .. } => "PUSH",
      Command::Pop { .. } => "POP",
      Command::Count { .. } => "COUNT",
      Command::FlushCollection { .. } => "FLUSHC",
      Command::FlushBucket { .. } => "FLUSHB",
      Command::FlushObject { .. } => "FLUSHO",
      Command::Query { .. } => "QUERY",
      Command::Suggest { .. } => "SUGGEST",
      Command::Trigger(_) => "TRIGGER",
    }
  }

  /// Whether the server acknowledges with `PENDING <id>` and answers later
  /// through an EVENT line.
  pub fn produces_event(&self) -> bool {
    matches!(self, Command::Query { .. } | Command::Suggest { .. })
  }

  /// Replace the free-text argument, keeping everything else.
  pub fn with_text(&self, text: &'a str) -> Self {
    let mut cmd = self.clone();
    match &mut cmd {
      Command::Push { text: t, .. } | Command::Pop { text: t, .. } => *t = text,
      Command::Query { terms, .. } => *terms = text,
      Command::Suggest { word, .. } => *word = text,
      _ => {}
    }
    cmd
  }

  pub fn encode(&self) -> String {
    let args: Vec<String> = match self {
      Command::Start { channel, password } => {
        vec![channel.as_str().to_string(), password.to_string()]
      }
      Command::Ping | Command::Quit => Vec::new(),
      Command::Help(arg) => vec![arg.to_string()],
      Command::Push {
        collection,
        bucket,
        object,
        text,
        lang,
      } => {
        let mut args = vec![
          collection.to_string(),
          bucket.to_string(),
          object.to_string(),
          quote(text),
        ];
        args.extend(modifier("LANG", *lang));
        args
      }
      Command::Pop {
        collection,
        bucket,
        object,
        text,
      } => vec![
        collection.to_string(),
        bucket.to_string(),
        object.to_string(),
        quote(text),
      ],
      Command::Count {
        collection,
        bucket,
        object,
      } => {
        let mut args = vec![collection.to_string(), bucket.to_string()];
        args.extend(object.map(str::to_string));
        args
      }
      Command::FlushCollection { collection } => vec![collection.to_string()],
      Command::FlushBucket { collection, bucket } => {
        vec![collection.to_string(), bucket.to_string()]
      }
      Command::FlushObject {
        collection,
        bucket,
        object,
      } => vec![collection.to_string(), bucket.to_string(), object.to_string()],
      Command::Query {
        collection,
        bucket,
        terms,
        limit,
        offset,
        lang,
      } => {
        let mut args = vec![
          collection.to_string(),
          bucket.to_string(),
          quote(terms),
          format!("LIMIT({})", limit),
          format!("OFFSET({})", offset),
        ];
        args.extend(modifier("LANG", *lang));
        args
      }
      Command::Suggest {
        collection,
        bucket,
        word,
        limit,
      } => vec![
        collection.to_string(),
        bucket.to_string(),
        quote(word),
        format!("LIMIT({})", limit),
      ],
      Command::Trigger(action) => action.map(str::to_string).into_iter().collect(),
    };
    encode(self.name(), &args)
  }
}

/// Asynchronous result line: `EVENT <kind> <id> <payload>...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
  pub kind: String,
  pub id: String,
  pub payload: Vec<String>,
}

/// Classification of one inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
  Event(Event),
  Error(String),
  Reply(String),
}

/// Classify a line received from the server. The terminator may be present.
///
/// Fails only for an EVENT line that lacks its kind or id.
pub fn classify(raw: &str) -> Result<Line> {
  let line = raw.trim_end_matches(['\r', '\n']);

  if let Some(message) = line.strip_prefix(ERR_PREFIX) {
    return Ok(Line::Error(message.trim().to_string()));
  }

  if let Some(rest) = line.strip_prefix(EVENT_PREFIX) {
    let mut tokens = rest.split_whitespace();
    let (Some(kind), Some(id)) = (tokens.next(), tokens.next()) else {
      return Err(Error::Protocol(line.to_string()));
    };
    return Ok(Line::Event(Event {
      kind: kind.to_string(),
      id: id.to_string(),
      payload: tokens.map(str::to_string).collect(),
    }));
  }

  Ok(Line::Reply(line.trim().to_string()))
}

/// `true` when the reply is exactly the expected literal.
pub fn is_literal(reply: &str, literal: &str) -> bool {
  reply.trim() == literal
}

/// Count carried as the second token, as in `RESULT 42`.
pub fn count_from_second(reply: &str) -> Result<u64> {
  reply
    .split_whitespace()
    .nth(1)
    .and_then(|t| t.parse().ok())
    .ok_or_else(|| Error::NumericParse(reply.to_string()))
}

/// Count carried as the last token.
pub fn count_from_last(reply: &str) -> Result<u64> {
  reply
    .split_whitespace()
    .last()
    .and_then(|t| t.parse().ok())
    .ok_or_else(|| Error::NumericParse(reply.to_string()))
}

/// Event id out of a `PENDING <id>` acknowledgment.
pub fn pending_id(reply: &str) -> Result<String> {
  let mut tokens = reply.split_whitespace();
  match (tokens.next(), tokens.last()) {
    (Some(PENDING_MARKER), Some(id)) => Ok(id.to_string()),
    _ => Err(Error::Protocol(reply.to_string())),
  }
}

/// Split free text into pieces of at most `max_bytes`, cutting on whitespace
/// when possible and never inside a UTF-8 sequence.
pub fn split_text(text: &str, max_bytes: usize) -> Vec<&str> {
  let max = max_bytes.max(1);
  let mut chunks = Vec::new();
  let mut rest = text.trim();

  while rest.len() > max {
    let mut cut = max;
    while !rest.is_char_boundary(cut) {
      cut -= 1;
    }
    if cut == 0 {
      cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
    } else if !rest[cut..].starts_with(char::is_whitespace) {
      if let Some(ws) = rest[..cut].rfind(char::is_whitespace).filter(|&ws| ws > 0) {
        cut = ws;
      }
    }
    let (head, tail) = rest.split_at(cut);
    chunks.push(head.trim_end());
    rest = tail.trim_start();
  }

  if !rest.is_empty() || chunks.is_empty() {
    chunks.push(rest);
  }
  chunks
}
