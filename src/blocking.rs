//! Blocking connection on `std::net`.
//!
//! Every command is a blocking round trip. EVENT lines met while waiting for
//! a reply run their callback inline, on the calling thread.

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::Sink;
use crate::options::{ConnectOptions, QueryOptions, DEFAULT_LIMIT};
use crate::protocol::{self, Command};
use crate::session::{self, Demux, Negotiated, SessionState};

/// Blocking Sonic channel connection.
pub struct Connection {
  options: ConnectOptions,
  reader: BufReader<TcpStream>,
  writer: TcpStream,
  demux: Demux,
  state: SessionState,
  negotiated: Negotiated,
}

impl Connection {
  /// Connect and run the handshake.
  pub fn connect(options: ConnectOptions) -> Result<Self> {
    let mut conn = Self::open(options)?;
    conn.handshake()?;
    Ok(conn)
  }

  /// Open the socket without running the handshake.
  pub fn open(options: ConnectOptions) -> Result<Self> {
    let addr = options.addr();
    debug!(addr = %addr, "connecting");
    let stream = TcpStream::connect(&addr)
      .map_err(|e| Error::Connection(format!("Failed to connect to {}: {}", addr, e)))?;
    stream.set_read_timeout(options.timeout)?;
    let writer = stream.try_clone()?;

    Ok(Self {
      options,
      reader: BufReader::new(stream),
      writer,
      demux: Demux::new(),
      state: SessionState::AwaitingGreeting,
      negotiated: Negotiated::default(),
    })
  }

  pub fn handshake(&mut self) -> Result<()> {
    if self.state != SessionState::AwaitingGreeting {
      return Err(Error::Protocol(format!(
        "handshake not possible in state {:?}",
        self.state
      )));
    }

    match self.start() {
      Ok(negotiated) => {
        self.negotiated = negotiated;
        self.state = SessionState::Ready;
        info!(
          channel = %self.options.channel,
          protocol = negotiated.protocol,
          buffer = negotiated.buffer_size,
          "channel started"
        );
        Ok(())
      }
      Err(e) => Err(self.abort(e)),
    }
  }

  fn start(&mut self) -> Result<Negotiated> {
    let greeting = self.read_line()?;
    session::parse_greeting(&greeting)?;
    self.state = SessionState::AwaitingStart;

    let start = Command::Start {
      channel: self.options.channel,
      password: &self.options.password,
    }
    .encode();
    self.write_line(&start)?;
    let started = self.read_line()?;
    session::parse_started(&started)
  }

  pub fn state(&self) -> SessionState {
    self.state
  }

  pub fn negotiated(&self) -> Negotiated {
    self.negotiated
  }

  pub fn options(&self) -> &ConnectOptions {
    &self.options
  }

  /// Event callbacks not yet run
  pub fn pending_events(&self) -> usize {
    self.demux.pending_events()
  }

  fn read_line(&mut self) -> Result<String> {
    let mut line = String::new();
    let n = self.reader.read_line(&mut line).map_err(Error::from_read)?;
    if n == 0 {
      return Err(Error::ChannelClosed);
    }
    debug!(line = %line.trim_end(), "recv");
    Ok(line)
  }

  fn write_line(&mut self, line: &str) -> Result<()> {
    debug!(line = %session::loggable(line), "send");
    self.writer.write_all(line.as_bytes())?;
    self.writer.flush()?;
    Ok(())
  }

  /// Close the session after a failed handshake or a transport error. Once a
  /// reply may be owed or half read, later replies cannot be matched to
  /// their commands.
  fn abort(&mut self, e: Error) -> Error {
    warn!(error = %e, "closing connection");
    self.state = SessionState::Closed;
    self.demux.close();
    let _ = self.writer.shutdown(Shutdown::Both);
    e
  }

  fn round_trip(&mut self, line: &str, sink: Option<Sink>) -> Result<String> {
    self.state.ensure_ready()?;
    if let Some(sink) = sink {
      self.demux.arm(sink);
    }
    if let Err(e) = self.write_line(line) {
      return Err(self.abort(e));
    }
    loop {
      let raw = match self.read_line() {
        Ok(raw) => raw,
        Err(e) => return Err(self.abort(e)),
      };
      if let Some(reply) = self.demux.route(&raw) {
        return reply;
      }
    }
  }

  /// Read until every registered event has been delivered.
  pub fn wait_events(&mut self) -> Result<()> {
    self.state.ensure_ready()?;
    while self.demux.pending_events() > 0 {
      let raw = match self.read_line() {
        Ok(raw) => raw,
        Err(e) => return Err(self.abort(e)),
      };
      match self.demux.route(&raw) {
        None => {}
        Some(Ok(reply)) => return Err(Error::Protocol(reply)),
        Some(Err(e)) => return Err(e),
      }
    }
    Ok(())
  }

  pub fn ping(&mut self) -> Result<bool> {
    let reply = self.round_trip(&Command::Ping.encode(), None)?;
    Ok(protocol::is_literal(&reply, "PONG"))
  }

  pub fn push(
    &mut self,
    collection: &str,
    bucket: &str,
    object: &str,
    text: &str,
    lang: Option<&str>,
  ) -> Result<bool> {
    let command = Command::Push {
      collection,
      bucket,
      object,
      text,
      lang,
    };
    let mut ok = true;
    for line in session::chunked_lines(&command, text, &self.negotiated) {
      let reply = self.round_trip(&line, None)?;
      ok &= protocol::is_literal(&reply, "OK");
    }
    Ok(ok)
  }

  pub fn pop(&mut self, collection: &str, bucket: &str, object: &str, text: &str) -> Result<u64> {
    let command = Command::Pop {
      collection,
      bucket,
      object,
      text,
    };
    let mut total = 0;
    for line in session::chunked_lines(&command, text, &self.negotiated) {
      let reply = self.round_trip(&line, None)?;
      total += protocol::count_from_last(&reply)?;
    }
    Ok(total)
  }

  pub fn count(&mut self, collection: &str, bucket: &str, object: Option<&str>) -> Result<u64> {
    let line = Command::Count {
      collection,
      bucket,
      object,
    }
    .encode();
    protocol::count_from_second(&self.round_trip(&line, None)?)
  }

  pub fn flush_collection(&mut self, collection: &str) -> Result<u64> {
    let line = Command::FlushCollection { collection }.encode();
    protocol::count_from_second(&self.round_trip(&line, None)?)
  }

  pub fn flush_bucket(&mut self, collection: &str, bucket: &str) -> Result<u64> {
    let line = Command::FlushBucket { collection, bucket }.encode();
    protocol::count_from_second(&self.round_trip(&line, None)?)
  }

  pub fn flush_object(&mut self, collection: &str, bucket: &str, object: &str) -> Result<u64> {
    let line = Command::FlushObject {
      collection,
      bucket,
      object,
    }
    .encode();
    protocol::count_from_second(&self.round_trip(&line, None)?)
  }

  pub fn flush(
    &mut self,
    collection: &str,
    bucket: Option<&str>,
    object: Option<&str>,
  ) -> Result<u64> {
    match (bucket, object) {
      (None, None) => self.flush_collection(collection),
      (Some(bucket), None) => self.flush_bucket(collection, bucket),
      (Some(bucket), Some(object)) => self.flush_object(collection, bucket, object),
      (None, Some(object)) => Err(Error::InvalidArgument(format!(
        "cannot flush object {} without a bucket",
        object
      ))),
    }
  }

  /// Issue a QUERY and return its event id. `on_result` runs once the
  /// matching EVENT line is read by a later call.
  pub fn query<F>(
    &mut self,
    collection: &str,
    bucket: &str,
    terms: &str,
    opts: QueryOptions,
    on_result: F,
  ) -> Result<String>
  where
    F: FnOnce(Vec<String>) + Send + 'static,
  {
    let line = Command::Query {
      collection,
      bucket,
      terms,
      limit: opts.limit,
      offset: opts.offset,
      lang: opts.lang.as_deref(),
    }
    .encode();
    let reply = self.round_trip(&line, Some(Sink::callback(on_result)))?;
    protocol::pending_id(&reply)
  }

  pub fn suggest<F>(
    &mut self,
    collection: &str,
    bucket: &str,
    word: &str,
    limit: Option<usize>,
    on_result: F,
  ) -> Result<String>
  where
    F: FnOnce(Vec<String>) + Send + 'static,
  {
    let line = Command::Suggest {
      collection,
      bucket,
      word,
      limit: limit.unwrap_or(DEFAULT_LIMIT),
    }
    .encode();
    let reply = self.round_trip(&line, Some(Sink::callback(on_result)))?;
    protocol::pending_id(&reply)
  }

  pub fn help(&mut self, arg: &str) -> Result<String> {
    self.round_trip(&Command::Help(arg).encode(), None)
  }

  pub fn trigger(&mut self, action: Option<&str>) -> Result<String> {
    self.round_trip(&Command::Trigger(action).encode(), None)
  }

  /// End the session and close the socket. The connection is unusable after.
  pub fn quit(&mut self) -> Result<()> {
    let result = self.round_trip(&Command::Quit.encode(), None);
    self.state = SessionState::Closed;
    self.demux.close();
    let _ = self.writer.shutdown(Shutdown::Both);
    result?;
    info!(channel = %self.options.channel, "channel closed");
    Ok(())
  }
}
