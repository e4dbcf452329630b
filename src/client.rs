//! Asynchronous connection on tokio.
//!
//! Commands may be issued concurrently from one or many tasks. They queue on
//! the [`Sequencer`] and reach the wire strictly in arrival order. A
//! background task owns the read half and feeds every inbound line through
//! the shared [`Demux`], so QUERY and SUGGEST results resolve even while the
//! connection is otherwise idle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{PendingResult, Sink};
use crate::options::{ConnectOptions, QueryOptions, DEFAULT_LIMIT};
use crate::protocol::{self, Command};
use crate::sequencer::Sequencer;
use crate::session::{self, Demux, Negotiated, SessionState};

type Replies = mpsc::UnboundedReceiver<Result<String>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Async Sonic channel client. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
  inner: Arc<Inner>,
}

struct Inner {
  options: ConnectOptions,
  sequencer: Arc<Sequencer>,
  demux: Arc<Mutex<Demux>>,
  state: Mutex<SessionState>,
  negotiated: Mutex<Negotiated>,
  greeting: AsyncMutex<Option<BufReader<OwnedReadHalf>>>,
  writer: AsyncMutex<Option<OwnedWriteHalf>>,
  replies: AsyncMutex<Option<Replies>>,
  reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
  /// Connect and run the handshake.
  pub async fn connect(options: ConnectOptions) -> Result<Self> {
    let client = Self::open(options).await?;
    client.handshake().await?;
    Ok(client)
  }

  /// Open the socket without running the handshake. Commands fail until
  /// [`Client::handshake`] succeeds.
  pub async fn open(options: ConnectOptions) -> Result<Self> {
    let addr = options.addr();
    debug!(addr = %addr, "connecting");
    let stream = TcpStream::connect(&addr)
      .await
      .map_err(|e| Error::Connection(format!("Failed to connect to {}: {}", addr, e)))?;
    let (read_half, write_half) = stream.into_split();

    Ok(Self {
      inner: Arc::new(Inner {
        options,
        sequencer: Sequencer::new(),
        demux: Arc::new(Mutex::new(Demux::new())),
        state: Mutex::new(SessionState::AwaitingGreeting),
        negotiated: Mutex::new(Negotiated::default()),
        greeting: AsyncMutex::new(Some(BufReader::new(read_half))),
        writer: AsyncMutex::new(Some(write_half)),
        replies: AsyncMutex::new(None),
        reader_task: Mutex::new(None),
      }),
    })
  }

  /// Read the greeting, send START and start the reader task.
  pub async fn handshake(&self) -> Result<()> {
    let _permit = self.inner.sequencer.acquire().await?;
    let mut reader = self
      .inner
      .greeting
      .lock()
      .await
      .take()
      .ok_or_else(|| Error::Protocol("handshake already performed".to_string()))?;

    match self.inner.start(&mut reader).await {
      Ok(negotiated) => {
        *lock(&self.inner.negotiated) = negotiated;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.replies.lock().await = Some(rx);
        let task = tokio::spawn(read_loop(reader, self.inner.demux.clone(), tx));
        *lock(&self.inner.reader_task) = Some(task);
        self.inner.set_state(SessionState::Ready);
        info!(
          channel = %self.inner.options.channel,
          protocol = negotiated.protocol,
          buffer = negotiated.buffer_size,
          "channel started"
        );
        Ok(())
      }
      Err(e) => {
        self.inner.close().await;
        Err(e)
      }
    }
  }

  pub fn state(&self) -> SessionState {
    *lock(&self.inner.state)
  }

  pub fn negotiated(&self) -> Negotiated {
    *lock(&self.inner.negotiated)
  }

  pub fn options(&self) -> &ConnectOptions {
    &self.inner.options
  }

  /// Event results still awaited from the server
  pub fn pending_events(&self) -> usize {
    lock(&self.inner.demux).pending_events()
  }

  async fn exchange(&self, line: String) -> Result<String> {
    self.submit(line, None, false).await
  }

  /// Queue for the wire, then run the write/read round trip in its own task
  /// so that dropping the caller cannot leave a reply unread.
  async fn submit(&self, line: String, sink: Option<Sink>, closing: bool) -> Result<String> {
    let permit = self.inner.sequencer.acquire().await?;
    self.state().ensure_ready()?;

    let inner = self.inner.clone();
    tokio::spawn(async move {
      let result = inner.round_trip(&line, sink).await;
      if closing {
        inner.close().await;
      }
      drop(permit);
      result
    })
    .await
    .map_err(|_| Error::ChannelClosed)?
  }

  async fn submit_event(&self, line: String) -> Result<PendingResult> {
    let (sink, rx) = Sink::deferred();
    let reply = self.submit(line, Some(sink), false).await?;
    Ok(PendingResult::new(protocol::pending_id(&reply)?, rx))
  }

  pub async fn ping(&self) -> Result<bool> {
    let reply = self.exchange(Command::Ping.encode()).await?;
    Ok(protocol::is_literal(&reply, "PONG"))
  }

  /// Index `text` for `object`. Long text goes out as several PUSH lines.
  pub async fn push(
    &self,
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
    for line in session::chunked_lines(&command, text, &self.negotiated()) {
      let reply = self.exchange(line).await?;
      ok &= protocol::is_literal(&reply, "OK");
    }
    Ok(ok)
  }

  /// Remove `text` from `object`, returning how many terms were popped.
  pub async fn pop(&self, collection: &str, bucket: &str, object: &str, text: &str) -> Result<u64> {
    let command = Command::Pop {
      collection,
      bucket,
      object,
      text,
    };
    let mut total = 0;
    for line in session::chunked_lines(&command, text, &self.negotiated()) {
      let reply = self.exchange(line).await?;
      total += protocol::count_from_last(&reply)?;
    }
    Ok(total)
  }

  pub async fn count(&self, collection: &str, bucket: &str, object: Option<&str>) -> Result<u64> {
    let line = Command::Count {
      collection,
      bucket,
      object,
    }
    .encode();
    protocol::count_from_second(&self.exchange(line).await?)
  }

  pub async fn flush_collection(&self, collection: &str) -> Result<u64> {
    let line = Command::FlushCollection { collection }.encode();
    protocol::count_from_second(&self.exchange(line).await?)
  }

  pub async fn flush_bucket(&self, collection: &str, bucket: &str) -> Result<u64> {
    let line = Command::FlushBucket { collection, bucket }.encode();
    protocol::count_from_second(&self.exchange(line).await?)
  }

  pub async fn flush_object(&self, collection: &str, bucket: &str, object: &str) -> Result<u64> {
    let line = Command::FlushObject {
      collection,
      bucket,
      object,
    }
    .encode();
    protocol::count_from_second(&self.exchange(line).await?)
  }

  /// Flush the narrowest scope given.
  pub async fn flush(
    &self,
    collection: &str,
    bucket: Option<&str>,
    object: Option<&str>,
  ) -> Result<u64> {
    match (bucket, object) {
      (None, None) => self.flush_collection(collection).await,
      (Some(bucket), None) => self.flush_bucket(collection, bucket).await,
      (Some(bucket), Some(object)) => self.flush_object(collection, bucket, object).await,
      (None, Some(object)) => Err(Error::InvalidArgument(format!(
        "cannot flush object {} without a bucket",
        object
      ))),
    }
  }

  /// Issue a QUERY. The returned handle resolves to the matching object ids.
  pub async fn query(
    &self,
    collection: &str,
    bucket: &str,
    terms: &str,
    opts: QueryOptions,
  ) -> Result<PendingResult> {
    let line = Command::Query {
      collection,
      bucket,
      terms,
      limit: opts.limit,
      offset: opts.offset,
      lang: opts.lang.as_deref(),
    }
    .encode();
    self.submit_event(line).await
  }

  /// Issue a SUGGEST. The returned handle resolves to the completed words.
  pub async fn suggest(
    &self,
    collection: &str,
    bucket: &str,
    word: &str,
    limit: Option<usize>,
  ) -> Result<PendingResult> {
    let line = Command::Suggest {
      collection,
      bucket,
      word,
      limit: limit.unwrap_or(DEFAULT_LIMIT),
    }
    .encode();
    self.submit_event(line).await
  }

  pub async fn help(&self, arg: &str) -> Result<String> {
    self.exchange(Command::Help(arg).encode()).await
  }

  pub async fn trigger(&self, action: Option<&str>) -> Result<String> {
    self.exchange(Command::Trigger(action).encode()).await
  }

  /// End the session. Commands queued behind QUIT fail as not ready.
  pub async fn quit(&self) -> Result<()> {
    self.submit(Command::Quit.encode(), None, true).await?;
    info!(channel = %self.inner.options.channel, "channel closed");
    Ok(())
  }
}

impl Inner {
  fn set_state(&self, state: SessionState) {
    *lock(&self.state) = state;
  }

  async fn start(&self, reader: &mut BufReader<OwnedReadHalf>) -> Result<Negotiated> {
    let greeting = read_line(reader).await?;
    session::parse_greeting(&greeting)?;
    self.set_state(SessionState::AwaitingStart);

    let start = Command::Start {
      channel: self.options.channel,
      password: &self.options.password,
    };
    self.write_line(&start.encode()).await?;
    session::parse_started(&read_line(reader).await?)
  }

  async fn write_line(&self, line: &str) -> Result<()> {
    let mut writer = self.writer.lock().await;
    let writer = writer.as_mut().ok_or(Error::ChannelClosed)?;
    debug!(line = %session::loggable(line), "send");
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
  }

  async fn round_trip(&self, line: &str, sink: Option<Sink>) -> Result<String> {
    let mut replies = self.replies.lock().await;
    let replies = replies.as_mut().ok_or(Error::ChannelClosed)?;

    if let Some(sink) = sink {
      lock(&self.demux).arm(sink);
    }
    if let Err(e) = self.write_line(line).await {
      lock(&self.demux).disarm();
      return Err(e);
    }
    replies.recv().await.unwrap_or(Err(Error::ChannelClosed))
  }

  async fn close(&self) {
    self.set_state(SessionState::Closed);
    if let Some(mut writer) = self.writer.lock().await.take() {
      let _ = writer.shutdown().await;
    }
    if let Some(task) = lock(&self.reader_task).take() {
      task.abort();
    }
    lock(&self.demux).close();
  }
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> Result<String> {
  let mut line = String::new();
  if reader.read_line(&mut line).await? == 0 {
    return Err(Error::ChannelClosed);
  }
  debug!(line = %line.trim_end(), "recv");
  Ok(line)
}

async fn read_loop(
  mut reader: BufReader<OwnedReadHalf>,
  demux: Arc<Mutex<Demux>>,
  replies: mpsc::UnboundedSender<Result<String>>,
) {
  loop {
    match read_line(&mut reader).await {
      Ok(line) => {
        let routed = lock(&demux).route(&line);
        if let Some(reply) = routed {
          if replies.send(reply).is_err() {
            break;
          }
        }
      }
      Err(Error::ChannelClosed) => {
        debug!("server closed the connection");
        break;
      }
      Err(e) => {
        warn!(error = %e, "reader stopped");
        let _ = replies.send(Err(e));
        break;
      }
    }
  }
  lock(&demux).close();
}
