//! In-process fake Sonic server for integration tests.
//!
//! Keeps a tiny word index in memory, answers QUERY and SUGGEST with a
//! `PENDING` acknowledgment immediately followed by the `EVENT` line, and
//! records every command it receives.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub const PASSWORD: &str = "SecretPassword";

#[derive(Debug, Clone)]
pub struct FakeConfig {
  pub buffer_size: usize,
  /// Send an EVENT for an id nobody registered before every reply.
  pub noisy: bool,
  pub push_delay: Duration,
  pub ping_delay: Duration,
}

impl Default for FakeConfig {
  fn default() -> Self {
    Self {
      buffer_size: 20_000,
      noisy: false,
      push_delay: Duration::ZERO,
      ping_delay: Duration::ZERO,
    }
  }
}

#[derive(Debug, Default)]
pub struct Store {
  /// (collection, bucket, object) -> indexed words
  pub objects: BTreeMap<(String, String, String), Vec<String>>,
  /// Every command line received after the handshake
  pub log: Vec<String>,
  next_event: u64,
}

impl Store {
  fn event_id(&mut self) -> String {
    self.next_event += 1;
    format!("ev{:04}", self.next_event)
  }
}

pub struct Fake {
  pub addr: SocketAddr,
  pub store: Arc<Mutex<Store>>,
}

/// Start a fake server on an ephemeral port. Must be called inside a runtime.
pub async fn spawn(config: FakeConfig) -> Fake {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let store = Arc::new(Mutex::new(Store::default()));

  let shared = store.clone();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(serve(stream, config.clone(), shared.clone()));
    }
  });

  Fake { addr, store }
}

/// Start a fake server on its own thread, for blocking tests.
pub fn spawn_on_thread(config: FakeConfig) -> Fake {
  let (tx, rx) = std::sync::mpsc::channel();
  std::thread::spawn(move || {
    let rt = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .unwrap();
    rt.block_on(async move {
      let fake = spawn(config).await;
      tx.send(fake).unwrap();
      std::future::pending::<()>().await;
    });
  });
  rx.recv().unwrap()
}

/// Split `COMMAND a b "free text" MOD(x)` into plain tokens and the unescaped text.
fn parse(line: &str) -> (Vec<String>, Option<String>) {
  match (line.find('"'), line.rfind('"')) {
    (Some(start), Some(end)) if end > start => {
      let mut tokens: Vec<String> = line[..start].split_whitespace().map(String::from).collect();
      tokens.extend(line[end + 1..].split_whitespace().map(String::from));
      let text = line[start + 1..end].replace("\\\"", "\"");
      (tokens, Some(text))
    }
    _ => (line.split_whitespace().map(String::from).collect(), None),
  }
}

fn words(text: &str) -> Vec<String> {
  text
    .split(|c: char| !c.is_alphanumeric())
    .filter(|w| !w.is_empty())
    .map(str::to_lowercase)
    .collect()
}

fn key(c: &str, b: &str, o: &str) -> (String, String, String) {
  (c.to_string(), b.to_string(), o.to_string())
}

fn limit_of(tokens: &[String]) -> usize {
  tokens
    .iter()
    .find_map(|t| t.strip_prefix("LIMIT(")?.strip_suffix(')')?.parse().ok())
    .unwrap_or(10)
}

async fn serve(stream: TcpStream, config: FakeConfig, store: Arc<Mutex<Store>>) {
  let (read_half, mut writer) = stream.into_split();
  let mut reader = BufReader::new(read_half);
  let mut line = String::new();

  if writer.write_all(b"CONNECTED <sonic-server v1.4.9>\r\n").await.is_err() {
    return;
  }
  if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
    return;
  }
  let start: Vec<&str> = line.split_whitespace().collect();
  let reply = match start.as_slice() {
    ["START", channel, password] if *password == PASSWORD => format!(
      "STARTED {} protocol(1) buffer({})\r\n",
      channel, config.buffer_size
    ),
    ["START", _, _] => "ERR authentication_failed\r\n".to_string(),
    _ => "ERR invalid_format(START <mode> <password>)\r\n".to_string(),
  };
  let started = reply.starts_with("STARTED");
  if writer.write_all(reply.as_bytes()).await.is_err() || !started {
    return;
  }

  loop {
    line.clear();
    match reader.read_line(&mut line).await {
      Ok(0) | Err(_) => return,
      Ok(_) => {}
    }
    let raw = line.trim_end().to_string();
    let (tokens, text) = parse(&raw);
    let command = tokens.first().cloned().unwrap_or_default();

    match command.as_str() {
      "PUSH" if !config.push_delay.is_zero() => tokio::time::sleep(config.push_delay).await,
      "PING" if !config.ping_delay.is_zero() => tokio::time::sleep(config.ping_delay).await,
      _ => {}
    }

    let mut out = String::new();
    let mut quit = false;
    {
      let mut store = store.lock().unwrap();
      store.log.push(raw.clone());
      if config.noisy {
        let stray = store.event_id();
        out.push_str(&format!("EVENT QUERY stray-{} ghost:1\r\n", stray));
      }
      let t: Vec<&str> = tokens.iter().map(String::as_str).collect();

      match (t.as_slice(), text) {
        (["PING"], None) => out.push_str("PONG\r\n"),
        (["QUIT"], None) => {
          out.push_str("ENDED quit\r\n");
          quit = true;
        }
        (["HELP", arg], None) => {
          out.push_str(&format!("RESULT {}(PING, PUSH, POP, COUNT, QUERY)\r\n", arg))
        }
        (["TRIGGER"], None) | (["TRIGGER", "consolidate"], None) => out.push_str("OK\r\n"),
        (["TRIGGER", ..], None) => out.push_str("ERR bad_trigger\r\n"),
        (["PUSH", c, b, o, ..], Some(text)) => {
          store.objects.entry(key(c, b, o)).or_default().extend(words(&text));
          out.push_str("OK\r\n");
        }
        (["POP", c, b, o], Some(text)) => {
          let popped = match store.objects.get_mut(&key(c, b, o)) {
            Some(indexed) => {
              let gone = words(&text);
              let before = indexed.len();
              indexed.retain(|w| !gone.contains(w));
              before - indexed.len()
            }
            None => 0,
          };
          store.objects.retain(|_, w| !w.is_empty());
          out.push_str(&format!("RESULT {}\r\n", popped));
        }
        (["COUNT", "broken", ..], None) => out.push_str("RESULT many\r\n"),
        (["COUNT", c, b], None) => {
          let n = store
            .objects
            .keys()
            .filter(|(kc, kb, _)| kc == c && kb == b)
            .count();
          out.push_str(&format!("RESULT {}\r\n", n));
        }
        (["COUNT", c, b, o], None) => {
          let n = store.objects.get(&key(c, b, o)).map_or(0, Vec::len);
          out.push_str(&format!("RESULT {}\r\n", n));
        }
        (["FLUSHC", c], None) => {
          let before = store.objects.len();
          store.objects.retain(|(kc, _, _), _| kc != c);
          out.push_str(&format!("RESULT {}\r\n", before - store.objects.len()));
        }
        (["FLUSHB", c, b], None) => {
          let before = store.objects.len();
          store.objects.retain(|(kc, kb, _), _| !(kc == c && kb == b));
          out.push_str(&format!("RESULT {}\r\n", before - store.objects.len()));
        }
        (["FLUSHO", c, b, o], None) => {
          let removed = store.objects.remove(&key(c, b, o)).map_or(0, |_| 1);
          out.push_str(&format!("RESULT {}\r\n", removed));
        }
        (["QUERY", c, b, ..], Some(text)) => {
          let id = store.event_id();
          let wanted = words(&text);
          let hits: Vec<String> = store
            .objects
            .iter()
            .filter(|((kc, kb, _), w)| kc == c && kb == b && w.iter().any(|w| wanted.contains(w)))
            .map(|((_, _, o), _)| o.clone())
            .take(limit_of(&tokens))
            .collect();
          out.push_str(&format!("PENDING {}\r\n", id));
          out.push_str(&format!("EVENT QUERY {} {}\r\n", id, hits.join(" ")));
        }
        (["SUGGEST", c, b, ..], Some(text)) => {
          let id = store.event_id();
          let prefix = text.to_lowercase();
          let mut found: Vec<String> = store
            .objects
            .iter()
            .filter(|((kc, kb, _), _)| kc == c && kb == b)
            .flat_map(|(_, w)| w.iter().cloned())
            .filter(|w| w.starts_with(&prefix))
            .collect();
          found.sort();
          found.dedup();
          found.truncate(limit_of(&tokens));
          out.push_str(&format!("PENDING {}\r\n", id));
          out.push_str(&format!("EVENT SUGGEST {} {}\r\n", id, found.join(" ")));
        }
        _ => out.push_str(&format!("ERR unknown_command({})\r\n", command)),
      }
    }

    if writer.write_all(out.as_bytes()).await.is_err() || quit {
      return;
    }
  }
}
