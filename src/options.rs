//! Connection and query options.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default Sonic channel port
pub const DEFAULT_PORT: u16 = 1491;

/// Default password shipped in the stock server config
pub const DEFAULT_PASSWORD: &str = "SecretPassword";

/// Default result window for QUERY and SUGGEST
pub const DEFAULT_LIMIT: usize = 10;

/// Functional mode of a connection, fixed at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
  Ingest,
  #[default]
  Search,
  Control,
}

impl Channel {
  pub fn as_str(&self) -> &'static str {
    match self {
      Channel::Ingest => "ingest",
      Channel::Search => "search",
      Channel::Control => "control",
    }
  }
}

impl fmt::Display for Channel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Channel {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "ingest" => Ok(Channel::Ingest),
      "search" => Ok(Channel::Search),
      "control" => Ok(Channel::Control),
      other => Err(Error::InvalidArgument(format!("unknown channel: {}", other))),
    }
  }
}

/// Connection options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
  pub host: String,
  pub port: u16,
  pub password: String,
  pub channel: Channel,
  /// Per-read deadline for the blocking connection. Ignored by the async client.
  #[serde(rename = "timeout_ms", with = "millis")]
  pub timeout: Option<Duration>,
}

impl Default for ConnectOptions {
  fn default() -> Self {
    Self {
      host: "localhost".to_string(),
      port: DEFAULT_PORT,
      password: DEFAULT_PASSWORD.to_string(),
      channel: Channel::default(),
      timeout: None,
    }
  }
}

impl ConnectOptions {
  pub fn new(host: impl Into<String>, port: u16, channel: Channel) -> Self {
    Self {
      host: host.into(),
      port,
      channel,
      ..Default::default()
    }
  }

  pub fn with_password(mut self, password: impl Into<String>) -> Self {
    self.password = password.into();
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn with_channel(mut self, channel: Channel) -> Self {
    self.channel = channel;
    self
  }

  pub fn addr(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }

  /// Parse options from a JSON document. Missing fields fall back to defaults.
  pub fn from_json(json: &str) -> Result<Self> {
    Ok(serde_json::from_str(json)?)
  }

  pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
      .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    Self::from_json(&text)
  }
}

mod millis {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match value {
      Some(d) => s.serialize_some(&(d.as_millis() as u64)),
      None => s.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
  }
}

/// Paging and language modifiers for QUERY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
  pub limit: usize,
  pub offset: usize,
  pub lang: Option<String>,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      limit: DEFAULT_LIMIT,
      offset: 0,
      lang: None,
    }
  }
}

impl QueryOptions {
  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = limit;
    self
  }

  pub fn offset(mut self, offset: usize) -> Self {
    self.offset = offset;
    self
  }

  pub fn lang(mut self, lang: impl Into<String>) -> Self {
    self.lang = Some(lang.into());
    self
  }
}
