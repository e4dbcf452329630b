//! Error types for the sonicwire client.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
  #[error("Server error: {0}")]
  Server(String),

  #[error("Protocol violation: {0}")]
  Protocol(String),

  #[error("Expected an integer in reply: {0}")]
  NumericParse(String),

  #[error("Connection error: {0}")]
  Connection(String),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Timeout")]
  Timeout,

  #[error("Channel closed")]
  ChannelClosed,

  #[error("Invalid argument: {0}")]
  InvalidArgument(String),

  #[error("Configuration error: {0}")]
  Config(String),
}

impl Error {
  /// Maps a read error to `Timeout` when the socket deadline fired.
  pub(crate) fn from_read(e: std::io::Error) -> Self {
    match e.kind() {
      std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Self::Timeout,
      _ => Self::Io(e),
    }
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Self::Config(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, Error>;
