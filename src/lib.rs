//! sonicwire: client for the Sonic search channel protocol
//!
//! One connection speaks one channel (ingest, search or control). Ordinary
//! commands get a synchronous reply; QUERY and SUGGEST are acknowledged with
//! an event id and answered later by an out-of-band EVENT line.
//!
//! # Example
//!
//! ```no_run
//! use sonicwire::{Channel, Client, ConnectOptions, QueryOptions};
//!
//! #[tokio::main]
//! async fn main() -> sonicwire::Result<()> {
//!     let ingest = Client::connect(
//!         ConnectOptions::new("localhost", 1491, Channel::Ingest).with_password("SecretPassword"),
//!     )
//!     .await?;
//!     ingest.push("wiki", "articles", "article-1", "love is patient", None).await?;
//!
//!     let search = Client::connect(
//!         ConnectOptions::new("localhost", 1491, Channel::Search).with_password("SecretPassword"),
//!     )
//!     .await?;
//!
//!     // The acknowledgment frees the wire; results arrive later.
//!     let pending = search.query("wiki", "articles", "love", QueryOptions::default()).await?;
//!     println!("Found: {:?}", pending.await?);
//!
//!     search.quit().await?;
//!     ingest.quit().await?;
//!     Ok(())
//! }
//! ```

pub mod blocking;
mod client;
mod error;
pub mod events;
mod options;
pub mod protocol;
pub mod sequencer;
pub mod session;

pub use client::Client;
pub use error::{Error, Result};
pub use events::{EventRegistry, PendingResult, Sink};
pub use options::{
  Channel, ConnectOptions, QueryOptions, DEFAULT_LIMIT, DEFAULT_PASSWORD, DEFAULT_PORT,
};
pub use protocol::{Command, Event, Line};
pub use sequencer::{Permit, Sequencer};
pub use session::{Negotiated, SessionState};
