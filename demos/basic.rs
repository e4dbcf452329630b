//! Basic example: index a few articles, then search them.

use sonicwire::{Channel, Client, ConnectOptions, QueryOptions};
use tracing_subscriber::EnvFilter;

const ARTICLES: [(&str, &str); 4] = [
  ("article-1", "Love is patient, love is kind."),
  ("article-2", "The quick brown fox jumps over the lazy dog."),
  ("article-3", "Love never fails; it always protects."),
  ("article-4", "A journey of a thousand miles begins with a single step."),
];

#[tokio::main]
async fn main() -> sonicwire::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let base = ConnectOptions::default().with_password("SecretPassword");

  let ingest = Client::connect(base.clone().with_channel(Channel::Ingest)).await?;
  println!("Ingest channel started: {:?}", ingest.negotiated());

  for (id, text) in ARTICLES {
    ingest.push("wiki", "articles", id, text, Some("eng")).await?;
  }
  println!("Objects in article-1: {}", ingest.count("wiki", "articles", Some("article-1")).await?);

  let search = Client::connect(base.clone().with_channel(Channel::Search)).await?;

  // Both commands go out before either result is awaited.
  let (love, fox) = tokio::try_join!(
    search.query("wiki", "articles", "love", QueryOptions::default()),
    search.query("wiki", "articles", "fox", QueryOptions::default().limit(5)),
  )?;
  println!("love -> {:?}", love.await?);
  println!("fox -> {:?}", fox.await?);

  let words = search.suggest("wiki", "articles", "lov", None).await?;
  println!("Suggestions: {:?}", words.await?);

  let flushed = ingest.flush("wiki", None, None).await?;
  println!("Flushed {} entries", flushed);

  search.quit().await?;
  ingest.quit().await?;
  Ok(())
}
