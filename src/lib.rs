//! # mailcatch
//!
//! A local SMTP server that captures outgoing mail. Point an application's
//! SMTP settings at it and every message it sends is written to disk and
//! announced on a broadcast channel instead of being delivered.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mailcatch::{FileMessageStore, Server, ServerConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = Arc::new(FileMessageStore::new("messages")?);
//! let server = Server::new(ServerConfig::with_hostname("mailcatch.local"), store);
//! server.bind("127.0.0.1", 2525).await?;
//! server.start().await?;
//!
//! let mut received = server.subscribe();
//! while let Ok(message) = received.recv().await {
//!     println!("{} -> {:?}", message.mail_from, message.recipients);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Only the subset of SMTP used by mail libraries is understood: `HELO`,
//! `EHLO` (advertising `8BITMIME`), `MAIL`, `RCPT`, `DATA`, `RSET`, `NOOP`
//! and `QUIT`. `VRFY`/`EXPN` are declined politely and `HELP`/`TURN` are
//! reported as not implemented. There is no TLS and no authentication.

pub mod config;
pub mod connection;
pub mod error;
pub mod framer;
pub mod processor;
pub mod server;
pub mod session;
pub mod store;
pub mod utils;

pub use config::ServerConfig;
pub use error::Error;
pub use processor::CommandProcessor;
pub use server::Server;
pub use session::SessionState;
pub use store::{FileMessageStore, MessageStore, ReceivedMessage, StoredMessage};
