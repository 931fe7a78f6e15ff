//! # pecvault-imap
//!
//! Minimal asynchronous IMAP4rev1 client for mailbox archival.
//!
//! This crate covers exactly the protocol surface a daily archiver
//! needs:
//!
//! - **TLS via rustls**: secure connections without an OpenSSL
//!   dependency
//! - **LOGIN / EXAMINE**: one read-only session per account per run
//! - **`UID SEARCH ON <date>`**: server-side internal-date matching
//! - **`UID FETCH (FLAGS BODY.PEEK[])`**: raw RFC822 retrieval that
//!   never alters mailbox state
//!
//! There is no IDLE, no STORE, no mailbox mutation of any kind. The
//! client is generic over its stream so tests can script entire
//! conversations in memory.
//!
//! ## Quick start
//!
//! ```ignore
//! use pecvault_imap::{Client, Config, Credentials, SearchDate};
//!
//! let config = Config::new("imaps.pec.aruba.it");
//! let creds = Credentials::new("a@pec.it", "password");
//!
//! let mut client = Client::connect(&config, &creds).await?;
//! client.examine("INBOX").await?;
//! for uid in client.uid_search_on(SearchDate::new(2024, 1, 15)?).await? {
//!     let message = client.uid_fetch(uid).await?;
//!     // persist message.body ...
//! }
//! client.logout().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod client;
mod config;
mod error;
mod framed;
mod response;
mod stream;
mod tag;

pub use client::{Client, SearchDate};
pub use config::{Config, Credentials, Security};
pub use error::{Error, Result};
pub use framed::FramedStream;
pub use response::{FetchedMessage, Status, TaggedResponse};
pub use stream::{ImapStream, connect_plain, connect_tls};
