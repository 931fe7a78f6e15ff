//! Archival IMAP client.
//!
//! A deliberately small client: one connection per account, LOGIN,
//! SELECT, `UID SEARCH ON <date>`, `UID FETCH (FLAGS BODY.PEEK[])`,
//! LOGOUT. No IDLE, no STORE, no type-state machine — the archiver
//! never writes to the mailbox and never keeps a session past one run.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::framed::FramedStream;
use crate::response::{self, FetchedMessage, Status};
use crate::stream::ImapStream;
use crate::tag::TagGenerator;
use crate::{Config, Credentials, Error, Result};

/// A calendar date in the form IMAP SEARCH expects (`15-Jan-2024`).
///
/// SEARCH ON matches the server-side internal date, which is exactly the
/// `[date, date+1)` window in the server's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchDate {
    year: i32,
    month: u32,
    day: u32,
}

impl SearchDate {
    /// Creates a search date.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if month or day are out of range.
    pub fn new(year: i32, month: u32, day: u32) -> Result<Self> {
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(Error::Protocol(format!(
                "invalid search date {year:04}-{month:02}-{day:02}"
            )));
        }
        Ok(Self { year, month, day })
    }
}

impl std::fmt::Display for SearchDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const MONTHS: [&str; 12] = [
            "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
        ];
        #[allow(clippy::indexing_slicing)] // month validated in new()
        let month = MONTHS[self.month as usize - 1];
        write!(f, "{}-{}-{}", self.day, month, self.year)
    }
}

/// IMAP client generic over the underlying stream.
///
/// Production code uses [`Client::connect`] which yields a
/// `Client<ImapStream>`; tests drive the protocol through an in-memory
/// mock stream via [`Client::from_stream`].
pub struct Client<S> {
    framed: FramedStream<S>,
    tags: TagGenerator,
    command_timeout: Duration,
}

impl Client<ImapStream> {
    /// Connects and authenticates according to `config`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the connection fails, or
    /// [`Error::Auth`] if the server rejects the credentials.
    pub async fn connect(config: &Config, credentials: &Credentials) -> Result<Self> {
        let stream = crate::stream::connect(config).await?;
        debug!(host = %config.host, port = config.port, tls = stream.is_tls(), "connected");

        let mut client = Self::from_stream(stream, config.command_timeout).await?;
        client.login(credentials).await?;
        Ok(client)
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an established stream and consumes the server greeting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the greeting is not `* OK` or
    /// `* PREAUTH`, or [`Error::Bye`] if the server refuses service.
    pub async fn from_stream(stream: S, command_timeout: Duration) -> Result<Self> {
        let mut client = Self {
            framed: FramedStream::new(stream),
            tags: TagGenerator::new(),
            command_timeout,
        };

        let greeting = client.read_timed().await?;
        if let Some(text) = response::parse_bye(&greeting) {
            return Err(Error::Bye(text));
        }
        if !greeting.starts_with(b"* OK") && !greeting.starts_with(b"* PREAUTH") {
            return Err(Error::Protocol(format!(
                "unexpected greeting: {}",
                String::from_utf8_lossy(&greeting).trim_end()
            )));
        }

        Ok(client)
    }

    /// Authenticates with LOGIN.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] on rejection; rejected credentials are
    /// never worth retrying.
    pub async fn login(&mut self, credentials: &Credentials) -> Result<()> {
        let command = format!(
            "LOGIN {} {}",
            quote(&credentials.username)?,
            quote(&credentials.password)?
        );
        match self.command(&command).await {
            Ok(_) => {
                debug!(username = %credentials.username, "authenticated");
                Ok(())
            }
            Err(Error::No(text) | Error::Bad(text)) => Err(Error::Auth(text)),
            Err(e) => Err(e),
        }
    }

    /// Selects a mailbox read-only and returns its message count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::No`] if the mailbox does not exist.
    pub async fn examine(&mut self, mailbox: &str) -> Result<u32> {
        let command = format!("EXAMINE {}", quote(mailbox)?);
        let untagged = self.command(&command).await?;
        let exists = untagged
            .iter()
            .find_map(|line| response::parse_exists(line))
            .unwrap_or(0);
        debug!(mailbox, exists, "mailbox selected");
        Ok(exists)
    }

    /// Searches the selected mailbox for messages whose internal date
    /// falls on `date`, returning UIDs in ascending order.
    ///
    /// # Errors
    ///
    /// Propagates transport errors and server rejections.
    pub async fn uid_search_on(&mut self, date: SearchDate) -> Result<Vec<u32>> {
        let untagged = self.command(&format!("UID SEARCH ON {date}")).await?;
        let mut uids: Vec<u32> = untagged
            .iter()
            .filter_map(|line| response::parse_search(line))
            .flatten()
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Fetches one message's flags and raw RFC822 content by UID.
    ///
    /// Uses `BODY.PEEK[]` so archival never alters the `\Seen` state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the server sends no FETCH data for
    /// the UID.
    pub async fn uid_fetch(&mut self, uid: u32) -> Result<FetchedMessage> {
        let untagged = self
            .command(&format!("UID FETCH {uid} (UID FLAGS BODY.PEEK[])"))
            .await?;
        untagged
            .iter()
            .filter_map(|chunk| response::parse_fetch(chunk))
            .find(|msg| msg.uid == uid)
            .ok_or_else(|| Error::Protocol(format!("no FETCH data for UID {uid}")))
    }

    /// Logs out and drops the connection.
    ///
    /// # Errors
    ///
    /// Propagates transport errors; the expected BYE is not an error
    /// here.
    pub async fn logout(&mut self) -> Result<()> {
        match self.command("LOGOUT").await {
            Ok(_) | Err(Error::Bye(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Sends one command and collects untagged responses until the
    /// tagged completion arrives.
    async fn command(&mut self, command: &str) -> Result<Vec<Bytes>> {
        let tag = self.tags.next();
        let line = format!("{tag} {command}\r\n");
        self.framed.write_command(line.as_bytes()).await?;

        let mut untagged = Vec::new();
        loop {
            let chunk = self.read_timed().await?;

            if let Some(tagged) = response::parse_tagged(&chunk, &tag) {
                return match tagged.status {
                    Status::Ok => Ok(untagged),
                    Status::No => Err(Error::No(tagged.text)),
                    Status::Bad => Err(Error::Bad(tagged.text)),
                };
            }
            if command != "LOGOUT"
                && let Some(text) = response::parse_bye(&chunk)
            {
                return Err(Error::Bye(text));
            }
            untagged.push(chunk);
        }
    }

    /// Reads one response under the per-command timeout.
    async fn read_timed(&mut self) -> Result<Bytes> {
        tokio::time::timeout(self.command_timeout, self.framed.read_response())
            .await
            .map_err(|_| Error::Timeout(self.command_timeout))?
    }
}

/// Quotes a string per RFC 9051 quoted-string rules.
fn quote(value: &str) -> Result<String> {
    if value.chars().any(|c| c == '\r' || c == '\n') {
        return Err(Error::Protocol(
            "CR/LF not allowed in quoted strings".to_string(),
        ));
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    Ok(format!("\"{escaped}\""))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_search_date_display() {
        let date = SearchDate::new(2024, 1, 15).unwrap();
        assert_eq!(date.to_string(), "15-Jan-2024");

        let date = SearchDate::new(2023, 12, 1).unwrap();
        assert_eq!(date.to_string(), "1-Dec-2023");
    }

    #[test]
    fn test_search_date_rejects_bad_month() {
        assert!(SearchDate::new(2024, 13, 1).is_err());
        assert!(SearchDate::new(2024, 0, 1).is_err());
        assert!(SearchDate::new(2024, 1, 32).is_err());
    }

    #[test]
    fn test_quote_plain() {
        assert_eq!(quote("INBOX").unwrap(), "\"INBOX\"");
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("pa\"ss\\w").unwrap(), "\"pa\\\"ss\\\\w\"");
    }

    #[test]
    fn test_quote_rejects_crlf() {
        assert!(quote("bad\r\nvalue").is_err());
    }

    #[test]
    fn test_quote_folder_with_spaces() {
        assert_eq!(quote("Posta inviata").unwrap(), "\"Posta inviata\"");
    }
}
