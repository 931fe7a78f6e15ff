//! Integration tests for the archival IMAP client.
//!
//! These tests script entire server conversations through a mock stream,
//! so no real server connection is needed.

use std::io::{self, Cursor};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use pecvault_imap::{Client, Credentials, Error, SearchDate};

/// Mock stream that returns predefined responses and captures commands.
struct MockStream {
    /// Responses to return (in order).
    responses: Cursor<Vec<u8>>,
    /// Captured commands sent by the client.
    sent: Vec<u8>,
}

impl MockStream {
    fn new(responses: &[u8]) -> Self {
        Self {
            responses: Cursor::new(responses.to_vec()),
            sent: Vec::new(),
        }
    }

    fn sent_text(&self) -> String {
        String::from_utf8_lossy(&self.sent).to_string()
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let data = self.responses.get_ref();
        let pos = self.responses.position() as usize;

        if pos >= data.len() {
            return Poll::Ready(Ok(()));
        }

        let remaining = &data[pos..];
        let to_read = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..to_read]);
        self.responses.set_position((pos + to_read) as u64);

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.sent.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

const TIMEOUT: Duration = Duration::from_secs(5);

fn creds() -> Credentials {
    Credentials::new("a@pec.it", "password")
}

#[tokio::test]
async fn login_select_search_fetch_round_trip() {
    let raw = b"From: b@pec.it\r\nSubject: Ricevuta\r\n\r\nBody.";
    let mut wire = Vec::new();
    wire.extend_from_slice(b"* OK PEC IMAP server ready\r\n");
    wire.extend_from_slice(b"A0001 OK LOGIN completed\r\n");
    wire.extend_from_slice(b"* 3 EXISTS\r\n");
    wire.extend_from_slice(b"* OK [UIDVALIDITY 42] UIDs valid\r\n");
    wire.extend_from_slice(b"A0002 OK [READ-ONLY] EXAMINE completed\r\n");
    wire.extend_from_slice(b"* SEARCH 101 97\r\n");
    wire.extend_from_slice(b"A0003 OK SEARCH completed\r\n");
    wire.extend_from_slice(
        format!("* 1 FETCH (UID 97 FLAGS (\\Seen) BODY[] {{{}}}\r\n", raw.len()).as_bytes(),
    );
    wire.extend_from_slice(raw);
    wire.extend_from_slice(b")\r\n");
    wire.extend_from_slice(b"A0004 OK FETCH completed\r\n");
    wire.extend_from_slice(b"* BYE logging out\r\n");
    wire.extend_from_slice(b"A0005 OK LOGOUT completed\r\n");

    let mut client = Client::from_stream(MockStream::new(&wire), TIMEOUT)
        .await
        .unwrap();
    client.login(&creds()).await.unwrap();

    let exists = client.examine("INBOX").await.unwrap();
    assert_eq!(exists, 3);

    let uids = client
        .uid_search_on(SearchDate::new(2024, 1, 15).unwrap())
        .await
        .unwrap();
    assert_eq!(uids, vec![97, 101], "UIDs must come back ascending");

    let message = client.uid_fetch(97).await.unwrap();
    assert_eq!(message.uid, 97);
    assert_eq!(message.body, raw);
    assert!(!message.is_unread());

    client.logout().await.unwrap();
}

#[tokio::test]
async fn commands_are_sent_in_wire_format() {
    let mut wire = Vec::new();
    wire.extend_from_slice(b"* OK ready\r\n");
    wire.extend_from_slice(b"A0001 OK done\r\n");
    wire.extend_from_slice(b"A0002 OK done\r\n");
    wire.extend_from_slice(b"A0003 OK done\r\n");

    let mut mock = MockStream::new(&wire);
    {
        let mut client = Client::from_stream(&mut mock, TIMEOUT).await.unwrap();
        client.login(&creds()).await.unwrap();
        client.examine("Posta inviata").await.unwrap();
        client
            .uid_search_on(SearchDate::new(2024, 1, 15).unwrap())
            .await
            .unwrap();
    }

    let sent = mock.sent_text();
    assert!(sent.contains("A0001 LOGIN \"a@pec.it\" \"password\"\r\n"));
    assert!(sent.contains("A0002 EXAMINE \"Posta inviata\"\r\n"));
    assert!(sent.contains("A0003 UID SEARCH ON 15-Jan-2024\r\n"));
}

#[tokio::test]
async fn rejected_login_is_auth_error() {
    let mut wire = Vec::new();
    wire.extend_from_slice(b"* OK ready\r\n");
    wire.extend_from_slice(b"A0001 NO [AUTHENTICATIONFAILED] invalid credentials\r\n");

    let mut client = Client::from_stream(MockStream::new(&wire), TIMEOUT)
        .await
        .unwrap();
    let err = client.login(&creds()).await.unwrap_err();
    assert!(matches!(err, Error::Auth(_)));
    assert!(!err.is_transient(), "auth rejection must not be retried");
}

#[tokio::test]
async fn missing_folder_is_no_error() {
    let mut wire = Vec::new();
    wire.extend_from_slice(b"* OK ready\r\n");
    wire.extend_from_slice(b"A0001 OK LOGIN completed\r\n");
    wire.extend_from_slice(b"A0002 NO mailbox does not exist\r\n");

    let mut client = Client::from_stream(MockStream::new(&wire), TIMEOUT)
        .await
        .unwrap();
    client.login(&creds()).await.unwrap();

    let err = client.examine("Nope").await.unwrap_err();
    assert!(matches!(err, Error::No(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn mid_command_bye_is_transient() {
    let mut wire = Vec::new();
    wire.extend_from_slice(b"* OK ready\r\n");
    wire.extend_from_slice(b"A0001 OK LOGIN completed\r\n");
    wire.extend_from_slice(b"* BYE shutting down for maintenance\r\n");

    let mut client = Client::from_stream(MockStream::new(&wire), TIMEOUT)
        .await
        .unwrap();
    client.login(&creds()).await.unwrap();

    let err = client.examine("INBOX").await.unwrap_err();
    assert!(matches!(err, Error::Bye(_)));
    assert!(err.is_transient(), "connection loss is worth a retry");
}

#[tokio::test]
async fn truncated_stream_is_io_error() {
    let mut wire = Vec::new();
    wire.extend_from_slice(b"* OK ready\r\n");
    wire.extend_from_slice(b"A0001 OK LOGIN completed\r\n");
    // Stream ends mid-command.

    let mut client = Client::from_stream(MockStream::new(&wire), TIMEOUT)
        .await
        .unwrap();
    client.login(&creds()).await.unwrap();

    let err = client.examine("INBOX").await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn empty_search_yields_no_uids() {
    let mut wire = Vec::new();
    wire.extend_from_slice(b"* OK ready\r\n");
    wire.extend_from_slice(b"A0001 OK LOGIN completed\r\n");
    wire.extend_from_slice(b"* SEARCH\r\n");
    wire.extend_from_slice(b"A0002 OK SEARCH completed\r\n");

    let mut client = Client::from_stream(MockStream::new(&wire), TIMEOUT)
        .await
        .unwrap();
    client.login(&creds()).await.unwrap();

    let uids = client
        .uid_search_on(SearchDate::new(2024, 1, 15).unwrap())
        .await
        .unwrap();
    assert!(uids.is_empty());
}
