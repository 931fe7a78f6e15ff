//! Envelope header extraction from raw RFC822 bytes.

use mail_parser::MessageParser;

/// The header fields the index records per message.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Decoded Subject header.
    pub subject: String,
    /// First From address.
    pub from: String,
    /// First To address.
    pub to: String,
    /// Date header, RFC3339-formatted. Empty if missing or unparseable.
    pub date: String,
}

/// Extracts envelope headers from a raw message.
///
/// Unparseable messages yield an empty envelope rather than an error:
/// a malformed PEC receipt must still be archived and indexed by path.
#[must_use]
pub fn parse_envelope(raw: &[u8]) -> Envelope {
    let Some(parsed) = MessageParser::default().parse(raw) else {
        return Envelope::default();
    };

    Envelope {
        subject: parsed.subject().unwrap_or_default().to_string(),
        from: parsed
            .from()
            .and_then(|f| f.first())
            .and_then(|a| a.address())
            .unwrap_or_default()
            .to_string(),
        to: parsed
            .to()
            .and_then(|t| t.first())
            .and_then(|a| a.address())
            .unwrap_or_default()
            .to_string(),
        date: parsed.date().map(|d| d.to_rfc3339()).unwrap_or_default(),
    }
}
