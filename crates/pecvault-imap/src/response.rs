//! Minimal response parsing for archival retrieval.
//!
//! The archiver only issues LOGIN, SELECT, UID SEARCH and UID FETCH, so
//! this module parses exactly the responses those commands produce:
//! tagged completions, `* SEARCH`, `* <n> EXISTS` and `* <n> FETCH` with
//! a body literal. Everything else is passed over untouched.

/// Tagged command completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Command succeeded.
    Ok,
    /// Operational rejection (e.g. unknown mailbox, bad credentials).
    No,
    /// Protocol-level rejection.
    Bad,
}

/// A parsed tagged completion line.
#[derive(Debug, Clone)]
pub struct TaggedResponse {
    /// Completion status.
    pub status: Status,
    /// Human-readable text after the status word.
    pub text: String,
}

/// One message fetched from the server.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    /// Server-assigned UID (stable within a mailbox).
    pub uid: u32,
    /// IMAP flags, e.g. `\Seen`.
    pub flags: Vec<String>,
    /// Raw RFC822 bytes.
    pub body: Vec<u8>,
}

impl FetchedMessage {
    /// Returns true if the message does not carry the `\Seen` flag.
    #[must_use]
    pub fn is_unread(&self) -> bool {
        !self
            .flags
            .iter()
            .any(|f| f.eq_ignore_ascii_case("\\Seen"))
    }
}

/// Parses a tagged completion line for `tag`, if this line is one.
#[must_use]
pub fn parse_tagged(line: &[u8], tag: &str) -> Option<TaggedResponse> {
    let text = std::str::from_utf8(line).ok()?.trim_end();
    let rest = text.strip_prefix(tag)?.strip_prefix(' ')?;

    let (status, text) = if let Some(t) = rest.strip_prefix("OK") {
        (Status::Ok, t)
    } else if let Some(t) = rest.strip_prefix("NO") {
        (Status::No, t)
    } else if let Some(t) = rest.strip_prefix("BAD") {
        (Status::Bad, t)
    } else {
        return None;
    };

    Some(TaggedResponse {
        status,
        text: text.trim().to_string(),
    })
}

/// Returns the BYE text if the line is an untagged BYE.
#[must_use]
pub fn parse_bye(line: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(line).ok()?.trim_end();
    text.strip_prefix("* BYE").map(|t| t.trim().to_string())
}

/// Parses `* SEARCH 4 12 97` into UIDs. Returns None for other lines.
#[must_use]
pub fn parse_search(line: &[u8]) -> Option<Vec<u32>> {
    let text = std::str::from_utf8(line).ok()?.trim_end();
    let rest = text.strip_prefix("* SEARCH")?;
    Some(
        rest.split_ascii_whitespace()
            .filter_map(|tok| tok.parse().ok())
            .collect(),
    )
}

/// Parses `* <n> EXISTS`. Returns None for other lines.
#[must_use]
pub fn parse_exists(line: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(line).ok()?.trim_end();
    let rest = text.strip_prefix("* ")?;
    let (count, keyword) = rest.split_once(' ')?;
    if keyword != "EXISTS" {
        return None;
    }
    count.parse().ok()
}

/// Parses an untagged FETCH response carrying FLAGS and a body literal.
///
/// `response` is the complete framed response: the announcing line, the
/// literal bytes, and the closing `)` line. Returns None if this is not
/// a FETCH response or it carries no literal.
#[must_use]
pub fn parse_fetch(response: &[u8]) -> Option<FetchedMessage> {
    let line_end = response.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&response[..line_end]).ok()?;

    // "* 12 FETCH (UID 100 FLAGS (\Seen) BODY[] {1423}"
    let rest = line.strip_prefix("* ")?;
    let (_, items) = rest.split_once(" FETCH ")?;

    let uid = attribute_value(items, "UID")?.parse().ok()?;
    let flags = parse_flag_list(items);

    let open = line.rfind('{')?;
    let close = line.rfind('}')?;
    let len: usize = line.get(open + 1..close)?.parse().ok()?;

    let body_start = line_end + 2;
    let body = response.get(body_start..body_start + len)?.to_vec();

    Some(FetchedMessage { uid, flags, body })
}

/// Extracts the value following an attribute keyword, e.g. `UID 100`.
fn attribute_value<'a>(items: &'a str, keyword: &str) -> Option<&'a str> {
    let mut tokens = items
        .trim_start_matches('(')
        .split_ascii_whitespace()
        .peekable();
    while let Some(tok) = tokens.next() {
        if tok == keyword {
            return tokens.peek().copied();
        }
    }
    None
}

/// Extracts the parenthesized flag list after `FLAGS`, if present.
fn parse_flag_list(items: &str) -> Vec<String> {
    let Some(start) = items.find("FLAGS (") else {
        return Vec::new();
    };
    let inner = &items[start + "FLAGS (".len()..];
    let Some(end) = inner.find(')') else {
        return Vec::new();
    };
    inner[..end]
        .split_ascii_whitespace()
        .map(ToString::to_string)
        .collect()
}
