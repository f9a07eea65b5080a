//! Incremental decoder for IMAP server responses.
//!
//! Bytes are fed in whatever chunks the transport delivers; [`Parser::next_record`]
//! hands back one complete record at a time, in arrival order. A record is a line
//! terminated by CRLF, extended across any `{n}` literals it announces. A record that
//! cannot be decoded turns into a [`DecodeError`] and the following records are
//! unaffected.

use crate::imap::types::{
    FolderAttribute, ImapCapability, Response, ResponseCode, ResponseStatus, State, StatusItem,
    UntaggedData,
};
use crate::imap::CommandHandle;
use thiserror::Error;

/// Literals above this size are not treated as literals
const MAX_LITERAL: usize = 64 * 1024 * 1024;

/// Longest line (outside literals) buffered while waiting for its terminator
pub const MAX_LINE: usize = 64 * 1024;

/// Bytes of an over-long line kept in the resulting [`DecodeError`]
const OVERSIZED_EXCERPT: usize = 256;

/// Malformed server data, carrying the bytes that could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed response ({reason}): {}", lossy(.offending).trim_end())]
pub struct DecodeError {
    pub offending: Vec<u8>,
    pub reason: String,
}

/// Byte-stream to response-record decoder for one connection
#[derive(Debug, Default)]
pub struct Parser {
    buffer: Vec<u8>,
    /// Dropping the tail of an over-long line up to its terminator
    skipping: bool,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the connection
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for the rest of their record
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete record, or `None` when more bytes are needed
    pub fn next_record(&mut self) -> Option<Result<Response, DecodeError>> {
        if self.skipping {
            let newline = match self.buffer.iter().position(|&b| b == b'\n') {
                Some(newline) => newline,
                None => {
                    self.buffer.clear();
                    return None;
                }
            };
            self.buffer.drain(..=newline);
            self.skipping = false;
        }

        match record_len(&self.buffer) {
            Framing::Complete(len) => {
                let record: Vec<u8> = self.buffer.drain(..len).collect();
                Some(decode_record(&record))
            }
            Framing::Incomplete => None,
            Framing::Oversized => {
                let excerpt = self.buffer.len().min(OVERSIZED_EXCERPT);
                let offending = self.buffer[..excerpt].to_vec();
                tracing::warn!(
                    "Discarding response line longer than {} bytes ({} buffered)",
                    MAX_LINE,
                    self.buffer.len()
                );
                self.buffer.clear();
                self.skipping = true;
                Some(Err(DecodeError {
                    offending,
                    reason: format!("line exceeds {} bytes", MAX_LINE),
                }))
            }
        }
    }
}

enum Framing {
    Complete(usize),
    Incomplete,
    /// No terminator within [`MAX_LINE`] bytes
    Oversized,
}

/// Frame the first record in `buf`
fn record_len(buf: &[u8]) -> Framing {
    let mut pos = 0;
    loop {
        let newline = match buf[pos..].iter().position(|&b| b == b'\n') {
            Some(offset) => pos + offset,
            None if buf.len() - pos > MAX_LINE => return Framing::Oversized,
            None => return Framing::Incomplete,
        };
        match literal_size(&buf[pos..newline]) {
            Some(size) => {
                let end = newline + 1 + size;
                if buf.len() < end {
                    return Framing::Incomplete;
                }
                pos = end;
            }
            None => return Framing::Complete(newline + 1),
        }
    }
}

/// Size announced by a trailing `{n}` or `{n+}`
fn literal_size(line: &[u8]) -> Option<usize> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let inner = line.strip_suffix(b"}")?;
    let open = inner.iter().rposition(|&b| b == b'{')?;
    let digits = &inner[open + 1..];
    let digits = digits.strip_suffix(b"+").unwrap_or(digits);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let size: usize = std::str::from_utf8(digits).ok()?.parse().ok()?;
    (size <= MAX_LITERAL).then_some(size)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn trim_crlf(record: &[u8]) -> &[u8] {
    let record = record.strip_suffix(b"\n").unwrap_or(record);
    record.strip_suffix(b"\r").unwrap_or(record)
}

/// Decode one framed record
pub fn decode_record(record: &[u8]) -> Result<Response, DecodeError> {
    let fail = |reason: String| DecodeError {
        offending: record.to_vec(),
        reason,
    };

    let line = trim_crlf(record);
    if line.is_empty() {
        return Err(fail("empty line".to_string()));
    }
    if line[0] == b'+' {
        return Ok(Response::Continuation(lossy(&line[1..]).trim().to_string()));
    }

    let mut cursor = Cursor::new(line);
    let tag = cursor.word().ok_or_else(|| fail("missing tag".to_string()))?;
    if tag == b"*" {
        return decode_untagged(&mut cursor).map_err(fail);
    }

    if !tag.iter().all(|b| b.is_ascii_graphic() && !b"(){%*\"\\+".contains(b)) {
        return Err(fail("invalid tag".to_string()));
    }
    let status = cursor
        .word()
        .and_then(|word| ResponseStatus::from_str(&lossy(word)))
        .filter(|status| matches!(status, ResponseStatus::Ok | ResponseStatus::No | ResponseStatus::Bad))
        .ok_or_else(|| fail("tagged response without OK/NO/BAD".to_string()))?;
    let (code, text) = decode_resp_text(cursor.rest()).map_err(fail)?;

    Ok(Response::State(State {
        tag: Some(CommandHandle::from_wire(&lossy(tag))),
        status,
        code,
        text,
    }))
}

fn decode_untagged(cursor: &mut Cursor<'_>) -> Result<Response, String> {
    let first = cursor.word().ok_or("empty untagged response")?;
    let first = lossy(first);

    if first.bytes().all(|b| b.is_ascii_digit()) {
        let number: u32 = first
            .parse()
            .map_err(|_| format!("number out of range: {}", first))?;
        let keyword = cursor
            .word()
            .map(|w| lossy(w).to_uppercase())
            .ok_or("missing keyword after number")?;
        let data = match keyword.as_str() {
            "EXISTS" => UntaggedData::Exists(number),
            "RECENT" => UntaggedData::Recent(number),
            "EXPUNGE" => UntaggedData::Expunge(number),
            "FETCH" => UntaggedData::Fetch {
                sequence: number,
                data: lossy(cursor.rest()).trim().to_string(),
            },
            other => return Err(format!("unknown numeric response {}", other)),
        };
        return Ok(Response::Data(data));
    }

    let keyword = first.to_uppercase();
    match keyword.as_str() {
        "OK" | "NO" | "BAD" | "PREAUTH" | "BYE" => {
            let status = ResponseStatus::from_str(&keyword).ok_or("unknown status")?;
            let (code, text) = decode_resp_text(cursor.rest())?;
            Ok(Response::State(State {
                tag: None,
                status,
                code,
                text,
            }))
        }
        "CAPABILITY" => {
            let rest = lossy(cursor.rest());
            let capabilities = rest.split_whitespace().map(ImapCapability::from_str).collect();
            Ok(Response::Data(UntaggedData::Capability(capabilities)))
        }
        "LIST" | "LSUB" => decode_list(cursor),
        "STATUS" => decode_status(cursor),
        "FLAGS" => {
            let flags = cursor.atom_list()?;
            Ok(Response::Data(UntaggedData::Flags(flags)))
        }
        "SEARCH" => {
            let rest = lossy(cursor.rest());
            let numbers = rest
                .split_whitespace()
                .map(|n| n.parse::<u32>().map_err(|_| format!("invalid SEARCH result {}", n)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Response::Data(UntaggedData::Search(numbers)))
        }
        _ => Ok(Response::Data(UntaggedData::Other {
            keyword,
            raw: lossy(cursor.rest()).trim().to_string(),
        })),
    }
}

/// `[CODE args] human text`
fn decode_resp_text(rest: &[u8]) -> Result<(Option<ResponseCode>, String), String> {
    let text = lossy(rest);
    let text = text.trim();
    if let Some(inner) = text.strip_prefix('[') {
        let end = inner.find(']').ok_or("unterminated response code")?;
        let code = decode_code(&inner[..end])?;
        Ok((Some(code), inner[end + 1..].trim().to_string()))
    } else {
        Ok((None, text.to_string()))
    }
}

fn decode_code(code: &str) -> Result<ResponseCode, String> {
    let mut parts = code.split_whitespace();
    let name = parts.next().unwrap_or("").to_uppercase();
    let number = |value: Option<&str>| -> Result<u32, String> {
        value
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| format!("response code {} needs a number", name))
    };
    let decoded = match name.as_str() {
        "ALERT" => ResponseCode::Alert,
        "PARSE" => ResponseCode::Parse,
        "READ-ONLY" => ResponseCode::ReadOnly,
        "READ-WRITE" => ResponseCode::ReadWrite,
        "TRYCREATE" => ResponseCode::TryCreate,
        "UIDNEXT" => ResponseCode::UidNext(number(parts.next())?),
        "UIDVALIDITY" => ResponseCode::UidValidity(number(parts.next())?),
        "UNSEEN" => ResponseCode::Unseen(number(parts.next())?),
        "CAPABILITY" => {
            ResponseCode::Capability(parts.map(ImapCapability::from_str).collect())
        }
        _ => ResponseCode::Other(code.to_string()),
    };
    Ok(decoded)
}

fn decode_list(cursor: &mut Cursor<'_>) -> Result<Response, String> {
    let attributes = cursor
        .atom_list()?
        .iter()
        .map(|a| FolderAttribute::from_str(a))
        .collect();
    let delimiter = match cursor.token()? {
        Some(Token::Str(s)) => Some(s),
        Some(Token::Atom(a)) if a.eq_ignore_ascii_case("NIL") => None,
        _ => return Err("malformed LIST delimiter".to_string()),
    };
    let mailbox = match cursor.token()? {
        Some(Token::Str(s)) | Some(Token::Atom(s)) => s,
        _ => return Err("missing LIST mailbox".to_string()),
    };
    Ok(Response::Data(UntaggedData::List {
        attributes,
        delimiter,
        mailbox,
    }))
}

fn decode_status(cursor: &mut Cursor<'_>) -> Result<Response, String> {
    let mailbox = match cursor.token()? {
        Some(Token::Str(s)) | Some(Token::Atom(s)) => s,
        _ => return Err("missing STATUS mailbox".to_string()),
    };
    if cursor.token()? != Some(Token::Open) {
        return Err("STATUS without item list".to_string());
    }
    let mut items = Vec::new();
    loop {
        let name = match cursor.token()? {
            Some(Token::Close) => break,
            Some(Token::Atom(name)) => name,
            _ => return Err("malformed STATUS item list".to_string()),
        };
        let value = match cursor.token()? {
            Some(Token::Atom(value)) => value
                .parse::<u64>()
                .map_err(|_| format!("invalid STATUS value for {}", name))?,
            _ => return Err(format!("missing STATUS value for {}", name)),
        };
        // items we do not track (HIGHESTMODSEQ, SIZE, ...) are skipped
        if let Some(item) = StatusItem::from_str(&name) {
            let value = u32::try_from(value).map_err(|_| format!("{} out of range", name))?;
            items.push((item, value));
        }
    }
    Ok(Response::Data(UntaggedData::Status { mailbox, items }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Atom(String),
    Str(String),
    Open,
    Close,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn skip_spaces(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos] == b' ' {
            self.pos += 1;
        }
    }

    fn rest(&mut self) -> &'a [u8] {
        self.skip_spaces();
        &self.bytes[self.pos..]
    }

    /// Next space-delimited word
    fn word(&mut self) -> Option<&'a [u8]> {
        self.skip_spaces();
        if self.pos >= self.bytes.len() {
            return None;
        }
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b' ' {
            self.pos += 1;
        }
        Some(&self.bytes[start..self.pos])
    }

    /// `(atom atom ...)`
    fn atom_list(&mut self) -> Result<Vec<String>, String> {
        if self.token()? != Some(Token::Open) {
            return Err("expected parenthesized list".to_string());
        }
        let mut atoms = Vec::new();
        loop {
            match self.token()? {
                Some(Token::Close) => return Ok(atoms),
                Some(Token::Atom(atom)) => atoms.push(atom),
                _ => return Err("malformed parenthesized list".to_string()),
            }
        }
    }

    fn token(&mut self) -> Result<Option<Token>, String> {
        self.skip_spaces();
        let Some(&first) = self.bytes.get(self.pos) else {
            return Ok(None);
        };
        match first {
            b'(' => {
                self.pos += 1;
                Ok(Some(Token::Open))
            }
            b')' => {
                self.pos += 1;
                Ok(Some(Token::Close))
            }
            b'"' => {
                self.pos += 1;
                let mut out = Vec::new();
                loop {
                    let b = *self.bytes.get(self.pos).ok_or("unterminated quoted string")?;
                    self.pos += 1;
                    match b {
                        b'\\' => {
                            let escaped =
                                *self.bytes.get(self.pos).ok_or("unterminated quoted string")?;
                            out.push(escaped);
                            self.pos += 1;
                        }
                        b'"' => break,
                        _ => out.push(b),
                    }
                }
                Ok(Some(Token::Str(lossy(&out))))
            }
            b'{' => {
                let close = self.bytes[self.pos..]
                    .iter()
                    .position(|&b| b == b'}')
                    .ok_or("unterminated literal size")?
                    + self.pos;
                let digits = &self.bytes[self.pos + 1..close];
                let digits = digits.strip_suffix(b"+").unwrap_or(digits);
                let size: usize = std::str::from_utf8(digits)
                    .ok()
                    .and_then(|d| d.parse().ok())
                    .ok_or("invalid literal size")?;
                let mut start = close + 1;
                if self.bytes.get(start) == Some(&b'\r') {
                    start += 1;
                }
                if self.bytes.get(start) != Some(&b'\n') {
                    return Err("literal size not followed by CRLF".to_string());
                }
                start += 1;
                let end = start + size;
                if end > self.bytes.len() {
                    return Err("truncated literal".to_string());
                }
                self.pos = end;
                Ok(Some(Token::Str(lossy(&self.bytes[start..end]))))
            }
            _ => {
                let start = self.pos;
                while self.pos < self.bytes.len()
                    && !matches!(self.bytes[self.pos], b' ' | b'(' | b')' | b'\r' | b'\n')
                {
                    self.pos += 1;
                }
                Ok(Some(Token::Atom(lossy(&self.bytes[start..self.pos]))))
            }
        }
    }
}
