use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::headers::{self, HeaderMap};

/// Mailbox flags stored next to a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    pub seen: bool,
    pub flagged: bool,
}

/// A mail message used as the stored form of one communication record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireMessage {
    pub headers: HeaderMap,
    pub body: String,
    pub flags: MessageFlags,
}

impl WireMessage {
    pub fn new(headers: HeaderMap, body: impl Into<String>) -> Self {
        Self {
            headers,
            body: body.into(),
            flags: MessageFlags::default(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Value of the `Message-ID` header without angle brackets.
    pub fn message_id(&self) -> Option<&str> {
        self.header(headers::MESSAGE_ID)
            .map(|value| value.trim().trim_start_matches('<').trim_end_matches('>'))
            .filter(|value| !value.is_empty())
    }

    /// Timestamp (ms) of the record this message carries: the private date
    /// header, else the standard `Date` header.
    pub fn record_timestamp(&self) -> Option<i64> {
        let private = self
            .header(headers::DATE)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .and_then(|value| value.parse::<i64>().ok());
        private.or_else(|| {
            self.header(headers::DATE_STANDARD)
                .and_then(|value| mailparse::dateparse(value).ok())
                .map(|seconds| seconds.saturating_mul(1000))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.body.trim().is_empty()
    }

    /// Parses a raw RFC 5322 message, decoding transfer encodings and charsets.
    pub fn parse(raw: &[u8]) -> Result<Self, CodecError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(CodecError::MalformedInput("message is empty".into()));
        }
        let parsed = mailparse::parse_mail(raw)
            .map_err(|err| CodecError::MalformedInput(err.to_string()))?;
        let headers: HeaderMap = parsed
            .headers
            .iter()
            .map(|header| (header.get_key(), header.get_value()))
            .collect();
        let body = text_body(&parsed)
            .map_err(|err| CodecError::MalformedInput(format!("unreadable body: {err}")))?;
        Ok(Self::new(headers, body))
    }

    /// Renders the message with an 8bit UTF-8 body.
    pub fn to_rfc822(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 512);
        for (name, value) in self.headers.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&unfold(value));
            out.push_str("\r\n");
        }
        if !self.headers.contains(headers::CONTENT_TRANSFER_ENCODING) {
            out.push_str(headers::CONTENT_TRANSFER_ENCODING);
            out.push_str(": 8bit\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

fn text_body(parsed: &mailparse::ParsedMail<'_>) -> Result<String, mailparse::MailParseError> {
    if parsed.subparts.is_empty() {
        return parsed.get_body();
    }
    match parsed
        .subparts
        .iter()
        .find(|part| part.ctype.mimetype.eq_ignore_ascii_case("text/plain"))
    {
        Some(part) => text_body(part),
        None => text_body(&parsed.subparts[0]),
    }
}

fn unfold(value: &str) -> String {
    value
        .split(['\r', '\n'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
