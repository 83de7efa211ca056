//! Header access for raw messages

use mail_parser::MessageParser;
use std::borrow::Cow;

#[derive(Debug, Clone)]
struct HeaderField {
    name: String,
    /// Unfolded value as it appears on the wire
    raw: String,
    /// Value with RFC 2047 encoded words resolved
    text: String,
}

/// Header block and body of a raw message
#[derive(Debug, Clone)]
pub struct ParsedMessage<'a> {
    headers: Vec<HeaderField>,
    body: &'a [u8],
}

impl<'a> ParsedMessage<'a> {
    /// Parse the header block of `raw` and locate the body.
    ///
    /// Input that carries no header block yields no headers and the whole
    /// input as body.
    pub fn parse(raw: &'a [u8]) -> Self {
        let parser = MessageParser::new()
            .with_mime_headers()
            .default_header_text();
        let message = match parser.parse(raw) {
            Some(message) => message,
            None => {
                return Self {
                    headers: Vec::new(),
                    body: raw,
                }
            }
        };

        let headers = message
            .headers()
            .iter()
            .map(|header| {
                let end = header.offset_end.min(raw.len());
                let start = header.offset_start.min(end);
                let raw_value = unfold(&String::from_utf8_lossy(&raw[start..end]));
                let text = header
                    .value
                    .as_text()
                    .map(|text| text.trim().to_string())
                    .unwrap_or_else(|| raw_value.clone());
                HeaderField {
                    name: header.name.as_str().to_string(),
                    raw: raw_value,
                    text,
                }
            })
            .collect();

        let body_start = message.root_part().raw_body_offset().min(raw.len());
        Self {
            headers,
            body: &raw[body_start..],
        }
    }

    fn field(&self, name: &str) -> Option<&HeaderField> {
        self.headers
            .iter()
            .find(|field| field.name.eq_ignore_ascii_case(name))
    }

    /// First value of `name`, compared case-insensitively
    pub fn get(&self, name: &str) -> Option<&str> {
        self.field(name).map(|field| field.raw.as_str())
    }

    /// Like [`get`](Self::get) with encoded words decoded
    pub fn get_text(&self, name: &str) -> Option<&str> {
        self.field(name).map(|field| field.text.as_str())
    }

    /// First non-empty value among `names`, in order
    pub fn first_of(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.get(name))
            .find(|value| !value.is_empty())
    }

    /// First non-empty decoded value among `names`, in order
    pub fn first_text_of(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.get_text(name))
            .find(|value| !value.is_empty())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|field| (field.name.as_str(), field.raw.as_str()))
    }

    pub fn body(&self) -> &'a [u8] {
        self.body
    }

    /// At most `limit` bytes of the body as text
    pub fn body_prefix(&self, limit: usize) -> Cow<'a, str> {
        let end = self.body.len().min(limit);
        String::from_utf8_lossy(&self.body[..end])
    }
}

fn unfold(value: &str) -> String {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
