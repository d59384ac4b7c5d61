use std::collections::BTreeMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use encoding_rs::UTF_8;

use crate::constants::{self, CRLF, CRLF_CRLF, HEADER_SEPARATOR};
use crate::error::IllegalFormat;

/// The headers of one part.
///
/// Lookups ignore ASCII case. When a name repeats, the first spelling of the name is kept together with the last
/// value. Iteration is ordered by the lower-cased name, which makes the serialised form deterministic.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PartHeaders {
    entries: BTreeMap<String, (String, String)>,
}

impl PartHeaders {
    /// Creates an empty header map.
    pub fn new() -> PartHeaders {
        PartHeaders::default()
    }

    /// Inserts a header, returning the value it replaced.
    pub fn insert<N, V>(&mut self, name: N, value: V) -> Option<String>
    where
        N: Into<String>,
        V: Into<String>,
    {
        let name = name.into();
        let key = name.to_ascii_lowercase();

        match self.entries.get_mut(&key) {
            Some(entry) => Some(std::mem::replace(&mut entry.1, value.into())),
            None => {
                self.entries.insert(key, (name, value.into()));
                None
            }
        }
    }

    /// Returns the value of the header `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    /// Whether a header called `name` exists, ignoring case.
    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Iterates over `(name, value)` pairs, ordered by the lower-cased name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// The number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N, V> std::iter::FromIterator<(N, V)> for PartHeaders
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = PartHeaders::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

impl fmt::Debug for PartHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Parses a header block: the bytes from the CRLF ending a delimiter line up to and including the CRLF CRLF that
/// ends the headers.
pub(crate) fn parse_headers(block: &[u8]) -> Result<PartHeaders, IllegalFormat> {
    let mut headers = PartHeaders::new();

    if block == CRLF_CRLF.as_bytes() {
        return Ok(headers);
    }

    if !block.starts_with(CRLF.as_bytes()) || !block.ends_with(CRLF_CRLF.as_bytes()) {
        return Err(IllegalFormat::HeadersImproperlyConstructed);
    }

    let body = &block[CRLF.len()..block.len() - CRLF_CRLF.len()];
    let mut folded: Option<String> = None;

    for line in split_lines(body) {
        let line = decode(line);

        // A continuation line joins the header before it, keeping the line break. Leading whitespace on the first
        // line is trimmed off the name.
        if line.starts_with(|c: char| c == constants::SPACE as char || c == constants::TAB as char) {
            if let Some(current) = folded.as_mut() {
                current.push_str(CRLF);
                current.push_str(&line);
                continue;
            }
        }

        if let Some(previous) = folded.replace(line) {
            insert_line(&mut headers, &previous)?;
        }
    }

    if let Some(last) = folded {
        insert_line(&mut headers, &last)?;
    }

    Ok(headers)
}

fn insert_line(headers: &mut PartHeaders, line: &str) -> Result<(), IllegalFormat> {
    match line.find(':') {
        Some(idx) => {
            headers.insert(line[..idx].trim(), line[idx + 1..].trim());
            Ok(())
        }
        None => Err(IllegalFormat::HeaderImproperlyFormatted),
    }
}

fn split_lines(body: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = Some(body);

    std::iter::from_fn(move || {
        let current = rest?;
        match memchr::memmem::find(current, CRLF.as_bytes()) {
            Some(idx) => {
                rest = Some(&current[idx + CRLF.len()..]);
                Some(&current[..idx])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

pub(crate) fn decode(bytes: &[u8]) -> String {
    let (text, _) = UTF_8.decode_without_bom_handling(bytes);
    text.into_owned()
}

/// Serialises `delimiter CRLF (name ": " value CRLF)* CRLF`, the bytes a writer emits before a part's body.
pub(crate) fn serialize_boundary_and_headers(delimiter: &[u8], headers: &PartHeaders) -> Bytes {
    let mut buf = BytesMut::with_capacity(delimiter.len() + CRLF_CRLF.len() + 32 * headers.len());

    buf.put_slice(delimiter);
    buf.put_slice(CRLF.as_bytes());
    for (name, value) in headers.iter() {
        buf.put_slice(name.as_bytes());
        buf.put_slice(HEADER_SEPARATOR.as_bytes());
        buf.put_slice(value.as_bytes());
        buf.put_slice(CRLF.as_bytes());
    }
    buf.put_slice(CRLF.as_bytes());

    buf.freeze()
}
