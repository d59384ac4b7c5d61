use bytes::{Buf, Bytes, BytesMut};
use memchr::memmem::Finder;

use crate::constants::{self, BOUNDARY_EXT, CRLF, CRLF_CRLF};
use crate::error::IllegalFormat;

/// Unconsumed bytes carried over between chunk deliveries, plus the delimiter matchers for one boundary.
///
/// Only the reader mutates it. Body bytes are handed out as frozen slices, so delivering data never copies.
pub(crate) struct PartBuffer {
    buf: BytesMut,
    // `CRLF "--" boundary`
    delimiter: Vec<u8>,
    finder: Finder<'static>,
    // `"--" boundary`
    bare: Finder<'static>,
    header_end: Finder<'static>,
}

/// Where the first delimiter of a stream sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FirstDelimiter {
    pub(crate) preamble_len: usize,
    pub(crate) token_len: usize,
}

/// What the bytes at the head of a body region are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyScan {
    /// The buffer starts with a delimiter: the current body is exhausted.
    AtDelimiter,
    /// This many bytes can be released without consuming a possible delimiter.
    Data(usize),
}

/// How the bytes right after a delimiter token continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delimiter {
    NeedMore,
    Terminal,
    /// A header block occupies `lwsp..block_end`; it starts with CRLF and ends with CRLF CRLF.
    Part { lwsp: usize, block_end: usize },
    Malformed(IllegalFormat),
}

impl PartBuffer {
    pub(crate) fn new(boundary: &str) -> PartBuffer {
        let delimiter = format!("{}{}{}", CRLF, BOUNDARY_EXT, boundary).into_bytes();
        let finder = Finder::new(&delimiter).into_owned();
        let bare = Finder::new(&delimiter[CRLF.len()..]).into_owned();

        PartBuffer {
            buf: BytesMut::new(),
            delimiter,
            finder,
            bare,
            header_end: Finder::new(CRLF_CRLF.as_bytes()).into_owned(),
        }
    }

    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn delimiter_len(&self) -> usize {
        self.delimiter.len()
    }

    /// Length of `CRLF "--" boundary "--"`, the least a body scan needs to make progress.
    pub(crate) fn finishing_len(&self) -> usize {
        self.delimiter.len() + BOUNDARY_EXT.len()
    }

    /// Finds the first delimiter of the stream. It may sit at offset zero without its leading CRLF.
    ///
    /// Any other `"--" boundary` that is not preceded by CRLF is malformed.
    pub(crate) fn find_first_delimiter(&self) -> Result<Option<FirstDelimiter>, IllegalFormat> {
        let idx = match self.bare.find(&self.buf) {
            Some(idx) => idx,
            None => return Ok(None),
        };

        if idx == 0 {
            return Ok(Some(FirstDelimiter {
                preamble_len: 0,
                token_len: self.delimiter.len() - CRLF.len(),
            }));
        }

        if idx >= CRLF.len() && &self.buf[idx - CRLF.len()..idx] == CRLF.as_bytes() {
            return Ok(Some(FirstDelimiter {
                preamble_len: idx - CRLF.len(),
                token_len: self.delimiter.len(),
            }));
        }

        Err(IllegalFormat::HeadersImproperlyConstructed)
    }

    /// Scans a body region. The caller guarantees at least [`finishing_len`](Self::finishing_len) bytes.
    pub(crate) fn scan_body(&self) -> BodyScan {
        match self.finder.find(&self.buf) {
            Some(0) => BodyScan::AtDelimiter,
            Some(idx) => BodyScan::Data(idx),
            // The tail may hold the beginning of a delimiter split across chunks.
            None => BodyScan::Data(self.buf.len().saturating_sub(self.delimiter.len() - 1)),
        }
    }

    /// Classifies the bytes following a delimiter token that was already consumed.
    pub(crate) fn classify_delimiter(&self, eof: bool) -> Delimiter {
        let buf = &self.buf[..];
        let premature = |needed_more: bool| {
            if !eof {
                Delimiter::NeedMore
            } else if needed_more {
                Delimiter::Malformed(IllegalFormat::BoundaryWithoutCrlf)
            } else {
                Delimiter::Malformed(IllegalFormat::PrematureHeaderTermination)
            }
        };

        if buf.len() < BOUNDARY_EXT.len() {
            return premature(true);
        }

        if buf.starts_with(BOUNDARY_EXT.as_bytes()) {
            return Delimiter::Terminal;
        }

        let lwsp = buf.iter().take_while(|b| constants::is_lwsp(**b)).count();
        let rest = &buf[lwsp..];

        if rest.len() < CRLF.len() {
            return premature(true);
        }

        if !rest.starts_with(CRLF.as_bytes()) {
            return Delimiter::Malformed(IllegalFormat::HeadersImproperlyConstructed);
        }

        match self.header_end.find(rest) {
            Some(idx) => Delimiter::Part {
                lwsp,
                block_end: lwsp + idx + CRLF_CRLF.len(),
            },
            None => premature(rest.len() < CRLF_CRLF.len()),
        }
    }

    pub(crate) fn slice(&self, from: usize, to: usize) -> &[u8] {
        &self.buf[from..to]
    }

    pub(crate) fn split_to(&mut self, size: usize) -> Bytes {
        self.buf.split_to(size).freeze()
    }

    pub(crate) fn advance(&mut self, size: usize) {
        self.buf.advance(size);
    }

    pub(crate) fn take_all(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }
}
