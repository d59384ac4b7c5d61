//! A streaming, backpressure-aware reader and writer for `multipart/*` bodies.
//!
//! Both directions are pull based. A transport asks for chunks one at a time through an [`EntityStream`], and
//! neither the [`MultiPartReader`] nor the [`MultiPartWriter`] ever produces more than was asked for.
//!
//! # Examples
//!
//! ```
//! use bytes::Bytes;
//! use multipart_mime::{
//!     BytesSource, CallbackResult, MultiPartReader, MultiPartReaderCallback, MultiPartWriter, PartHeaders,
//!     SinglePartReader, SinglePartReaderCallback,
//! };
//! use std::sync::{Arc, Mutex};
//!
//! struct PrintPart(SinglePartReader);
//!
//! impl SinglePartReaderCallback for PrintPart {
//!     fn on_part_data_available(&mut self, data: Bytes) -> CallbackResult {
//!         println!("data: {:?}", data);
//!         self.0.request_data()?;
//!         Ok(())
//!     }
//!
//!     fn on_finished(&mut self) -> CallbackResult {
//!         Ok(())
//!     }
//!
//!     fn on_abandoned(&mut self) -> CallbackResult {
//!         Ok(())
//!     }
//!
//!     fn on_stream_error(&mut self, _err: multipart_mime::Error) {}
//! }
//!
//! struct PrintParts(Arc<Mutex<bool>>);
//!
//! impl MultiPartReaderCallback for PrintParts {
//!     fn on_new_part(&mut self, part: SinglePartReader) -> CallbackResult {
//!         println!("part #{}: {:?}", part.part_index(), part.headers());
//!         part.register_reader_callback(PrintPart(part.clone()))?;
//!         part.request_data()?;
//!         Ok(())
//!     }
//!
//!     fn on_finished(&mut self) -> CallbackResult {
//!         *self.0.lock().unwrap() = true;
//!         Ok(())
//!     }
//!
//!     fn on_abandoned(&mut self) -> CallbackResult {
//!         Ok(())
//!     }
//!
//!     fn on_stream_error(&mut self, _err: multipart_mime::Error) {}
//! }
//!
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let headers: PartHeaders = vec![("Content-Type", "text/plain")].into_iter().collect();
//! let writer = MultiPartWriter::builder()
//!     .append_data_source(BytesSource::new(headers, "hello world"))
//!     .build();
//!
//! let finished = Arc::new(Mutex::new(false));
//! let reader = MultiPartReader::new(writer.entity_stream(), writer.boundary());
//! reader.register_reader_callback(PrintParts(finished.clone()))?;
//!
//! assert!(*finished.lock().unwrap());
//! # Ok(())
//! # }
//! # run().unwrap();
//! ```
//!
//! # Optional features
//!
//! * `tokio-io` (default) enables [`InputStreamSource`], a data source backed by a blocking [`std::io::Read`].
//! * `log` reports state transitions and swallowed errors through the `log` facade.

#![cfg_attr(docsrs, feature(doc_cfg))]

macro_rules! trace {
    ($($arg:tt)+) => {{
        #[cfg(feature = "log")]
        log::trace!($($arg)+);
        #[cfg(not(feature = "log"))]
        let _ = || format!($($arg)+);
    }};
}

macro_rules! debug {
    ($($arg:tt)+) => {{
        #[cfg(feature = "log")]
        log::debug!($($arg)+);
        #[cfg(not(feature = "log"))]
        let _ = || format!($($arg)+);
    }};
}

macro_rules! warn {
    ($($arg:tt)+) => {{
        #[cfg(feature = "log")]
        log::warn!($($arg)+);
        #[cfg(not(feature = "log"))]
        let _ = || format!($($arg)+);
    }};
}

pub use chain::PartSource;
pub use constants::{DEFAULT_MAXIMUM_BLOCKING_DURATION, DEFAULT_WRITE_CHUNK_SIZE};
pub use entity_stream::{EntityReader, EntityStream, EntityWriter, ReadHandle, WriteHandle};
pub use error::{BoxError, Error, IllegalFormat, SharedError};
pub use headers::PartHeaders;
#[cfg(feature = "tokio-io")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-io")))]
pub use input_stream::{InputStreamSource, InputStreamSourceBuilder};
pub use part::{CallbackResult, MultiPartReaderCallback, SinglePartReader, SinglePartReaderCallback};
pub use reader::MultiPartReader;
pub use source::{BytesSource, DataSource};
pub use stream::{ByteStream, StreamPump};
pub use writer::{Builder, MultiPartWriter};

mod boundary;
mod chain;
mod constants;
mod entity_stream;
mod error;
mod headers;
#[cfg(feature = "tokio-io")]
mod input_stream;
mod part;
mod reader;
mod source;
mod state;
mod stream;
mod writer;

/// A Result type often returned from methods that can have `multipart-mime` errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Parses a `Content-Type` header value to extract the boundary of a `multipart/*` body.
pub fn parse_boundary<T: AsRef<str>>(content_type: T) -> crate::Result<String> {
    let m = content_type
        .as_ref()
        .parse::<mime::Mime>()
        .map_err(|_| IllegalFormat::InvalidContentType)?;

    if m.type_() != mime::MULTIPART {
        return Err(IllegalFormat::NotMultipart.into());
    }

    m.get_param(mime::BOUNDARY)
        .map(|name| name.as_str().to_owned())
        .ok_or_else(|| IllegalFormat::NoBoundary.into())
}
