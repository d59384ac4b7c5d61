use std::sync::Arc;

use bytes::Bytes;

use crate::entity_stream::{EntityWriter, WriteHandle};
use crate::error::Error;
use crate::headers::PartHeaders;

/// One part of a multipart body being written.
///
/// The [`MultiPartWriter`](crate::MultiPartWriter) emits the boundary and the headers returned by
/// [`data_source_headers`](DataSource::data_source_headers), then drives the source through its [`EntityWriter`]
/// half: the source is initialised with a [`WriteHandle`] once it becomes the active part, writes while
/// [`WriteHandle::remaining`] is positive, and ends with `done()` or `error()`.
///
/// [`on_abort`](EntityWriter::on_abort) is called at most once, for a source that will never finish, and must release
/// whatever the source owns.
pub trait DataSource: EntityWriter {
    /// The headers written before this part's body.
    fn data_source_headers(&self) -> PartHeaders;
}

/// A data source serving an in-memory body as a single chunk.
pub struct BytesSource {
    headers: PartHeaders,
    body: Bytes,
    handle: Option<Arc<dyn WriteHandle>>,
}

impl BytesSource {
    /// A part with `headers` and the given in-memory body.
    pub fn new<B>(headers: PartHeaders, body: B) -> BytesSource
    where
        B: Into<Bytes>,
    {
        BytesSource {
            headers,
            body: body.into(),
            handle: None,
        }
    }
}

impl EntityWriter for BytesSource {
    fn on_init(&mut self, handle: Arc<dyn WriteHandle>) {
        self.handle = Some(handle);
    }

    fn on_write_possible(&mut self) {
        let handle = match self.handle.as_ref() {
            Some(handle) => handle,
            None => return,
        };

        let body = std::mem::take(&mut self.body);
        if !body.is_empty() {
            handle.write(body);
        }
        handle.done();
    }

    fn on_abort(&mut self, _err: Error) {
        self.body.clear();
    }
}

impl DataSource for BytesSource {
    fn data_source_headers(&self) -> PartHeaders {
        self.headers.clone()
    }
}
