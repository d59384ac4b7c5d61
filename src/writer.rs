use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use http::HeaderValue;
use rand::distributions::Alphanumeric;
use rand::Rng;
use spin::Mutex;

use crate::chain::ReaderSource;
use crate::constants::{self, BOUNDARY_EXT, CRLF};
use crate::entity_stream::{EntityStream, EntityWriter, WriteHandle};
use crate::error::Error;
use crate::headers;
use crate::reader::MultiPartReader;
use crate::source::DataSource;

/// Writes an ordered list of data sources as one multipart body.
///
/// The body is produced lazily: nothing is read from a data source until the consumer of
/// [`entity_stream`](Self::entity_stream) asks for more bytes, and exactly one source is active at a time.
///
/// # Examples
///
/// ```
/// use multipart_mime::{BytesSource, MultiPartWriter, PartHeaders};
///
/// let headers: PartHeaders = vec![("Content-Type", "application/json")].into_iter().collect();
/// let writer = MultiPartWriter::builder()
///     .preamble("This is a multi-part message in MIME format.")
///     .append_data_source(BytesSource::new(headers, r#"{"id":1}"#))
///     .build();
///
/// let content_type = writer.content_type("mixed").unwrap();
/// assert!(content_type.to_str().unwrap().ends_with(writer.boundary()));
/// ```
pub struct MultiPartWriter {
    inner: Arc<WriterInner>,
    entity: EntityStream,
    boundary: String,
}

/// Collects the parts of a [`MultiPartWriter`].
pub struct Builder {
    boundary: String,
    delimiter: Bytes,
    preamble: Bytes,
    epilogue: Bytes,
    entries: Vec<Entry>,
}

enum Entry {
    Source(Box<dyn DataSource>),
    Iterator(ReaderSource),
}

struct WriterInner {
    state: Mutex<WriterState>,
}

struct WriterState {
    segments: Vec<Segment>,
    active: usize,
    downstream: Option<Arc<dyn WriteHandle>>,
    // The consumer asked for more since the active source was last invoked.
    notify: bool,
    dispatching: bool,
    finished: bool,
    failure: Option<Error>,
}

enum Segment {
    Bytes(Option<Bytes>),
    Source {
        writer: Option<SourceWriter>,
        stage: SourceStage,
        abort: Option<Error>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceStage {
    Created,
    Initialized,
    Finished,
}

enum SourceWriter {
    Data(Box<dyn DataSource>),
    Chain(ReaderSource),
}

struct CompositeWriter {
    inner: Arc<WriterInner>,
}

struct DataSourceHandle {
    inner: Arc<WriterInner>,
    idx: usize,
}

enum Action {
    Write(Arc<dyn WriteHandle>, Bytes),
    Done(Arc<dyn WriteHandle>),
    Fail(Arc<dyn WriteHandle>, Error),
    Init(usize, SourceWriter),
    WritePossible(usize, SourceWriter),
}

impl MultiPartWriter {
    /// Starts a writer with a freshly generated boundary.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The stream carrying the body. Every clone refers to the same stream, which accepts a single reader.
    pub fn entity_stream(&self) -> EntityStream {
        self.entity.clone()
    }

    /// The boundary separating the parts of this body.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Builds the `Content-Type` header value for this body, e.g. `multipart/mixed; boundary=...`.
    pub fn content_type(&self, subtype: &str) -> crate::Result<HeaderValue> {
        let value = format!("multipart/{}; boundary={}", subtype, self.boundary);

        HeaderValue::from_str(&value).map_err(|err| Error::DecodeHeaderValue {
            value: value.into_bytes(),
            cause: Arc::new(err),
        })
    }

    /// Aborts every data source that hasn't finished yet, passing `err` to their
    /// [`on_abort`](EntityWriter::on_abort). The body, if it is being read, fails with `err`.
    ///
    /// Use this when the body will never be sent, so that the sources can release what they hold.
    pub fn abort_all_data_sources(&self, err: Error) {
        debug!("aborting all data sources: {}", err);
        self.inner.abort(err, true);
        self.inner.drive();
    }
}

impl Builder {
    /// Creates a builder with a freshly generated boundary.
    pub fn new() -> Builder {
        let boundary: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(constants::GENERATED_BOUNDARY_LEN)
            .map(char::from)
            .collect();

        let delimiter = Bytes::from(format!("{}{}{}", CRLF, BOUNDARY_EXT, boundary));

        Builder {
            boundary,
            delimiter,
            preamble: Bytes::new(),
            epilogue: Bytes::new(),
            entries: Vec::new(),
        }
    }

    /// Text placed before the first boundary.
    pub fn preamble<S: Into<String>>(mut self, preamble: S) -> Builder {
        self.preamble = Bytes::from(preamble.into());
        self
    }

    /// Text placed after the terminal boundary.
    pub fn epilogue<S: Into<String>>(mut self, epilogue: S) -> Builder {
        self.epilogue = Bytes::from(epilogue.into());
        self
    }

    /// Adds a data source after the ones already added.
    pub fn append_data_source<D>(mut self, source: D) -> Builder
    where
        D: DataSource + 'static,
    {
        self.entries.push(Entry::Source(Box::new(source)));
        self
    }

    /// Adds several data sources, in order.
    pub fn append_data_sources<I>(mut self, sources: I) -> Builder
    where
        I: IntoIterator<Item = Box<dyn DataSource>>,
    {
        self.entries.extend(sources.into_iter().map(Entry::Source));
        self
    }

    /// Re-emits every part of `reader` as a part of this body, with this body's boundary.
    ///
    /// The reader must not have a callback registered; the writer registers its own once it reaches this entry.
    pub fn append_data_source_iterator(mut self, reader: MultiPartReader) -> Builder {
        let source = ReaderSource::new(reader, self.delimiter.clone());
        self.entries.push(Entry::Iterator(source));
        self
    }

    /// Places a data source before every other one, right after the preamble.
    pub fn prepend_data_source<D>(mut self, source: D) -> Builder
    where
        D: DataSource + 'static,
    {
        self.entries.insert(0, Entry::Source(Box::new(source)));
        self
    }

    /// The number of data sources and data source iterators added so far.
    pub fn current_size(&self) -> usize {
        self.entries.len()
    }

    /// Lays out the body and returns the writer.
    pub fn build(self) -> MultiPartWriter {
        let mut segments = Vec::with_capacity(self.entries.len() * 2 + 2);

        if !self.preamble.is_empty() {
            segments.push(Segment::Bytes(Some(self.preamble)));
        }

        for entry in self.entries {
            match entry {
                Entry::Source(source) => {
                    let head = headers::serialize_boundary_and_headers(&self.delimiter, &source.data_source_headers());
                    segments.push(Segment::Bytes(Some(head)));
                    segments.push(Segment::source(SourceWriter::Data(source)));
                }
                Entry::Iterator(source) => segments.push(Segment::source(SourceWriter::Chain(source))),
            }
        }

        let mut tail = BytesMut::with_capacity(self.delimiter.len() + 4 + self.epilogue.len());
        tail.put_slice(&self.delimiter);
        tail.put_slice(BOUNDARY_EXT.as_bytes());
        tail.put_slice(CRLF.as_bytes());
        tail.put_slice(&self.epilogue);
        segments.push(Segment::Bytes(Some(tail.freeze())));

        let inner = Arc::new(WriterInner {
            state: Mutex::new(WriterState {
                segments,
                active: 0,
                downstream: None,
                notify: false,
                dispatching: false,
                finished: false,
                failure: None,
            }),
        });

        let entity = EntityStream::new(CompositeWriter { inner: inner.clone() });

        MultiPartWriter {
            inner,
            entity,
            boundary: self.boundary,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

impl Segment {
    fn source(writer: SourceWriter) -> Segment {
        Segment::Source {
            writer: Some(writer),
            stage: SourceStage::Created,
            abort: None,
        }
    }
}

impl SourceWriter {
    fn on_init(&mut self, handle: Arc<dyn WriteHandle>) {
        match self {
            SourceWriter::Data(source) => source.on_init(handle),
            SourceWriter::Chain(source) => source.on_init(handle),
        }
    }

    fn on_write_possible(&mut self) {
        match self {
            SourceWriter::Data(source) => source.on_write_possible(),
            SourceWriter::Chain(source) => source.on_write_possible(),
        }
    }

    fn on_abort(&mut self, err: Error) {
        match self {
            SourceWriter::Data(source) => source.on_abort(err),
            SourceWriter::Chain(source) => source.on_abort(err),
        }
    }
}

impl WriterInner {
    fn drive(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }

        loop {
            let action = {
                let mut state = self.state.lock();
                match state.step() {
                    Some(action) => action,
                    None => {
                        state.dispatching = false;
                        return;
                    }
                }
            };

            match action {
                Action::Write(downstream, data) => downstream.write(data),
                Action::Done(downstream) => {
                    trace!("multipart body written");
                    downstream.done()
                }
                Action::Fail(downstream, err) => downstream.error(err),
                Action::Init(idx, mut writer) => {
                    trace!("initialising data source at segment {}", idx);
                    writer.on_init(Arc::new(DataSourceHandle {
                        inner: self.clone(),
                        idx,
                    }));
                    self.restore(idx, writer);
                }
                Action::WritePossible(idx, mut writer) => {
                    writer.on_write_possible();
                    self.restore(idx, writer);
                }
            }
        }
    }

    // Puts an active source back, or aborts it if an abort arrived while it was running.
    fn restore(&self, idx: usize, mut writer: SourceWriter) {
        let abort = {
            let mut state = self.state.lock();
            match state.segments.get_mut(idx) {
                Some(Segment::Source {
                    writer: slot,
                    stage,
                    abort,
                }) => {
                    if *stage != SourceStage::Finished {
                        *slot = Some(writer);
                        return;
                    }
                    abort.take()
                }
                _ => None,
            }
        };

        if let Some(err) = abort {
            writer.on_abort(err);
        }
    }

    /// Aborts every unfinished source. `fail_downstream` reports `err` to the consumer as well.
    fn abort(&self, err: Error, fail_downstream: bool) {
        let writers = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }

            state.finished = true;
            if fail_downstream {
                state.failure = Some(err.clone());
            }
            state.take_unfinished(&err)
        };

        for mut writer in writers {
            writer.on_abort(err.clone());
        }
    }

    fn is_active(state: &WriterState, idx: usize) -> bool {
        !state.finished
            && state.active == idx
            && matches!(
                state.segments.get(idx),
                Some(Segment::Source {
                    stage: SourceStage::Initialized,
                    ..
                })
            )
    }
}

impl WriterState {
    fn step(&mut self) -> Option<Action> {
        let downstream = self.downstream.clone()?;

        if let Some(err) = self.failure.take() {
            return Some(Action::Fail(downstream, err));
        }

        if self.finished {
            return None;
        }

        loop {
            let idx = self.active;
            let segment = match self.segments.get_mut(idx) {
                Some(segment) => segment,
                None => {
                    self.finished = true;
                    return Some(Action::Done(downstream));
                }
            };

            match segment {
                Segment::Bytes(bytes) => {
                    if downstream.remaining() == 0 {
                        return None;
                    }

                    self.active += 1;
                    if let Some(data) = bytes.take() {
                        return Some(Action::Write(downstream, data));
                    }
                }
                Segment::Source { writer, stage, .. } => match stage {
                    SourceStage::Created => {
                        *stage = SourceStage::Initialized;
                        self.notify = true;
                        return writer.take().map(|writer| Action::Init(idx, writer));
                    }
                    SourceStage::Initialized => {
                        if !self.notify || downstream.remaining() == 0 {
                            return None;
                        }

                        let writer = writer.take()?;
                        self.notify = false;
                        return Some(Action::WritePossible(idx, writer));
                    }
                    SourceStage::Finished => self.active += 1,
                },
            }
        }
    }

    fn take_unfinished(&mut self, err: &Error) -> Vec<SourceWriter> {
        let mut writers = Vec::new();

        for segment in self.segments.iter_mut() {
            if let Segment::Source { writer, stage, abort } = segment {
                if *stage == SourceStage::Finished {
                    continue;
                }

                *stage = SourceStage::Finished;
                match writer.take() {
                    Some(writer) => writers.push(writer),
                    // Running right now; aborted once it returns.
                    None => *abort = Some(err.clone()),
                }
            }
        }

        writers
    }
}

impl EntityWriter for CompositeWriter {
    fn on_init(&mut self, handle: Arc<dyn WriteHandle>) {
        self.inner.state.lock().downstream = Some(handle);
        self.inner.drive();
    }

    fn on_write_possible(&mut self) {
        self.inner.state.lock().notify = true;
        self.inner.drive();
    }

    fn on_abort(&mut self, err: Error) {
        debug!("multipart body aborted: {}", err);
        self.inner.abort(err, false);
    }
}

impl WriteHandle for DataSourceHandle {
    fn write(&self, data: Bytes) {
        let downstream = {
            let state = self.inner.state.lock();
            if !WriterInner::is_active(&state, self.idx) {
                warn!("dropping {} bytes written by an inactive data source", data.len());
                return;
            }
            state.downstream.clone()
        };

        if let Some(downstream) = downstream {
            downstream.write(data);
        }
    }

    fn done(&self) {
        let writer = {
            let mut state = self.inner.state.lock();
            if !WriterInner::is_active(&state, self.idx) {
                debug!("ignoring done() from an inactive data source");
                return;
            }

            match state.segments.get_mut(self.idx) {
                Some(Segment::Source { writer, stage, .. }) => {
                    *stage = SourceStage::Finished;
                    writer.take()
                }
                _ => None,
            }
        };

        drop(writer);
        self.inner.drive();
    }

    fn error(&self, err: Error) {
        let (writers, downstream) = {
            let mut state = self.inner.state.lock();
            if !WriterInner::is_active(&state, self.idx) {
                debug!("ignoring error from an inactive data source: {}", err);
                return;
            }

            if let Some(Segment::Source { writer, stage, .. }) = state.segments.get_mut(self.idx) {
                *stage = SourceStage::Finished;
                drop(writer.take());
            }

            state.finished = true;
            (state.take_unfinished(&err), state.downstream.clone())
        };

        debug!("data source failed, aborting {} other sources: {}", writers.len(), err);
        for mut writer in writers {
            writer.on_abort(err.clone());
        }

        if let Some(downstream) = downstream {
            downstream.error(err);
        }
    }

    fn remaining(&self) -> usize {
        let state = self.inner.state.lock();
        if !WriterInner::is_active(&state, self.idx) {
            return 0;
        }

        state
            .downstream
            .as_ref()
            .map(|downstream| downstream.remaining())
            .unwrap_or(0)
    }
}
