use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use spin::Mutex;

use crate::error::Error;

/// The reading end of an [`EntityStream`], handed to an [`EntityReader`] on initialisation.
pub trait ReadHandle: Send + Sync {
    /// Asks the writer for `chunks` more chunks. Requests accumulate.
    fn request(&self, chunks: usize);

    /// Stops the stream. The writer is aborted with [`Error::Cancelled`] and the reader hears nothing more.
    fn cancel(&self);
}

/// The writing end of an [`EntityStream`], handed to an [`EntityWriter`] on initialisation.
pub trait WriteHandle: Send + Sync {
    /// Writes one chunk. A writer should only write while [`remaining`](WriteHandle::remaining) is positive.
    fn write(&self, data: Bytes);

    /// Ends the stream successfully. Nothing may be written afterwards.
    fn done(&self);

    /// Ends the stream with `err`.
    fn error(&self, err: Error);

    /// How many chunks the reader has requested and not yet received.
    fn remaining(&self) -> usize;
}

/// Consumes the chunks of an [`EntityStream`].
pub trait EntityReader: Send {
    /// Hands over the handle used to request data.
    fn on_init(&mut self, handle: Arc<dyn ReadHandle>);

    /// One requested chunk.
    fn on_data_available(&mut self, data: Bytes);

    /// The writer finished; no more chunks follow.
    fn on_done(&mut self);

    /// The writer failed; no more chunks follow.
    fn on_error(&mut self, err: Error);
}

/// Produces the chunks of an [`EntityStream`].
pub trait EntityWriter: Send {
    /// Hands over the handle used to write data.
    fn on_init(&mut self, handle: Arc<dyn WriteHandle>);

    /// Called whenever the outstanding request count rises from zero.
    fn on_write_possible(&mut self);

    /// Called at most once, when the stream is cancelled or the writer is aborted by its owner.
    fn on_abort(&mut self, err: Error);
}

/// A single-reader, pull-based byte stream connecting one [`EntityWriter`] to one [`EntityReader`].
///
/// Every signal crossing the stream is queued and dispatched by exactly one thread at a time. A writer that writes
/// from inside `on_write_possible`, or a reader that requests from inside `on_data_available`, therefore never
/// recurses into the other side; the pending signal is picked up by the loop that is already running.
#[derive(Clone)]
pub struct EntityStream {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<StreamState>,
}

struct StreamState {
    writer: Option<Box<dyn EntityWriter>>,
    reader: Option<Box<dyn EntityReader>>,
    reader_set: bool,
    remaining: usize,
    writer_finished: bool,
    abort_pending: bool,
    reader_finished: bool,
    signals: VecDeque<Signal>,
    dispatching: bool,
}

enum Signal {
    InitWriter,
    InitReader,
    WritePossible,
    Data(Bytes),
    Done,
    Error(Error),
    Abort(Error),
}

struct StreamReadHandle {
    shared: Arc<Shared>,
}

struct StreamWriteHandle {
    shared: Arc<Shared>,
}

impl EntityStream {
    /// Creates a stream fed by `writer`. The writer is initialised once a reader is attached.
    pub fn new<W>(writer: W) -> EntityStream
    where
        W: EntityWriter + 'static,
    {
        let state = StreamState {
            writer: Some(Box::new(writer)),
            reader: None,
            reader_set: false,
            remaining: 0,
            writer_finished: false,
            abort_pending: false,
            reader_finished: false,
            signals: VecDeque::new(),
            dispatching: false,
        };

        EntityStream {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
            }),
        }
    }

    /// Creates a stream that hands out `bytes` in chunks of at most `chunk_size` bytes.
    pub fn from_bytes<B>(bytes: B, chunk_size: usize) -> EntityStream
    where
        B: Into<Bytes>,
    {
        let mut bytes = bytes.into();
        let chunk_size = chunk_size.max(1);
        let mut chunks = VecDeque::with_capacity(bytes.len() / chunk_size + 1);

        while !bytes.is_empty() {
            let size = chunk_size.min(bytes.len());
            chunks.push_back(bytes.split_to(size));
        }

        EntityStream::new(ChunkWriter::new(chunks))
    }

    /// Creates a stream that hands out the given chunks unchanged, in order.
    pub fn from_chunks<I, B>(chunks: I) -> EntityStream
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        EntityStream::new(ChunkWriter::new(chunks.into_iter().map(Into::into).collect()))
    }

    /// Attaches the only reader this stream will ever have, then initialises the writer and the reader.
    pub fn set_reader<R>(&self, reader: R) -> crate::Result<()>
    where
        R: EntityReader + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            if state.reader_set {
                return Err(Error::StreamBusy("A reader has already been set on this entity stream."));
            }

            state.reader_set = true;
            state.reader = Some(Box::new(reader));
            state.signals.push_back(Signal::InitWriter);
            state.signals.push_back(Signal::InitReader);
        }

        self.shared.dispatch();
        Ok(())
    }
}

impl Shared {
    fn dispatch(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }

        loop {
            let mut state = self.state.lock();
            let signal = match state.signals.pop_front() {
                Some(signal) => signal,
                None => {
                    state.dispatching = false;
                    return;
                }
            };

            match signal {
                Signal::InitWriter => {
                    let writer = state.writer.take();
                    drop(state);

                    if let Some(mut writer) = writer {
                        writer.on_init(Arc::new(StreamWriteHandle { shared: self.clone() }));
                        self.restore_writer(writer);
                    }
                }
                Signal::WritePossible => {
                    let writer = state.writer.take();
                    drop(state);

                    if let Some(mut writer) = writer {
                        writer.on_write_possible();
                        self.restore_writer(writer);
                    }
                }
                Signal::Abort(err) => {
                    state.abort_pending = false;
                    let writer = state.writer.take();
                    drop(state);

                    if let Some(mut writer) = writer {
                        writer.on_abort(err);
                    }
                }
                Signal::InitReader => {
                    let reader = state.reader.take();
                    drop(state);

                    if let Some(mut reader) = reader {
                        reader.on_init(Arc::new(StreamReadHandle { shared: self.clone() }));
                        self.restore_reader(reader);
                    }
                }
                Signal::Data(data) => {
                    let reader = state.reader.take();
                    drop(state);

                    if let Some(mut reader) = reader {
                        reader.on_data_available(data);
                        self.restore_reader(reader);
                    }
                }
                Signal::Done => {
                    state.reader_finished = true;
                    let reader = state.reader.take();
                    drop(state);

                    if let Some(mut reader) = reader {
                        reader.on_done();
                    }
                }
                Signal::Error(err) => {
                    state.reader_finished = true;
                    let reader = state.reader.take();
                    drop(state);

                    if let Some(mut reader) = reader {
                        reader.on_error(err);
                    }
                }
            }
        }
    }

    // A finished side is dropped instead of restored, which also breaks the handle cycle through `Shared`.
    fn restore_writer(&self, writer: Box<dyn EntityWriter>) {
        let mut state = self.state.lock();
        if (!state.writer_finished || state.abort_pending) && state.writer.is_none() {
            state.writer = Some(writer);
        }
    }

    fn restore_reader(&self, reader: Box<dyn EntityReader>) {
        let mut state = self.state.lock();
        if !state.reader_finished && state.reader.is_none() {
            state.reader = Some(reader);
        }
    }

    fn finish_writer(self: &Arc<Self>, signal: Signal) {
        let writer = {
            let mut state = self.state.lock();
            if state.writer_finished {
                trace!("ignoring a terminal signal from a finished writer");
                return;
            }

            state.writer_finished = true;
            state.remaining = 0;
            state.signals.push_back(signal);
            state.writer.take()
        };

        drop(writer);
        self.dispatch();
    }
}

impl ReadHandle for StreamReadHandle {
    fn request(&self, chunks: usize) {
        {
            let mut state = self.shared.state.lock();
            if state.reader_finished || state.writer_finished || chunks == 0 {
                return;
            }

            let was_idle = state.remaining == 0;
            state.remaining = state.remaining.saturating_add(chunks);
            if !was_idle {
                return;
            }
            state.signals.push_back(Signal::WritePossible);
        }

        self.shared.dispatch();
    }

    fn cancel(&self) {
        let (reader, writer_running) = {
            let mut state = self.shared.state.lock();
            if state.reader_finished {
                return;
            }

            state.reader_finished = true;
            state.remaining = 0;
            state
                .signals
                .retain(|signal| !matches!(signal, Signal::Data(_) | Signal::Done | Signal::Error(_)));

            let writer_running = !state.writer_finished;
            if writer_running {
                state.writer_finished = true;
                state.abort_pending = true;
                state.signals.push_back(Signal::Abort(Error::Cancelled));
            }

            (state.reader.take(), writer_running)
        };

        debug!("entity stream cancelled by its reader, aborting writer: {}", writer_running);
        drop(reader);
        self.shared.dispatch();
    }
}

impl WriteHandle for StreamWriteHandle {
    fn write(&self, data: Bytes) {
        {
            let mut state = self.shared.state.lock();
            if state.writer_finished {
                debug!("dropping {} bytes written after the writer finished", data.len());
                return;
            }

            if state.remaining == 0 {
                warn!("writer wrote {} bytes without an outstanding request", data.len());
            }

            state.remaining = state.remaining.saturating_sub(1);
            state.signals.push_back(Signal::Data(data));
        }

        self.shared.dispatch();
    }

    fn done(&self) {
        self.shared.finish_writer(Signal::Done);
    }

    fn error(&self, err: Error) {
        self.shared.finish_writer(Signal::Error(err));
    }

    fn remaining(&self) -> usize {
        let state = self.shared.state.lock();
        if state.writer_finished {
            0
        } else {
            state.remaining
        }
    }
}

/// Writes a fixed queue of chunks, one per requested chunk.
pub(crate) struct ChunkWriter {
    chunks: VecDeque<Bytes>,
    handle: Option<Arc<dyn WriteHandle>>,
}

impl ChunkWriter {
    pub(crate) fn new(chunks: VecDeque<Bytes>) -> ChunkWriter {
        ChunkWriter { chunks, handle: None }
    }
}

impl EntityWriter for ChunkWriter {
    fn on_init(&mut self, handle: Arc<dyn WriteHandle>) {
        self.handle = Some(handle);
    }

    fn on_write_possible(&mut self) {
        let handle = match self.handle.as_ref() {
            Some(handle) => handle,
            None => return,
        };

        while handle.remaining() > 0 {
            match self.chunks.pop_front() {
                Some(chunk) => handle.write(chunk),
                None => break,
            }
        }

        if self.chunks.is_empty() {
            handle.done();
        }
    }

    fn on_abort(&mut self, _err: Error) {
        self.chunks.clear();
    }
}
