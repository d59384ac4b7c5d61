use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use spin::Mutex;
use tokio::runtime::Handle;

use crate::constants::{DEFAULT_MAXIMUM_BLOCKING_DURATION, DEFAULT_WRITE_CHUNK_SIZE};
use crate::entity_stream::{EntityWriter, WriteHandle};
use crate::error::Error;
use crate::headers::PartHeaders;
use crate::source::DataSource;

type BlockingReader = Box<dyn Read + Send>;

/// A data source reading its body from a blocking [`Read`].
///
/// Reads run on the blocking pool of the given runtime, one chunk of
/// [`write_chunk_size`](InputStreamSourceBuilder::write_chunk_size) bytes at a time and only while the writer has room.
/// A chunk shorter than the chunk size ends the part. A read that takes longer than
/// [`maximum_blocking_time`](InputStreamSourceBuilder::maximum_blocking_time) fails the part with [`Error::Timeout`].
///
/// The reader is dropped exactly once: at the end of the part, on failure, or on abort. A read stuck past its
/// deadline keeps the reader until it returns.
///
/// The runtime must have its time driver enabled.
pub struct InputStreamSource {
    headers: PartHeaders,
    shared: Arc<Mutex<Slot>>,
    runtime: Handle,
    maximum_blocking_time: Duration,
    write_chunk_size: usize,
    handle: Option<Arc<dyn WriteHandle>>,
}

/// Configures an [`InputStreamSource`].
pub struct InputStreamSourceBuilder {
    reader: BlockingReader,
    runtime: Handle,
    headers: PartHeaders,
    maximum_blocking_time: Duration,
    write_chunk_size: usize,
}

enum Slot {
    Idle(BlockingReader),
    Reading,
    Closed,
}

impl InputStreamSource {
    /// Starts configuring a source that reads `reader` on the blocking pool of `runtime`.
    pub fn builder<R>(reader: R, runtime: Handle, headers: PartHeaders) -> InputStreamSourceBuilder
    where
        R: Read + Send + 'static,
    {
        InputStreamSourceBuilder {
            reader: Box::new(reader),
            runtime,
            headers,
            maximum_blocking_time: DEFAULT_MAXIMUM_BLOCKING_DURATION,
            write_chunk_size: DEFAULT_WRITE_CHUNK_SIZE,
        }
    }
}

impl InputStreamSourceBuilder {
    /// Upper bound on a single read. Defaults to [`DEFAULT_MAXIMUM_BLOCKING_DURATION`].
    pub fn maximum_blocking_time(mut self, duration: Duration) -> InputStreamSourceBuilder {
        self.maximum_blocking_time = duration;
        self
    }

    /// Size of the chunks read and written. Defaults to [`DEFAULT_WRITE_CHUNK_SIZE`]; zero is treated as one.
    pub fn write_chunk_size(mut self, size: usize) -> InputStreamSourceBuilder {
        self.write_chunk_size = size.max(1);
        self
    }

    /// Creates the source.
    pub fn build(self) -> InputStreamSource {
        InputStreamSource {
            headers: self.headers,
            shared: Arc::new(Mutex::new(Slot::Idle(self.reader))),
            runtime: self.runtime,
            maximum_blocking_time: self.maximum_blocking_time,
            write_chunk_size: self.write_chunk_size,
            handle: None,
        }
    }
}

impl EntityWriter for InputStreamSource {
    fn on_init(&mut self, handle: Arc<dyn WriteHandle>) {
        self.handle = Some(handle);
    }

    fn on_write_possible(&mut self) {
        let handle = match self.handle.clone() {
            Some(handle) => handle,
            None => return,
        };

        if !matches!(*self.shared.lock(), Slot::Idle(_)) {
            return;
        }

        let task = read_chunks(
            self.shared.clone(),
            handle,
            self.maximum_blocking_time,
            self.write_chunk_size,
        );
        self.runtime.spawn(task);
    }

    fn on_abort(&mut self, err: Error) {
        debug!("input stream source aborted: {}", err);
        let reader = close(&self.shared);
        drop(reader);
        self.handle = None;
    }
}

impl DataSource for InputStreamSource {
    fn data_source_headers(&self) -> PartHeaders {
        self.headers.clone()
    }
}

// Marks the source closed, handing back the reader unless a read currently owns it.
fn close(shared: &Mutex<Slot>) -> Option<BlockingReader> {
    match std::mem::replace(&mut *shared.lock(), Slot::Closed) {
        Slot::Idle(reader) => Some(reader),
        Slot::Reading | Slot::Closed => None,
    }
}

async fn read_chunks(shared: Arc<Mutex<Slot>>, handle: Arc<dyn WriteHandle>, deadline: Duration, chunk_size: usize) {
    loop {
        let reader = {
            let mut slot = shared.lock();
            match std::mem::replace(&mut *slot, Slot::Reading) {
                Slot::Idle(reader) => reader,
                other => {
                    *slot = other;
                    return;
                }
            }
        };

        let read = tokio::task::spawn_blocking(move || fill_chunk(reader, chunk_size));
        let result = tokio::time::timeout(deadline, read).await;

        // An abort during the read already closed the source; its outcome is dropped with the reader.
        if is_closed(&shared) {
            trace!("input stream source closed during a read");
            return;
        }

        let (reader, chunk) = match result {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                drop(close(&shared));
                handle.error(Error::SourceReadFailed(Arc::new(join_err)));
                return;
            }
            Err(_) => {
                // The blocking read owns the reader and drops it once it returns.
                debug!("blocking read exceeded {:?}", deadline);
                drop(close(&shared));
                handle.error(Error::Timeout);
                return;
            }
        };

        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                drop(reader);
                drop(close(&shared));
                handle.error(Error::SourceReadFailed(Arc::new(err)));
                return;
            }
        };

        if chunk.len() < chunk_size {
            drop(reader);
            drop(close(&shared));

            if !chunk.is_empty() {
                handle.write(chunk);
            }
            handle.done();
            return;
        }

        // The reader goes back only after the chunk was written so that chunks can't be reordered.
        handle.write(chunk);

        let closed = {
            let mut slot = shared.lock();
            match *slot {
                Slot::Reading => {
                    *slot = Slot::Idle(reader);
                    false
                }
                _ => true,
            }
        };

        if closed || handle.remaining() == 0 {
            return;
        }
    }
}

fn is_closed(shared: &Mutex<Slot>) -> bool {
    matches!(*shared.lock(), Slot::Closed)
}

fn fill_chunk(mut reader: BlockingReader, chunk_size: usize) -> (BlockingReader, io::Result<Bytes>) {
    let mut buf = vec![0; chunk_size];
    let mut filled = 0;

    while filled < chunk_size {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return (reader, Err(err)),
        }
    }

    buf.truncate(filled);
    (reader, Ok(Bytes::from(buf)))
}
