use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{Stream, TryStreamExt};
use futures_util::task::AtomicWaker;
use spin::Mutex;

use crate::entity_stream::{EntityReader, EntityStream, EntityWriter, ReadHandle, WriteHandle};
use crate::error::Error;

/// Reads an [`EntityStream`] as a [`Stream`] of chunks.
///
/// One chunk is requested per poll, so the producer never runs ahead of the consumer. Dropping the stream before it
/// ended cancels the entity stream.
///
/// # Examples
///
/// ```
/// use futures_util::stream::TryStreamExt;
/// use multipart_mime::{ByteStream, EntityStream};
///
/// # async fn run() {
/// let stream = ByteStream::new(EntityStream::from_bytes("hello world", 4));
/// let chunks: Vec<_> = stream.try_collect().await.unwrap();
/// assert_eq!(chunks.concat(), b"hello world");
/// # }
/// # tokio::runtime::Runtime::new().unwrap().block_on(run());
/// ```
pub struct ByteStream {
    shared: Arc<ByteStreamShared>,
    entity: Option<EntityStream>,
}

struct ByteStreamShared {
    state: Mutex<ByteStreamState>,
    waker: AtomicWaker,
}

#[derive(Default)]
struct ByteStreamState {
    handle: Option<Arc<dyn ReadHandle>>,
    chunks: VecDeque<Bytes>,
    requested: bool,
    done: bool,
    error: Option<Error>,
    // The stream yielded its last item.
    ended: bool,
}

struct ByteStreamReader {
    shared: Arc<ByteStreamShared>,
}

impl ByteStream {
    /// Wraps `entity`. Nothing is requested until the stream is first polled.
    pub fn new(entity: EntityStream) -> ByteStream {
        ByteStream {
            shared: Arc::new(ByteStreamShared {
                state: Mutex::new(ByteStreamState::default()),
                waker: AtomicWaker::new(),
            }),
            entity: Some(entity),
        }
    }

    fn poll_buffered(state: &mut ByteStreamState) -> Option<Poll<Option<crate::Result<Bytes>>>> {
        if let Some(chunk) = state.chunks.pop_front() {
            return Some(Poll::Ready(Some(Ok(chunk))));
        }

        if let Some(err) = state.error.take() {
            state.ended = true;
            return Some(Poll::Ready(Some(Err(err))));
        }

        if state.done || state.ended {
            state.ended = true;
            return Some(Poll::Ready(None));
        }

        None
    }
}

impl Stream for ByteStream {
    type Item = crate::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.shared.waker.register(cx.waker());

        if let Some(entity) = this.entity.take() {
            let reader = ByteStreamReader {
                shared: this.shared.clone(),
            };

            if let Err(err) = entity.set_reader(reader) {
                this.shared.state.lock().ended = true;
                return Poll::Ready(Some(Err(err)));
            }
        }

        let handle = {
            let mut state = this.shared.state.lock();
            if let Some(ready) = ByteStream::poll_buffered(&mut state) {
                return ready;
            }

            if state.requested {
                return Poll::Pending;
            }

            match state.handle.clone() {
                Some(handle) => {
                    state.requested = true;
                    handle
                }
                None => return Poll::Pending,
            }
        };

        // The chunk may be delivered before `request` returns.
        handle.request(1);

        let mut state = this.shared.state.lock();
        ByteStream::poll_buffered(&mut state).unwrap_or(Poll::Pending)
    }
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        let handle = {
            let mut state = self.shared.state.lock();
            if state.done || state.ended {
                return;
            }
            state.ended = true;
            state.handle.take()
        };

        if let Some(handle) = handle {
            trace!("byte stream dropped early, cancelling the entity stream");
            handle.cancel();
        }
    }
}

impl EntityReader for ByteStreamReader {
    fn on_init(&mut self, handle: Arc<dyn ReadHandle>) {
        let cancel = {
            let mut state = self.shared.state.lock();
            if state.ended {
                true
            } else {
                state.handle = Some(handle.clone());
                false
            }
        };

        if cancel {
            handle.cancel();
        } else {
            self.shared.waker.wake();
        }
    }

    fn on_data_available(&mut self, data: Bytes) {
        {
            let mut state = self.shared.state.lock();
            state.requested = false;
            state.chunks.push_back(data);
        }
        self.shared.waker.wake();
    }

    fn on_done(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.done = true;
            state.handle = None;
        }
        self.shared.waker.wake();
    }

    fn on_error(&mut self, err: Error) {
        {
            let mut state = self.shared.state.lock();
            state.error = Some(err);
            state.handle = None;
        }
        self.shared.waker.wake();
    }
}

/// Feeds a [`Stream`] of chunks into an [`EntityStream`].
///
/// The pump is a future that must be polled (usually spawned) for the entity stream to make progress. It only polls
/// the source stream while the reader of the entity stream has outstanding requests, and completes once the source
/// ended, failed, or the entity stream was cancelled.
///
/// Created by [`EntityStream::from_stream`].
#[must_use = "the entity stream only receives data while the pump is polled"]
pub struct StreamPump {
    stream: Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>,
    shared: Arc<PumpShared>,
}

struct PumpShared {
    state: Mutex<PumpState>,
    waker: AtomicWaker,
}

#[derive(Default)]
struct PumpState {
    handle: Option<Arc<dyn WriteHandle>>,
    aborted: bool,
}

struct PumpWriter {
    shared: Arc<PumpShared>,
}

impl EntityStream {
    /// Creates an entity stream backed by `stream`, along with the [`StreamPump`] that moves its chunks.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures_util::stream::{self, TryStreamExt};
    /// use multipart_mime::{ByteStream, EntityStream};
    ///
    /// # async fn run() {
    /// let chunks: Vec<Result<&'static str, std::io::Error>> = vec![Ok("abc"), Ok("def")];
    /// let (entity, pump) = EntityStream::from_stream(stream::iter(chunks));
    /// tokio::spawn(pump);
    ///
    /// let body: Vec<_> = ByteStream::new(entity).try_collect().await.unwrap();
    /// assert_eq!(body.concat(), b"abcdef");
    /// # }
    /// # tokio::runtime::Runtime::new().unwrap().block_on(run());
    /// ```
    pub fn from_stream<S, O, E>(stream: S) -> (EntityStream, StreamPump)
    where
        S: Stream<Item = Result<O, E>> + Send + 'static,
        O: Into<Bytes> + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let stream = stream.map_ok(Into::<Bytes>::into).map_err(Error::transport);

        let shared = Arc::new(PumpShared {
            state: Mutex::new(PumpState::default()),
            waker: AtomicWaker::new(),
        });

        let entity = EntityStream::new(PumpWriter { shared: shared.clone() });
        let pump = StreamPump {
            stream: Box::pin(stream),
            shared,
        };

        (entity, pump)
    }
}

impl Future for StreamPump {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        loop {
            this.shared.waker.register(cx.waker());

            let handle = {
                let state = this.shared.state.lock();
                if state.aborted {
                    return Poll::Ready(());
                }

                match state.handle.clone() {
                    Some(handle) => handle,
                    None => return Poll::Pending,
                }
            };

            if handle.remaining() == 0 {
                return Poll::Pending;
            }

            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => handle.write(chunk),
                Poll::Ready(Some(Err(err))) => {
                    debug!("source stream failed: {}", err);
                    handle.error(err);
                    return Poll::Ready(());
                }
                Poll::Ready(None) => {
                    handle.done();
                    return Poll::Ready(());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl EntityWriter for PumpWriter {
    fn on_init(&mut self, handle: Arc<dyn WriteHandle>) {
        self.shared.state.lock().handle = Some(handle);
        self.shared.waker.wake();
    }

    fn on_write_possible(&mut self) {
        self.shared.waker.wake();
    }

    fn on_abort(&mut self, err: Error) {
        trace!("stream pump aborted: {}", err);
        {
            let mut state = self.shared.state.lock();
            state.aborted = true;
            state.handle = None;
        }
        self.shared.waker.wake();
    }
}
