use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, CONTENT_TYPE};
use spin::Mutex;

use crate::boundary::{BodyScan, Delimiter};
use crate::constants::{BOUNDARY_EXT, CRLF};
use crate::entity_stream::{EntityReader, EntityStream, ReadHandle};
use crate::error::{Error, IllegalFormat};
use crate::headers::{self, PartHeaders};
use crate::part::{CallbackResult, MultiPartReaderCallback, SinglePartReader, SinglePartReaderCallback};
use crate::state::{MultipartState, PartSlot, PartStage, ReaderStage};

/// Reads a multipart body from an [`EntityStream`], one part at a time.
///
/// Nothing is read until a [`MultiPartReaderCallback`] is registered. From then on the reader pulls chunks from the
/// stream only as fast as the client consumes them: each part is announced through
/// [`on_new_part`](MultiPartReaderCallback::on_new_part) and the reader doesn't scan past it until the client has
/// read it to the end or abandoned it.
///
/// # Examples
///
/// ```
/// use multipart_mime::{EntityStream, MultiPartReader};
///
/// # fn run() -> multipart_mime::Result<()> {
/// let body = "preamble\r\n--X-BOUNDARY\r\nContent-Type: text/plain\r\n\r\nabcd\r\n--X-BOUNDARY--\r\n";
/// let request = http::Request::builder()
///     .header(http::header::CONTENT_TYPE, "multipart/mixed; boundary=X-BOUNDARY")
///     .body(EntityStream::from_bytes(body, 4))
///     .unwrap();
///
/// let reader = MultiPartReader::create_and_acquire_stream(request)?;
/// assert!(!reader.have_all_parts_finished());
/// # Ok(())
/// # }
/// # run().unwrap();
/// ```
#[derive(Clone)]
pub struct MultiPartReader {
    inner: Arc<ReaderInner>,
}

pub(crate) struct ReaderInner {
    pub(crate) state: Mutex<MultipartState>,
    entity: EntityStream,
}

struct ReaderAdapter {
    inner: Arc<ReaderInner>,
}

enum Action {
    Request(Arc<dyn ReadHandle>),
    NewPart(Box<dyn MultiPartReaderCallback>, usize, Arc<PartHeaders>),
    PartData(usize, Box<dyn SinglePartReaderCallback>, Bytes),
    PartFinished(Box<dyn SinglePartReaderCallback>),
    PartAbandoned(Box<dyn SinglePartReaderCallback>),
    Finished(Box<dyn MultiPartReaderCallback>),
    Abandoned(Box<dyn MultiPartReaderCallback>),
    Failed {
        handle: Option<Arc<dyn ReadHandle>>,
        part: Option<Box<dyn SinglePartReaderCallback>>,
        callback: Option<Box<dyn MultiPartReaderCallback>>,
        err: Error,
    },
}

impl MultiPartReader {
    /// Creates a reader for a body delimited by `boundary`.
    pub fn new<B>(entity: EntityStream, boundary: B) -> MultiPartReader
    where
        B: AsRef<str>,
    {
        MultiPartReader {
            inner: Arc::new(ReaderInner {
                state: Mutex::new(MultipartState::new(boundary.as_ref())),
                entity,
            }),
        }
    }

    /// Creates a reader for a request, taking the boundary from its `Content-Type` header.
    pub fn create_and_acquire_stream(request: http::Request<EntityStream>) -> crate::Result<MultiPartReader> {
        let (parts, entity) = request.into_parts();
        MultiPartReader::from_headers(&parts.headers, entity)
    }

    /// Creates a reader for a response, taking the boundary from its `Content-Type` header.
    pub fn create_and_acquire_stream_from_response(
        response: http::Response<EntityStream>,
    ) -> crate::Result<MultiPartReader> {
        let (parts, entity) = response.into_parts();
        MultiPartReader::from_headers(&parts.headers, entity)
    }

    fn from_headers(headers: &HeaderMap, entity: EntityStream) -> crate::Result<MultiPartReader> {
        let content_type = headers.get(CONTENT_TYPE).ok_or(IllegalFormat::NoContentType)?;
        let content_type = content_type
            .to_str()
            .map_err(|_| IllegalFormat::InvalidContentType)?;

        let boundary = crate::parse_boundary(content_type)?;
        Ok(MultiPartReader::new(entity, boundary))
    }

    /// Registers the callback that receives the parts.
    ///
    /// The first registration starts reading. A later one hands the stream over to a new callback, which is only
    /// allowed while the current part is untouched; the new callback then receives that part again through
    /// [`on_new_part`](MultiPartReaderCallback::on_new_part).
    pub fn register_reader_callback<C>(&self, callback: C) -> crate::Result<()>
    where
        C: MultiPartReaderCallback + 'static,
    {
        let first = {
            let mut state = self.inner.state.lock();

            match state.stage {
                ReaderStage::Finished | ReaderStage::ReadingEpilogue => {
                    return Err(Error::MultiPartReaderFinished(
                        "Unable to register a callback. This reader has already finished reading.",
                    ));
                }
                ReaderStage::ReadingPreamble => {
                    return Err(Error::StreamBusy(
                        "Reader is busy reading in the preamble. Unable to register the callback at this time.",
                    ));
                }
                ReaderStage::Abandoning => {
                    return Err(Error::StreamBusy(
                        "Reader is busy performing a complete abandonment. Unable to register the callback.",
                    ));
                }
                ReaderStage::Created | ReaderStage::ReadingParts => {}
            }

            if part_in_use(&state) {
                return Err(Error::StreamBusy(
                    "Unable to register callback on the reader since there is currently a SinglePartReader in use, \
                     meaning that it was registered with a SinglePartReaderCallback.",
                ));
            }

            state.callback = Some(Box::new(callback));

            if state.stage == ReaderStage::Created {
                state.stage = ReaderStage::ReadingPreamble;
                true
            } else {
                state.announce_part = matches!(&state.current, Some(slot) if slot.stage == PartStage::Created);
                false
            }
        };

        if first {
            trace!("reader callback registered, reading the preamble");
            let adapter = ReaderAdapter {
                inner: self.inner.clone(),
            };

            if let Err(err) = self.inner.entity.set_reader(adapter) {
                let mut state = self.inner.state.lock();
                state.stage = ReaderStage::Finished;
                state.callback = None;
                return Err(err);
            }
        } else {
            self.inner.drive();
        }

        Ok(())
    }

    /// Abandons the current part and every part after it, without announcing them.
    ///
    /// The rest of the stream is drained and [`on_abandoned`](MultiPartReaderCallback::on_abandoned) is invoked at
    /// the end. Called before any callback was registered, the reader finishes straight away and the stream is
    /// cancelled.
    pub fn abandon_all_parts(&self) -> crate::Result<()> {
        let attach = {
            let mut state = self.inner.state.lock();

            match state.stage {
                ReaderStage::Finished | ReaderStage::ReadingEpilogue => {
                    return Err(Error::MultiPartReaderFinished(
                        "The reader is finished therefore it cannot proceed.",
                    ));
                }
                ReaderStage::ReadingPreamble => {
                    return Err(Error::StreamBusy(
                        "The reader is busy processing the preamble. Unable to proceed with abandonment. \
                         Please only call abandon_all_parts() upon invocation of on_new_part() on the client callback.",
                    ));
                }
                ReaderStage::Abandoning => {
                    return Err(Error::StreamBusy("Reader already busy abandoning."));
                }
                ReaderStage::Created => {
                    state.stage = ReaderStage::Finished;
                    true
                }
                ReaderStage::ReadingParts => {
                    if part_in_use(&state) {
                        return Err(Error::StreamBusy(
                            "Unable to abandon all parts due to current SinglePartReader in use.",
                        ));
                    }

                    if let Some(slot) = state.current.as_mut() {
                        slot.stage = PartStage::Finished;
                    }
                    state.announce_part = false;
                    state.stage = ReaderStage::Abandoning;
                    false
                }
            }
        };

        if attach {
            debug!("abandoning a reader that was never started, cancelling its stream");
            let adapter = ReaderAdapter {
                inner: self.inner.clone(),
            };

            if let Err(err) = self.inner.entity.set_reader(adapter) {
                debug!("unable to cancel the entity stream: {}", err);
            }
        } else {
            trace!("abandoning all remaining parts");
            self.inner.drive();
        }

        Ok(())
    }

    /// Whether the reader reached a terminal state, successfully or not.
    pub fn have_all_parts_finished(&self) -> bool {
        self.inner.state.lock().stage == ReaderStage::Finished
    }

    /// The bytes before the first boundary, decoded as UTF-8.
    pub fn preamble(&self) -> String {
        headers::decode(&self.inner.state.lock().preamble)
    }

    /// The bytes after the terminal boundary line, decoded as UTF-8. Only complete once the reader finished.
    pub fn epilogue(&self) -> String {
        let state = self.inner.state.lock();
        let epilogue = &state.epilogue[..];
        headers::decode(epilogue.strip_prefix(CRLF.as_bytes()).unwrap_or(epilogue))
    }
}

// A part is in use once a callback has been bound to it and it hasn't finished yet.
fn part_in_use(state: &MultipartState) -> bool {
    match &state.current {
        Some(slot) => !matches!(slot.stage, PartStage::Created | PartStage::Finished),
        None => false,
    }
}

impl ReaderInner {
    /// Runs the reader until it needs input from the client or the transport.
    ///
    /// Only one thread drives at a time; a call made while another drive is in progress, including one made from a
    /// callback, returns immediately and the running loop picks up the change.
    pub(crate) fn drive(self: &Arc<Self>) {
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

            self.perform(action);
        }
    }

    fn perform(self: &Arc<Self>, action: Action) {
        match action {
            Action::Request(handle) => handle.request(1),
            Action::NewPart(mut callback, idx, headers) => {
                trace!("announcing part {}", idx);
                let result = callback.on_new_part(SinglePartReader::new(self.clone(), idx, headers));
                self.restore_callback(callback, result);
            }
            Action::PartData(idx, mut callback, data) => {
                let result = callback.on_part_data_available(data);
                self.restore_part_callback(idx, callback, result);
            }
            Action::PartFinished(mut callback) => log_terminal("part on_finished", callback.on_finished()),
            Action::PartAbandoned(mut callback) => log_terminal("part on_abandoned", callback.on_abandoned()),
            Action::Finished(mut callback) => log_terminal("on_finished", callback.on_finished()),
            Action::Abandoned(mut callback) => log_terminal("on_abandoned", callback.on_abandoned()),
            Action::Failed {
                handle,
                part,
                callback,
                err,
            } => {
                debug!("multipart reader failed: {}", err);

                if let Some(mut part) = part {
                    part.on_stream_error(err.clone());
                }
                if let Some(mut callback) = callback {
                    callback.on_stream_error(err);
                }
                if let Some(handle) = handle {
                    handle.cancel();
                }
            }
        }
    }

    fn restore_callback(&self, callback: Box<dyn MultiPartReaderCallback>, result: CallbackResult) {
        let mut state = self.state.lock();
        if state.callback.is_none() && state.stage != ReaderStage::Finished {
            state.callback = Some(callback);
        }

        if let Err(err) = result {
            state.fail_later(Error::callback(err));
        }
    }

    fn restore_part_callback(&self, idx: usize, callback: Box<dyn SinglePartReaderCallback>, result: CallbackResult) {
        let mut state = self.state.lock();
        if let Some(slot) = state.part_mut(idx) {
            if slot.callback.is_none() && slot.stage != PartStage::Finished {
                slot.callback = Some(callback);
            }
        }

        if let Err(err) = result {
            state.fail_later(Error::callback(err));
        }
    }
}

fn log_terminal(name: &str, result: CallbackResult) {
    if let Err(err) = result {
        debug!("ignoring an error returned from {}: {}", name, err);
    }
}

impl MultipartState {
    fn fail_later(&mut self, err: Error) {
        if self.stage == ReaderStage::Finished {
            debug!("ignoring an error raised after the reader finished: {}", err);
            return;
        }

        if self.pending_error.is_none() {
            self.pending_error = Some(err);
        }
    }

    fn step(&mut self) -> Option<Action> {
        if self.stage == ReaderStage::Finished {
            return None;
        }

        if let Some(err) = self.pending_error.take() {
            return Some(self.fail(err));
        }

        match self.stage {
            ReaderStage::Created | ReaderStage::Finished => None,
            ReaderStage::ReadingPreamble => self.step_preamble(),
            ReaderStage::ReadingParts => self.step_parts(),
            ReaderStage::ReadingEpilogue => self.step_epilogue(),
            ReaderStage::Abandoning => self.step_abandoning(),
        }
    }

    fn fail(&mut self, err: Error) -> Action {
        self.stage = ReaderStage::Finished;
        self.buffer.clear();

        let part = self
            .current
            .take()
            .filter(|slot| slot.stage != PartStage::Finished)
            .and_then(|slot| slot.callback);

        Action::Failed {
            handle: self.handle.take(),
            part,
            callback: self.callback.take(),
            err,
        }
    }

    fn pull(&mut self) -> Option<Action> {
        if self.transport_done || self.awaiting_data {
            return None;
        }

        let handle = self.handle.clone()?;
        self.awaiting_data = true;
        Some(Action::Request(handle))
    }

    fn step_preamble(&mut self) -> Option<Action> {
        match self.buffer.find_first_delimiter() {
            Err(reason) => Some(self.fail(reason.into())),
            Ok(Some(found)) => {
                let preamble = self.buffer.split_to(found.preamble_len);
                self.preamble.extend_from_slice(&preamble);
                self.buffer.advance(found.token_len);

                trace!("preamble of {} bytes consumed", found.preamble_len);
                self.stage = ReaderStage::ReadingParts;
                self.at_delimiter = true;
                self.step_parts()
            }
            Ok(None) if self.transport_done => Some(self.fail(IllegalFormat::NoBoundaryFound.into())),
            Ok(None) => self.pull(),
        }
    }

    fn step_parts(&mut self) -> Option<Action> {
        if self.at_delimiter {
            return self.step_delimiter();
        }

        if self.announce_part {
            let slot = self.current.as_ref()?;
            let (idx, headers) = (slot.idx, slot.headers.clone());
            let callback = self.callback.take()?;

            self.announce_part = false;
            return Some(Action::NewPart(callback, idx, headers));
        }

        let abandoning = match self.current.as_ref().map(|slot| slot.stage) {
            Some(PartStage::RequestedData) => false,
            Some(PartStage::RequestedAbandon) => true,
            _ => return None,
        };

        if self.buffer.len() < self.buffer.finishing_len() {
            if self.transport_done {
                return Some(self.fail(IllegalFormat::FinishingBoundaryMissing.into()));
            }
            return self.pull();
        }

        match self.buffer.scan_body() {
            BodyScan::AtDelimiter => {
                let delimiter_len = self.buffer.delimiter_len();
                self.buffer.advance(delimiter_len);
                self.at_delimiter = true;

                let slot = self.current.as_mut()?;
                slot.stage = PartStage::Finished;
                trace!("part {} finished", slot.idx);

                match slot.callback.take() {
                    Some(callback) if abandoning => Some(Action::PartAbandoned(callback)),
                    Some(callback) => Some(Action::PartFinished(callback)),
                    None => self.step_delimiter(),
                }
            }
            BodyScan::Data(size) => {
                let data = self.buffer.split_to(size);
                if abandoning {
                    return self.step_parts();
                }

                let slot = self.current.as_mut()?;
                slot.stage = PartStage::Ready;
                let callback = slot.callback.take()?;
                Some(Action::PartData(slot.idx, callback, data))
            }
        }
    }

    fn step_delimiter(&mut self) -> Option<Action> {
        match self.buffer.classify_delimiter(self.transport_done) {
            Delimiter::NeedMore => self.pull(),
            Delimiter::Terminal => {
                self.buffer.advance(BOUNDARY_EXT.len());
                self.at_delimiter = false;
                self.stage = ReaderStage::ReadingEpilogue;
                trace!("terminal boundary found after {} parts", self.next_part_idx);
                self.step_epilogue()
            }
            Delimiter::Part { lwsp, block_end } => {
                let headers = match headers::parse_headers(self.buffer.slice(lwsp, block_end)) {
                    Ok(headers) => headers,
                    Err(reason) => return Some(self.fail(reason.into())),
                };
                self.buffer.advance(block_end);
                self.at_delimiter = false;

                let idx = self.next_part_idx;
                self.next_part_idx += 1;
                self.current = Some(PartSlot {
                    idx,
                    stage: PartStage::Created,
                    callback: None,
                    headers: Arc::new(headers),
                });
                self.announce_part = true;
                self.step_parts()
            }
            Delimiter::Malformed(reason) => Some(self.fail(reason.into())),
        }
    }

    fn step_epilogue(&mut self) -> Option<Action> {
        if self.buffer.len() > 0 {
            let rest = self.buffer.take_all();
            self.epilogue.extend_from_slice(&rest);
        }

        if self.transport_done {
            self.stage = ReaderStage::Finished;
            self.handle = None;
            return self.callback.take().map(Action::Finished);
        }

        self.pull()
    }

    fn step_abandoning(&mut self) -> Option<Action> {
        self.buffer.clear();

        if self.transport_done {
            self.stage = ReaderStage::Finished;
            self.handle = None;
            self.current = None;
            return self.callback.take().map(Action::Abandoned);
        }

        self.pull()
    }
}

impl EntityReader for ReaderAdapter {
    fn on_init(&mut self, handle: Arc<dyn ReadHandle>) {
        {
            let mut state = self.inner.state.lock();
            if state.stage == ReaderStage::Finished {
                drop(state);
                handle.cancel();
                return;
            }
            state.handle = Some(handle);
        }

        self.inner.drive();
    }

    fn on_data_available(&mut self, data: Bytes) {
        {
            let mut state = self.inner.state.lock();
            if state.stage == ReaderStage::Finished {
                return;
            }
            state.awaiting_data = false;
            state.buffer.extend(&data);
        }

        self.inner.drive();
    }

    fn on_done(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.transport_done = true;
            state.awaiting_data = false;
        }

        self.inner.drive();
    }

    fn on_error(&mut self, err: Error) {
        {
            let mut state = self.inner.state.lock();
            state.transport_done = true;
            state.awaiting_data = false;
            state.fail_later(err);
        }

        self.inner.drive();
    }
}
