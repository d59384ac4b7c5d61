use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{BoxError, Error};
use crate::headers::PartHeaders;
use crate::reader::ReaderInner;
use crate::state::{MultipartState, PartSlot, PartStage};

/// What a client callback returns. An `Err` fails the whole stream, exactly once.
pub type CallbackResult = Result<(), BoxError>;

/// Receives the parts of a [`MultiPartReader`](crate::MultiPartReader), in wire order.
///
/// Exactly one of `on_finished`, `on_abandoned` or `on_stream_error` is invoked, once, at the end of the stream.
/// Errors returned from the terminal callbacks are logged and otherwise ignored.
pub trait MultiPartReaderCallback: Send {
    /// A new part is available. The reader does not look past this part until it has been either read to the end or
    /// abandoned, or until [`MultiPartReader::abandon_all_parts`](crate::MultiPartReader::abandon_all_parts) is
    /// called.
    fn on_new_part(&mut self, part: SinglePartReader) -> CallbackResult;

    /// Every part was read and the epilogue has been consumed.
    fn on_finished(&mut self) -> CallbackResult;

    /// The remaining parts were abandoned and the underlying stream drained.
    fn on_abandoned(&mut self) -> CallbackResult;

    /// The stream failed; nothing else will be delivered.
    fn on_stream_error(&mut self, err: Error);
}

/// Receives the body of one part.
pub trait SinglePartReaderCallback: Send {
    /// Called once per [`SinglePartReader::request_data`].
    fn on_part_data_available(&mut self, data: Bytes) -> CallbackResult;

    /// The body of the part was delivered completely.
    fn on_finished(&mut self) -> CallbackResult;

    /// Called once the part was abandoned (or drained) and its bytes discarded.
    fn on_abandoned(&mut self) -> CallbackResult;

    /// The stream failed while this part was in use.
    fn on_stream_error(&mut self, err: Error);
}

/// A handle to one part of a multipart body.
///
/// The part's bytes are only read on demand: register a callback, then call [`request_data`](Self::request_data)
/// each time another chunk is wanted. Alternatively the part can be discarded with
/// [`abandon_part`](Self::abandon_part), which doesn't need a callback.
///
/// Handles are cheap to clone. Once the part finished, every operation fails with [`Error::SinglePartFinished`].
#[derive(Clone)]
pub struct SinglePartReader {
    reader: Arc<ReaderInner>,
    idx: usize,
    headers: Arc<PartHeaders>,
}

impl SinglePartReader {
    pub(crate) fn new(reader: Arc<ReaderInner>, idx: usize, headers: Arc<PartHeaders>) -> SinglePartReader {
        SinglePartReader { reader, idx, headers }
    }

    /// The headers of this part, available before any data is requested.
    pub fn headers(&self) -> &PartHeaders {
        &self.headers
    }

    /// The zero based position of this part in the stream.
    pub fn part_index(&self) -> usize {
        self.idx
    }

    /// Binds the callback that will receive this part's data. A part accepts exactly one callback.
    pub fn register_reader_callback<C>(&self, callback: C) -> crate::Result<()>
    where
        C: SinglePartReaderCallback + 'static,
    {
        let mut state = self.reader.state.lock();
        match state.part_mut(self.idx) {
            Some(slot) if slot.stage == PartStage::Created => {
                slot.callback = Some(Box::new(callback));
                slot.stage = PartStage::Ready;
                Ok(())
            }
            _ => Err(Error::SinglePartBind("Callback already registered.")),
        }
    }

    /// Asks for the next chunk of this part, delivered through
    /// [`on_part_data_available`](SinglePartReaderCallback::on_part_data_available), or for
    /// [`on_finished`](SinglePartReaderCallback::on_finished) once the body is exhausted.
    ///
    /// Requests are never queued: calling this again before the previous request was answered fails with
    /// [`Error::StreamBusy`].
    pub fn request_data(&self) -> crate::Result<()> {
        {
            let mut state = self.reader.state.lock();
            let slot = usable_slot(&mut state, self.idx)?;

            if slot.stage == PartStage::Created {
                return Err(Error::SinglePartNotInitialized);
            }
            slot.stage = PartStage::RequestedData;
        }

        self.reader.drive();
        Ok(())
    }

    /// Discards the rest of this part. The registered callback, if any, is told through
    /// [`on_abandoned`](SinglePartReaderCallback::on_abandoned).
    pub fn abandon_part(&self) -> crate::Result<()> {
        {
            let mut state = self.reader.state.lock();
            let slot = usable_slot(&mut state, self.idx)?;
            slot.stage = PartStage::RequestedAbandon;
        }

        trace!("abandoning part {}", self.idx);
        self.reader.drive();
        Ok(())
    }

    /// Same as [`abandon_part`](Self::abandon_part).
    pub fn drain_part(&self) -> crate::Result<()> {
        self.abandon_part()
    }
}

fn usable_slot(state: &mut MultipartState, idx: usize) -> crate::Result<&mut PartSlot> {
    let slot = match state.part_mut(idx) {
        Some(slot) => slot,
        None => return Err(Error::SinglePartFinished("This SinglePartReader has already finished.")),
    };

    match slot.stage {
        PartStage::Finished => Err(Error::SinglePartFinished("This SinglePartReader has already finished.")),
        PartStage::RequestedData => Err(Error::StreamBusy(
            "This SinglePartReader is currently busy fulfilling a call to request_data().",
        )),
        PartStage::RequestedAbandon => Err(Error::StreamBusy(
            "This SinglePartReader is currently busy fulfilling a call to abandon_part().",
        )),
        PartStage::Created | PartStage::Ready => Ok(slot),
    }
}

impl fmt::Debug for SinglePartReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinglePartReader")
            .field("idx", &self.idx)
            .field("headers", &self.headers)
            .finish()
    }
}
