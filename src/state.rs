use std::sync::Arc;

use bytes::BytesMut;

use crate::boundary::PartBuffer;
use crate::entity_stream::ReadHandle;
use crate::error::Error;
use crate::headers::PartHeaders;
use crate::part::{MultiPartReaderCallback, SinglePartReaderCallback};

pub(crate) struct MultipartState {
    pub(crate) stage: ReaderStage,
    pub(crate) buffer: PartBuffer,
    pub(crate) callback: Option<Box<dyn MultiPartReaderCallback>>,
    pub(crate) handle: Option<Arc<dyn ReadHandle>>,
    pub(crate) transport_done: bool,
    pub(crate) awaiting_data: bool,
    pub(crate) pending_error: Option<Error>,
    // The head of the buffer directly follows a delimiter token.
    pub(crate) at_delimiter: bool,
    pub(crate) current: Option<PartSlot>,
    pub(crate) announce_part: bool,
    pub(crate) next_part_idx: usize,
    pub(crate) dispatching: bool,
    pub(crate) preamble: BytesMut,
    pub(crate) epilogue: BytesMut,
}

/// The part currently owned by the reader. It stays here, finished, until the next part replaces it.
pub(crate) struct PartSlot {
    pub(crate) idx: usize,
    pub(crate) stage: PartStage,
    pub(crate) callback: Option<Box<dyn SinglePartReaderCallback>>,
    pub(crate) headers: Arc<PartHeaders>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReaderStage {
    Created,
    ReadingPreamble,
    ReadingParts,
    ReadingEpilogue,
    Abandoning,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartStage {
    Created,
    Ready,
    RequestedData,
    RequestedAbandon,
    Finished,
}

impl MultipartState {
    pub(crate) fn new(boundary: &str) -> MultipartState {
        MultipartState {
            stage: ReaderStage::Created,
            buffer: PartBuffer::new(boundary),
            callback: None,
            handle: None,
            transport_done: false,
            awaiting_data: false,
            pending_error: None,
            at_delimiter: false,
            current: None,
            announce_part: false,
            next_part_idx: 0,
            dispatching: false,
            preamble: BytesMut::new(),
            epilogue: BytesMut::new(),
        }
    }

    /// Returns the slot for part `idx` if it is still the live part.
    pub(crate) fn part_mut(&mut self, idx: usize) -> Option<&mut PartSlot> {
        self.current.as_mut().filter(|slot| slot.idx == idx)
    }
}
