use std::sync::Arc;

use bytes::Bytes;
use spin::Mutex;

use crate::entity_stream::{EntityWriter, WriteHandle};
use crate::error::Error;
use crate::headers::{self, PartHeaders};
use crate::part::{CallbackResult, MultiPartReaderCallback, SinglePartReader, SinglePartReaderCallback};
use crate::reader::MultiPartReader;
use crate::source::DataSource;

/// A data source forwarding the body of a part that is being read elsewhere.
///
/// The part keeps its headers. Its bytes are only requested from the upstream reader when the writer can take them,
/// and aborting the source abandons the part.
pub struct PartSource {
    part: SinglePartReader,
    chain: Arc<Mutex<Chain>>,
}

/// Re-emits every part of a [`MultiPartReader`] inside another multipart body.
pub(crate) struct ReaderSource {
    reader: MultiPartReader,
    delimiter: Bytes,
    chain: Arc<Mutex<Chain>>,
}

#[derive(Default)]
struct Chain {
    handle: Option<Arc<dyn WriteHandle>>,
    // The part whose boundary and headers still have to be written.
    pending: Option<(Bytes, SinglePartReader)>,
    current: Option<SinglePartReader>,
    aborted: bool,
}

struct PartForward {
    part: SinglePartReader,
    chain: Arc<Mutex<Chain>>,
    // Whether the end of this part ends the data source.
    last: bool,
}

struct ReaderForward {
    reader: MultiPartReader,
    delimiter: Bytes,
    chain: Arc<Mutex<Chain>>,
}

impl PartSource {
    /// Wraps a part that has no callback registered yet.
    pub fn new(part: SinglePartReader) -> PartSource {
        PartSource {
            part,
            chain: Arc::new(Mutex::new(Chain::default())),
        }
    }
}

impl EntityWriter for PartSource {
    fn on_init(&mut self, handle: Arc<dyn WriteHandle>) {
        let forward = PartForward {
            part: self.part.clone(),
            chain: self.chain.clone(),
            last: true,
        };

        if let Err(err) = self.part.register_reader_callback(forward) {
            handle.error(err);
            return;
        }

        let mut chain = self.chain.lock();
        chain.handle = Some(handle);
        chain.current = Some(self.part.clone());
    }

    fn on_write_possible(&mut self) {
        if let Err(err) = pump(&self.chain) {
            debug!("unable to request data for part {}: {}", self.part.part_index(), err);
        }
    }

    fn on_abort(&mut self, err: Error) {
        debug!("abandoning part {} after an abort: {}", self.part.part_index(), err);
        {
            let mut chain = self.chain.lock();
            chain.aborted = true;
            chain.handle = None;
            chain.current = None;
        }

        // A part busy with a request is abandoned once the data arrives.
        if let Err(err) = self.part.abandon_part() {
            trace!("part {} not abandoned right away: {}", self.part.part_index(), err);
        }
    }
}

impl DataSource for PartSource {
    fn data_source_headers(&self) -> PartHeaders {
        self.part.headers().clone()
    }
}

impl ReaderSource {
    pub(crate) fn new(reader: MultiPartReader, delimiter: Bytes) -> ReaderSource {
        ReaderSource {
            reader,
            delimiter,
            chain: Arc::new(Mutex::new(Chain::default())),
        }
    }
}

impl EntityWriter for ReaderSource {
    fn on_init(&mut self, handle: Arc<dyn WriteHandle>) {
        self.chain.lock().handle = Some(handle.clone());

        let forward = ReaderForward {
            reader: self.reader.clone(),
            delimiter: self.delimiter.clone(),
            chain: self.chain.clone(),
        };

        if let Err(err) = self.reader.register_reader_callback(forward) {
            self.chain.lock().handle = None;
            handle.error(err);
        }
    }

    fn on_write_possible(&mut self) {
        if let Err(err) = pump(&self.chain) {
            debug!("unable to request data from the chained reader: {}", err);
        }
    }

    fn on_abort(&mut self, err: Error) {
        debug!("abandoning the chained reader after an abort: {}", err);
        let part = {
            let mut chain = self.chain.lock();
            chain.aborted = true;
            chain.handle = None;
            chain.pending.take().map(|(_, part)| part).or_else(|| chain.current.take())
        };

        if self.reader.abandon_all_parts().is_ok() {
            return;
        }

        // The part in use is abandoned first; the next announcement abandons the rest.
        if let Some(part) = part {
            if let Err(err) = part.abandon_part() {
                trace!("part {} not abandoned right away: {}", part.part_index(), err);
            }
        }
    }
}

// Moves the chain forward while the writer has room: first the pending boundary and headers, then a request for the
// current part's data.
fn pump(chain: &Mutex<Chain>) -> crate::Result<()> {
    let (handle, pending, current) = {
        let mut chain = chain.lock();
        if chain.aborted {
            return Ok(());
        }

        let handle = match chain.handle.clone() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        if handle.remaining() == 0 {
            return Ok(());
        }

        (handle, chain.pending.take(), chain.current.clone())
    };

    let part = match pending {
        Some((head, part)) => {
            handle.write(head);

            let aborted = {
                let mut chain = chain.lock();
                if !chain.aborted {
                    chain.current = Some(part.clone());
                }
                chain.aborted
            };

            if aborted {
                return part.abandon_part();
            }
            if handle.remaining() == 0 {
                return Ok(());
            }
            part
        }
        None => match current {
            Some(part) => part,
            None => return Ok(()),
        },
    };

    request(&part)
}

fn request(part: &SinglePartReader) -> crate::Result<()> {
    match part.request_data() {
        // Already waiting for data; it is forwarded when it arrives.
        Err(Error::StreamBusy(_)) => Ok(()),
        result => result,
    }
}

impl SinglePartReaderCallback for PartForward {
    fn on_part_data_available(&mut self, data: Bytes) -> CallbackResult {
        let (handle, aborted) = {
            let chain = self.chain.lock();
            (chain.handle.clone(), chain.aborted)
        };

        if aborted {
            if let Err(err) = self.part.abandon_part() {
                debug!("unable to abandon part {}: {}", self.part.part_index(), err);
            }
            return Ok(());
        }

        if let Some(handle) = handle {
            handle.write(data);
            if handle.remaining() > 0 {
                request(&self.part)?;
            }
        }

        Ok(())
    }

    fn on_finished(&mut self) -> CallbackResult {
        let handle = {
            let mut chain = self.chain.lock();
            chain.current = None;
            if self.last {
                chain.handle.take()
            } else {
                None
            }
        };

        if let Some(handle) = handle {
            handle.done();
        }
        Ok(())
    }

    fn on_abandoned(&mut self) -> CallbackResult {
        trace!("chained part {} abandoned", self.part.part_index());
        self.chain.lock().current = None;
        Ok(())
    }

    fn on_stream_error(&mut self, err: Error) {
        let handle = {
            let mut chain = self.chain.lock();
            chain.current = None;
            if self.last {
                chain.handle.take()
            } else {
                None
            }
        };

        if let Some(handle) = handle {
            handle.error(err);
        }
    }
}

impl MultiPartReaderCallback for ReaderForward {
    fn on_new_part(&mut self, part: SinglePartReader) -> CallbackResult {
        if self.chain.lock().aborted {
            self.reader.abandon_all_parts()?;
            return Ok(());
        }

        part.register_reader_callback(PartForward {
            part: part.clone(),
            chain: self.chain.clone(),
            last: false,
        })?;

        let head = headers::serialize_boundary_and_headers(&self.delimiter, part.headers());
        self.chain.lock().pending = Some((head, part));

        pump(&self.chain)?;
        Ok(())
    }

    fn on_finished(&mut self) -> CallbackResult {
        let handle = self.chain.lock().handle.take();
        if let Some(handle) = handle {
            handle.done();
        }
        Ok(())
    }

    fn on_abandoned(&mut self) -> CallbackResult {
        trace!("chained reader abandoned");
        self.chain.lock().handle = None;
        Ok(())
    }

    fn on_stream_error(&mut self, err: Error) {
        let handle = self.chain.lock().handle.take();
        if let Some(handle) = handle {
            handle.error(err);
        }
    }
}
