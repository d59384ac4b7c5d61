#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use multipart_mime::{
    CallbackResult, EntityStream, Error, MultiPartReader, MultiPartReaderCallback, SinglePartReader,
    SinglePartReaderCallback,
};

struct Drain(SinglePartReader);

impl SinglePartReaderCallback for Drain {
    fn on_part_data_available(&mut self, _data: Bytes) -> CallbackResult {
        self.0.request_data()?;
        Ok(())
    }

    fn on_finished(&mut self) -> CallbackResult {
        Ok(())
    }

    fn on_abandoned(&mut self) -> CallbackResult {
        Ok(())
    }

    fn on_stream_error(&mut self, _err: Error) {}
}

struct Parts;

impl MultiPartReaderCallback for Parts {
    fn on_new_part(&mut self, part: SinglePartReader) -> CallbackResult {
        if part.part_index() % 2 == 0 {
            part.register_reader_callback(Drain(part.clone()))?;
            part.request_data()?;
        } else {
            part.abandon_part()?;
        }
        Ok(())
    }

    fn on_finished(&mut self) -> CallbackResult {
        Ok(())
    }

    fn on_abandoned(&mut self) -> CallbackResult {
        Ok(())
    }

    fn on_stream_error(&mut self, _err: Error) {}
}

fuzz_target!(|data: &[u8]| {
    let chunk_size = data.first().map(|b| *b as usize % 16 + 1).unwrap_or(1);
    let entity = EntityStream::from_bytes(data.to_vec(), chunk_size);

    let reader = MultiPartReader::new(entity, "X-BOUNDARY");
    reader.register_reader_callback(Parts).ok();
    assert!(reader.have_all_parts_finished());
});
