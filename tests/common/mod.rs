#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use multipart_mime::{
    CallbackResult, EntityStream, Error, MultiPartReader, MultiPartReaderCallback, PartHeaders, SinglePartReader,
    SinglePartReaderCallback,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Finished,
    Abandoned,
    Failed(Error),
}

#[derive(Debug, Default)]
pub struct RecordedPart {
    pub headers: PartHeaders,
    pub body: Vec<u8>,
    pub outcome: Option<Outcome>,
    pub terminal_calls: usize,
}

#[derive(Debug, Default)]
pub struct Record {
    pub parts: Vec<RecordedPart>,
    pub outcome: Option<Outcome>,
    pub terminal_calls: usize,
}

impl Record {
    pub fn bodies(&self) -> Vec<String> {
        self.parts
            .iter()
            .map(|part| String::from_utf8_lossy(&part.body).into_owned())
            .collect()
    }
}

pub type SharedRecord = Arc<Mutex<Record>>;

/// What the collector does with each announced part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartAction {
    Read,
    Abandon,
    AbandonAll,
}

pub struct Collector {
    reader: MultiPartReader,
    record: SharedRecord,
    plan: Box<dyn Fn(usize) -> PartAction + Send>,
}

impl Collector {
    pub fn new<F>(reader: &MultiPartReader, record: &SharedRecord, plan: F) -> Collector
    where
        F: Fn(usize) -> PartAction + Send + 'static,
    {
        Collector {
            reader: reader.clone(),
            record: record.clone(),
            plan: Box::new(plan),
        }
    }

    fn finish(&self, outcome: Outcome) {
        let mut record = self.record.lock().unwrap();
        record.terminal_calls += 1;
        record.outcome = Some(outcome);
    }
}

impl MultiPartReaderCallback for Collector {
    fn on_new_part(&mut self, part: SinglePartReader) -> CallbackResult {
        let idx = {
            let mut record = self.record.lock().unwrap();
            record.parts.push(RecordedPart {
                headers: part.headers().clone(),
                ..RecordedPart::default()
            });
            record.parts.len() - 1
        };

        match (self.plan)(idx) {
            PartAction::Read => {
                part.register_reader_callback(PartCollector::new(&part, &self.record, idx))?;
                part.request_data()?;
            }
            PartAction::Abandon => {
                part.register_reader_callback(PartCollector::new(&part, &self.record, idx))?;
                part.abandon_part()?;
            }
            PartAction::AbandonAll => self.reader.abandon_all_parts()?,
        }

        Ok(())
    }

    fn on_finished(&mut self) -> CallbackResult {
        self.finish(Outcome::Finished);
        Ok(())
    }

    fn on_abandoned(&mut self) -> CallbackResult {
        self.finish(Outcome::Abandoned);
        Ok(())
    }

    fn on_stream_error(&mut self, err: Error) {
        self.finish(Outcome::Failed(err));
    }
}

pub struct PartCollector {
    part: SinglePartReader,
    record: SharedRecord,
    idx: usize,
}

impl PartCollector {
    pub fn new(part: &SinglePartReader, record: &SharedRecord, idx: usize) -> PartCollector {
        PartCollector {
            part: part.clone(),
            record: record.clone(),
            idx,
        }
    }

    fn finish(&self, outcome: Outcome) {
        let mut record = self.record.lock().unwrap();
        let part = &mut record.parts[self.idx];
        part.terminal_calls += 1;
        part.outcome = Some(outcome);
    }
}

impl SinglePartReaderCallback for PartCollector {
    fn on_part_data_available(&mut self, data: Bytes) -> CallbackResult {
        self.record.lock().unwrap().parts[self.idx].body.extend_from_slice(&data);
        self.part.request_data()?;
        Ok(())
    }

    fn on_finished(&mut self) -> CallbackResult {
        self.finish(Outcome::Finished);
        Ok(())
    }

    fn on_abandoned(&mut self) -> CallbackResult {
        self.finish(Outcome::Abandoned);
        Ok(())
    }

    fn on_stream_error(&mut self, err: Error) {
        self.finish(Outcome::Failed(err));
    }
}

/// Reads `entity` to the end, synchronously for in-memory streams.
pub fn read_entity<F>(entity: EntityStream, boundary: &str, plan: F) -> (MultiPartReader, SharedRecord)
where
    F: Fn(usize) -> PartAction + Send + 'static,
{
    let record = SharedRecord::default();
    let reader = MultiPartReader::new(entity, boundary);
    reader
        .register_reader_callback(Collector::new(&reader, &record, plan))
        .unwrap();
    (reader, record)
}

pub fn read_all(body: &[u8], chunk_size: usize, boundary: &str) -> (MultiPartReader, SharedRecord) {
    read_entity(
        EntityStream::from_bytes(body.to_vec(), chunk_size),
        boundary,
        |_| PartAction::Read,
    )
}

pub fn headers(pairs: &[(&str, &str)]) -> PartHeaders {
    pairs.iter().map(|(name, value)| (*name, *value)).collect()
}
