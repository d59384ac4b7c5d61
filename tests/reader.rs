mod common;

use bytes::Bytes;
use common::{headers, read_all, read_entity, Outcome, PartAction};
use multipart_mime::{
    CallbackResult, EntityStream, Error, IllegalFormat, MultiPartReader, MultiPartReaderCallback, SinglePartReader,
};

const BODY: &str = "This is the preamble.\r\n--X-BOUNDARY\r\nContent-Type: text/plain\r\nX-Id: 1\r\n\r\nabcd\r\n--X-BOUNDARY\r\nContent-Type: application/octet-stream\r\n\r\nHello world\nHello\r\nWorld\rAgain --X-BOUNDARY\r\n--X-BOUNDAR\r\n--X-BOUNDARY  \r\n\r\n\r\n--X-BOUNDARY--\r\nThis is the epilogue.";

#[test]
fn test_reads_parts_for_every_chunk_size() {
    for chunk_size in &[1, 2, 3, 5, 7, 13, 17, 64, 1000, 100_000] {
        let (reader, record) = read_all(BODY.as_bytes(), *chunk_size, "X-BOUNDARY");
        let record = record.lock().unwrap();

        assert_eq!(
            record.bodies(),
            vec![
                "abcd".to_owned(),
                "Hello world\nHello\r\nWorld\rAgain --X-BOUNDARY\r\n--X-BOUNDAR".to_owned(),
                String::new(),
            ],
            "chunk size {}",
            chunk_size
        );

        assert_eq!(record.parts[0].headers.get("content-type"), Some("text/plain"));
        assert_eq!(record.parts[0].headers.get("X-ID"), Some("1"));
        assert_eq!(
            record.parts[1].headers.get("Content-Type"),
            Some("application/octet-stream")
        );
        assert!(record.parts[2].headers.is_empty());

        assert!(record.parts.iter().all(|part| part.outcome == Some(Outcome::Finished)));
        assert_eq!(record.outcome, Some(Outcome::Finished));
        assert_eq!(record.terminal_calls, 1);

        assert!(reader.have_all_parts_finished());
        assert_eq!(reader.preamble(), "This is the preamble.");
        assert_eq!(reader.epilogue(), "This is the epilogue.");
    }
}

#[test]
fn test_first_boundary_at_start_of_stream() {
    let body = "--X\r\nk: v\r\n\r\nab\r\n--X\r\n\r\n\r\n--X--";
    let (reader, record) = read_all(body.as_bytes(), 1, "X");
    let record = record.lock().unwrap();

    assert_eq!(record.parts.len(), 2);
    assert_eq!(record.parts[0].headers, headers(&[("k", "v")]));
    assert_eq!(record.bodies(), vec!["ab".to_owned(), String::new()]);
    assert_eq!(record.outcome, Some(Outcome::Finished));
    assert_eq!(reader.preamble(), "");
    assert_eq!(reader.epilogue(), "");
}

#[test]
fn test_folded_headers() {
    let body = "--X\r\nX-Long: first\r\n second\r\nX-Short: s\r\n\r\nbody\r\n--X--\r\n";
    let (_, record) = read_all(body.as_bytes(), 3, "X");
    let record = record.lock().unwrap();

    assert_eq!(record.parts[0].headers.get("x-long"), Some("first\r\n second"));
    assert_eq!(record.parts[0].headers.get("x-short"), Some("s"));
}

#[test]
fn test_empty_envelope() {
    let (reader, record) = read_all(b"\r\n--X--\r\n", 2, "X");
    let record = record.lock().unwrap();

    assert!(record.parts.is_empty());
    assert_eq!(record.outcome, Some(Outcome::Finished));
    assert!(reader.have_all_parts_finished());
}

#[test]
fn test_abandoning_and_reading_parts_alternately() {
    let mut body = String::new();
    for i in 0..20 {
        body.push_str(&format!("\r\n--X\r\nX-Id: {}\r\n\r\n{}", i, "payload ".repeat(i * 10)));
    }
    body.push_str("\r\n--X--\r\n");

    for chunk_size in &[1, 9, 4096] {
        let (_, record) = read_entity(EntityStream::from_bytes(body.clone(), *chunk_size), "X", |idx| {
            if idx % 2 == 0 {
                PartAction::Abandon
            } else {
                PartAction::Read
            }
        });
        let record = record.lock().unwrap();

        assert_eq!(record.parts.len(), 20);
        for (idx, part) in record.parts.iter().enumerate() {
            if idx % 2 == 0 {
                assert!(part.body.is_empty());
                assert_eq!(part.outcome, Some(Outcome::Abandoned));
            } else {
                assert_eq!(part.body, "payload ".repeat(idx * 10).into_bytes());
                assert_eq!(part.outcome, Some(Outcome::Finished));
            }
            assert_eq!(part.terminal_calls, 1);
        }
        assert_eq!(record.outcome, Some(Outcome::Finished));
    }
}

#[test]
fn test_many_abandoned_parts_do_not_overflow_the_stack() {
    let mut body = String::new();
    for _ in 0..10_000 {
        body.push_str("\r\n--X\r\n\r\nx");
    }
    body.push_str("\r\n--X--\r\n");

    let (_, record) = read_entity(EntityStream::from_bytes(body, 1), "X", |_| PartAction::Abandon);
    let record = record.lock().unwrap();

    assert_eq!(record.parts.len(), 10_000);
    assert_eq!(record.outcome, Some(Outcome::Finished));
}

#[test]
fn test_abandon_all_parts() {
    let body = "--X\r\n\r\nfirst\r\n--X\r\n\r\nsecond\r\n--X\r\n\r\nthird\r\n--X--\r\n";
    let (reader, record) = read_entity(EntityStream::from_bytes(body, 5), "X", |idx| {
        if idx == 0 {
            PartAction::Read
        } else {
            PartAction::AbandonAll
        }
    });
    let record = record.lock().unwrap();

    assert_eq!(record.parts.len(), 2);
    assert_eq!(record.bodies()[0], "first");
    assert_eq!(record.outcome, Some(Outcome::Abandoned));
    assert_eq!(record.terminal_calls, 1);
    assert!(reader.have_all_parts_finished());
}

#[test]
fn test_abandon_all_parts_before_reading_cancels_the_stream() {
    let reader = MultiPartReader::new(EntityStream::from_bytes("--X--", 1), "X");
    reader.abandon_all_parts().unwrap();

    assert!(reader.have_all_parts_finished());
    assert_eq!(
        reader.abandon_all_parts(),
        Err(Error::MultiPartReaderFinished(
            "The reader is finished therefore it cannot proceed."
        ))
    );
}

fn failure(body: &str) -> (common::SharedRecord, Error) {
    let (_, record) = read_all(body.as_bytes(), 1, "X");
    let err = match &record.lock().unwrap().outcome {
        Some(Outcome::Failed(err)) => err.clone(),
        other => panic!("expected a stream error, got {:?}", other),
    };
    (record, err)
}

#[test]
fn test_malformed_bodies() {
    let cases = [
        ("no boundary at all", IllegalFormat::NoBoundaryFound),
        ("--X\r\nk: v\r\n\r\nunterminated body", IllegalFormat::FinishingBoundaryMissing),
        ("--X\r\nnot a header\r\n\r\nbody\r\n--X--", IllegalFormat::HeaderImproperlyFormatted),
        ("--X\r\n continuation\r\n\r\nbody\r\n--X--", IllegalFormat::HeaderImproperlyFormatted),
        ("--Xjunk\r\n\r\nbody\r\n--X--", IllegalFormat::HeadersImproperlyConstructed),
        ("--X\r\nk: v", IllegalFormat::PrematureHeaderTermination),
        ("--X", IllegalFormat::BoundaryWithoutCrlf),
    ];

    for (body, reason) in cases.iter() {
        let (record, err) = failure(body);
        assert_eq!(err.illegal_format(), Some(*reason), "body {:?}", body);
        assert_eq!(record.lock().unwrap().terminal_calls, 1);
    }
}

#[test]
fn test_truncated_part_receives_the_error() {
    let body = "--X\r\n\r\ncomplete\r\n--X\r\n\r\nthis part never ends and is long enough to release some bytes";
    let (record, err) = failure(body);
    let record = record.lock().unwrap();

    assert_eq!(err, Error::IllegalFormat(IllegalFormat::FinishingBoundaryMissing));
    assert_eq!(record.parts.len(), 2);
    assert_eq!(record.parts[0].outcome, Some(Outcome::Finished));
    assert_eq!(record.parts[1].outcome, Some(Outcome::Failed(err.clone())));
    assert_eq!(record.parts[1].terminal_calls, 1);
    assert!(!record.parts[1].body.is_empty());
}

#[test]
fn test_transport_error_reaches_part_and_reader_once() {
    struct FailingWriter {
        handle: Option<std::sync::Arc<dyn multipart_mime::WriteHandle>>,
        sent: bool,
    }

    impl multipart_mime::EntityWriter for FailingWriter {
        fn on_init(&mut self, handle: std::sync::Arc<dyn multipart_mime::WriteHandle>) {
            self.handle = Some(handle);
        }

        fn on_write_possible(&mut self) {
            let handle = self.handle.as_ref().unwrap();
            if self.sent {
                handle.error(Error::Aborted(std::sync::Arc::new(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                ))));
                handle.error(Error::Timeout);
            } else {
                self.sent = true;
                handle.write(Bytes::from("--X\r\n\r\npartial body that is long enough"));
            }
        }

        fn on_abort(&mut self, _err: Error) {}
    }

    let entity = EntityStream::new(FailingWriter {
        handle: None,
        sent: false,
    });
    let (_, record) = read_entity(entity, "X", |_| PartAction::Read);
    let record = record.lock().unwrap();

    match &record.outcome {
        Some(Outcome::Failed(Error::Aborted(err))) => assert_eq!(err.to_string(), "connection reset"),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(record.terminal_calls, 1);
    assert_eq!(record.parts[0].terminal_calls, 1);
}

struct FailOnPart(usize);

impl MultiPartReaderCallback for FailOnPart {
    fn on_new_part(&mut self, part: SinglePartReader) -> CallbackResult {
        if part.part_index() == self.0 {
            return Err("refusing this part".into());
        }
        part.abandon_part()?;
        Ok(())
    }

    fn on_finished(&mut self) -> CallbackResult {
        panic!("the stream should have failed");
    }

    fn on_abandoned(&mut self) -> CallbackResult {
        panic!("the stream should have failed");
    }

    fn on_stream_error(&mut self, err: Error) {
        match err {
            Error::CallbackFailed(cause) => assert_eq!(cause.to_string(), "refusing this part"),
            other => panic!("unexpected error {:?}", other),
        }
        self.0 = usize::MAX;
    }
}

#[test]
fn test_callback_error_fails_the_stream() {
    let body = "--X\r\n\r\na\r\n--X\r\n\r\nb\r\n--X--";
    let reader = MultiPartReader::new(EntityStream::from_bytes(body, 1), "X");
    reader.register_reader_callback(FailOnPart(1)).unwrap();

    assert!(reader.have_all_parts_finished());
}

struct Idle;

impl MultiPartReaderCallback for Idle {
    fn on_new_part(&mut self, _part: SinglePartReader) -> CallbackResult {
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

#[test]
fn test_misuse_is_reported_synchronously() {
    let parts = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

    struct Keep(std::sync::Arc<std::sync::Mutex<Vec<SinglePartReader>>>);

    impl MultiPartReaderCallback for Keep {
        fn on_new_part(&mut self, part: SinglePartReader) -> CallbackResult {
            self.0.lock().unwrap().push(part);
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

    let body = "--X\r\n\r\nabc\r\n--X--";
    let reader = MultiPartReader::new(EntityStream::from_bytes(body, 100), "X");
    reader.register_reader_callback(Keep(parts.clone())).unwrap();

    let part = parts.lock().unwrap()[0].clone();
    assert_eq!(part.request_data(), Err(Error::SinglePartNotInitialized));

    // A fresh callback may take over while the part is untouched, and sees it again.
    reader.register_reader_callback(Keep(parts.clone())).unwrap();
    assert_eq!(parts.lock().unwrap().len(), 2);

    struct Ignore;

    impl multipart_mime::SinglePartReaderCallback for Ignore {
        fn on_part_data_available(&mut self, _data: Bytes) -> CallbackResult {
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

    part.register_reader_callback(Ignore).unwrap();
    assert_eq!(
        part.register_reader_callback(Ignore),
        Err(Error::SinglePartBind("Callback already registered."))
    );

    assert!(matches!(reader.register_reader_callback(Idle), Err(Error::StreamBusy(_))));
    assert!(matches!(reader.abandon_all_parts(), Err(Error::StreamBusy(_))));

    // The part is read in one go; a second request is the one that sees the end.
    part.request_data().unwrap();
    part.request_data().unwrap();

    assert!(reader.have_all_parts_finished());
    assert_eq!(
        part.request_data(),
        Err(Error::SinglePartFinished("This SinglePartReader has already finished."))
    );
    assert!(matches!(
        reader.register_reader_callback(Idle),
        Err(Error::MultiPartReaderFinished(_))
    ));
}

#[test]
fn test_reader_from_request_headers() {
    let request = http::Request::builder()
        .header(http::header::CONTENT_TYPE, "multipart/related; boundary=abc")
        .body(EntityStream::from_bytes("--abc--", 1))
        .unwrap();
    assert!(MultiPartReader::create_and_acquire_stream(request).is_ok());

    let request = http::Request::builder()
        .body(EntityStream::from_bytes("", 1))
        .unwrap();
    assert_eq!(
        MultiPartReader::create_and_acquire_stream(request).err(),
        Some(Error::IllegalFormat(IllegalFormat::NoContentType))
    );

    let response = http::Response::builder()
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(EntityStream::from_bytes("", 1))
        .unwrap();
    assert_eq!(
        MultiPartReader::create_and_acquire_stream_from_response(response).err(),
        Some(Error::IllegalFormat(IllegalFormat::NotMultipart))
    );
}

#[test]
fn test_transport_error_after_finish_is_ignored() {
    struct ErrorAfterDone(Option<std::sync::Arc<dyn multipart_mime::WriteHandle>>);

    impl multipart_mime::EntityWriter for ErrorAfterDone {
        fn on_init(&mut self, handle: std::sync::Arc<dyn multipart_mime::WriteHandle>) {
            self.0 = Some(handle);
        }

        fn on_write_possible(&mut self) {
            if let Some(handle) = self.0.take() {
                handle.write(Bytes::from("--X\r\n\r\nbody\r\n--X--\r\n"));
                handle.done();
                handle.error(Error::Timeout);
                handle.done();
            }
        }

        fn on_abort(&mut self, _err: Error) {}
    }

    let (reader, record) = read_entity(EntityStream::new(ErrorAfterDone(None)), "X", |_| PartAction::Read);
    let record = record.lock().unwrap();

    assert_eq!(record.outcome, Some(Outcome::Finished));
    assert_eq!(record.terminal_calls, 1);
    assert_eq!(record.parts[0].terminal_calls, 1);
    assert!(reader.have_all_parts_finished());
}

#[test]
fn test_abandoning_twice_fails() {
    struct Hold(std::sync::Arc<std::sync::Mutex<Option<SinglePartReader>>>);

    impl MultiPartReaderCallback for Hold {
        fn on_new_part(&mut self, part: SinglePartReader) -> CallbackResult {
            *self.0.lock().unwrap() = Some(part);
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

    let held = std::sync::Arc::new(std::sync::Mutex::new(None));
    let body = "--X\r\nX-Id: 0\r\n\r\nfirst\r\n--X\r\nX-Id: 1\r\n\r\nsecond\r\n--X--";
    let reader = MultiPartReader::new(EntityStream::from_bytes(body, 2), "X");
    reader.register_reader_callback(Hold(held.clone())).unwrap();

    let first = held.lock().unwrap().take().unwrap();
    assert_eq!(first.headers().get("x-id"), Some("0"));
    first.abandon_part().unwrap();

    // Abandoning completed synchronously and announced the next part.
    assert_eq!(
        first.abandon_part(),
        Err(Error::SinglePartFinished("This SinglePartReader has already finished."))
    );
    assert_eq!(
        first.drain_part(),
        Err(Error::SinglePartFinished("This SinglePartReader has already finished."))
    );

    let second = held.lock().unwrap().take().unwrap();
    assert_eq!(second.part_index(), 1);
    second.drain_part().unwrap();
    assert!(reader.have_all_parts_finished());
}

#[test]
fn test_boundary_inside_preamble_without_crlf_is_malformed() {
    let body = "preamble--X\r\nk: v\r\n\r\npart body\r\n--X\r\n\r\nsecond\r\n--X--\r\n";

    for chunk_size in &[1, 4, 1000] {
        let (reader, record) = read_all(body.as_bytes(), *chunk_size, "X");
        let record = record.lock().unwrap();

        assert!(record.parts.is_empty(), "chunk size {}", chunk_size);
        assert_eq!(
            record.outcome,
            Some(Outcome::Failed(IllegalFormat::HeadersImproperlyConstructed.into()))
        );
        assert_eq!(record.terminal_calls, 1);
        assert!(reader.have_all_parts_finished());
    }
}

/// Serves a body in fixed-size chunks and counts how often it was aborted.
struct CountingWriter {
    chunks: std::collections::VecDeque<Bytes>,
    handle: Option<std::sync::Arc<dyn multipart_mime::WriteHandle>>,
    aborts: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl CountingWriter {
    fn entity(body: &str, chunk_size: usize) -> (EntityStream, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
        let aborts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let chunks = body
            .as_bytes()
            .chunks(chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();

        let writer = CountingWriter {
            chunks,
            handle: None,
            aborts: aborts.clone(),
        };
        (EntityStream::new(writer), aborts)
    }
}

impl multipart_mime::EntityWriter for CountingWriter {
    fn on_init(&mut self, handle: std::sync::Arc<dyn multipart_mime::WriteHandle>) {
        self.handle = Some(handle);
    }

    fn on_write_possible(&mut self) {
        let handle = self.handle.clone().unwrap();
        while handle.remaining() > 0 {
            match self.chunks.pop_front() {
                Some(chunk) => handle.write(chunk),
                None => {
                    handle.done();
                    return;
                }
            }
        }
    }

    fn on_abort(&mut self, _err: Error) {
        self.aborts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[test]
fn test_malformed_input_cancels_the_transport_once() {
    for chunk_size in &[1, 3, 1000] {
        let (entity, aborts) = CountingWriter::entity("--X\r\nno colon\r\n\r\nbody\r\n--X--\r\n", *chunk_size);
        let (_, record) = read_entity(entity, "X", |_| PartAction::Read);
        let record = record.lock().unwrap();

        assert_eq!(
            record.outcome,
            Some(Outcome::Failed(IllegalFormat::HeaderImproperlyFormatted.into()))
        );
        assert_eq!(aborts.load(std::sync::atomic::Ordering::SeqCst), 1, "chunk size {}", chunk_size);
    }
}

#[test]
fn test_callback_error_cancels_the_transport_once() {
    let (entity, aborts) = CountingWriter::entity("--X\r\n\r\na\r\n--X\r\n\r\nb\r\n--X--", 2);
    let reader = MultiPartReader::new(entity, "X");
    reader.register_reader_callback(FailOnPart(1)).unwrap();

    assert!(reader.have_all_parts_finished());
    assert_eq!(aborts.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn test_finished_stream_does_not_cancel_the_transport() {
    let (entity, aborts) = CountingWriter::entity("--X\r\n\r\na\r\n--X--\r\n", 2);
    let (_, record) = read_entity(entity, "X", |_| PartAction::Read);

    assert_eq!(record.lock().unwrap().outcome, Some(Outcome::Finished));
    assert_eq!(aborts.load(std::sync::atomic::Ordering::SeqCst), 0);
}
