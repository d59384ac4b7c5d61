use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use derive_more::Display;

/// A boxed error as returned by client callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A foreign error shared between every callback that has to observe it.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// A set of errors that can occur while reading or writing a multipart stream.
///
/// Errors fan out: a single malformed payload is reported to the part currently being read and then to the
/// top-level reader callback, so the type is cheap to clone.
#[derive(Clone, Display)]
#[non_exhaustive]
pub enum Error {
    /// The multipart body, or the `Content-Type` describing it, is malformed.
    #[display(fmt = "Malformed multipart mime request. {}", _0)]
    IllegalFormat(IllegalFormat),

    /// The multipart reader already reached a terminal state.
    #[display(fmt = "{}", _0)]
    MultiPartReaderFinished(&'static str),

    /// The single part reader already reached a terminal state.
    #[display(fmt = "{}", _0)]
    SinglePartFinished(&'static str),

    /// A callback could not be bound to a single part reader.
    #[display(fmt = "{}", _0)]
    SinglePartBind(&'static str),

    /// Part data was requested before a callback was registered.
    #[display(fmt = "This SinglePartReader has not had a callback registered with it yet.")]
    SinglePartNotInitialized,

    /// The reader is still fulfilling an earlier request; requests are never queued.
    #[display(fmt = "{}", _0)]
    StreamBusy(&'static str),

    /// The upstream transport reported a failure.
    #[display(fmt = "stream read failed: {}", _0)]
    StreamReadFailed(SharedError),

    /// A client callback returned an error.
    #[display(fmt = "client callback failed: {}", _0)]
    CallbackFailed(SharedError),

    /// A blocking data source did not produce a chunk within the configured time.
    #[display(fmt = "InputStream reading timed out")]
    Timeout,

    /// A blocking data source failed while reading.
    #[display(fmt = "data source read failed: {}", _0)]
    SourceReadFailed(SharedError),

    /// The consumer of an entity stream cancelled it.
    #[display(fmt = "entity stream cancelled by its reader")]
    Cancelled,

    /// Writing was aborted, e.g. through [`MultiPartWriter::abort_all_data_sources`](crate::MultiPartWriter).
    #[display(fmt = "writing aborted: {}", _0)]
    Aborted(SharedError),

    /// Failed to build a header value.
    #[display(fmt = "failed to build header value {:?}: {}", value, cause)]
    DecodeHeaderValue { value: Vec<u8>, cause: SharedError },
}

/// Every way a multipart body or its `Content-Type` can be malformed.
#[derive(Clone, Copy, Display, PartialEq, Eq)]
#[non_exhaustive]
pub enum IllegalFormat {
    #[display(fmt = "No Content-Type header in this request")]
    NoContentType,

    #[display(fmt = "Not a valid multipart mime header.")]
    InvalidContentType,

    #[display(fmt = "Content-Type is not multipart.")]
    NotMultipart,

    #[display(fmt = "No boundary parameter in the Content-Type header.")]
    NoBoundary,

    #[display(fmt = "No boundary found!")]
    NoBoundaryFound,

    #[display(fmt = "Finishing boundary missing!")]
    FinishingBoundaryMissing,

    #[display(
        fmt = "Premature termination of multipart mime body due to a boundary without a subsequent consecutive CRLF."
    )]
    BoundaryWithoutCrlf,

    #[display(fmt = "Premature termination of headers within a part.")]
    PrematureHeaderTermination,

    #[display(fmt = "Headers are improperly constructed.")]
    HeadersImproperlyConstructed,

    #[display(fmt = "Individual headers are improperly formatted.")]
    HeaderImproperlyFormatted,
}

impl Error {
    pub(crate) fn callback(err: BoxError) -> Error {
        Error::CallbackFailed(Arc::from(err))
    }

    pub(crate) fn transport<E>(err: E) -> Error
    where
        E: Into<BoxError>,
    {
        Error::StreamReadFailed(Arc::from(err.into()))
    }

    /// Returns the malformed-input reason, if this is a format error.
    pub fn illegal_format(&self) -> Option<IllegalFormat> {
        match self {
            Error::IllegalFormat(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<IllegalFormat> for Error {
    fn from(reason: IllegalFormat) -> Self {
        Error::IllegalFormat(reason)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Debug for IllegalFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl std::error::Error for Error {}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string().eq(&other.to_string())
    }
}

impl Eq for Error {}
