use std::time::Duration;

pub(crate) const BOUNDARY_EXT: &str = "--";
pub(crate) const CRLF: &str = "\r\n";
pub(crate) const CRLF_CRLF: &str = "\r\n\r\n";
pub(crate) const HEADER_SEPARATOR: &str = ": ";

pub(crate) const SPACE: u8 = b' ';
pub(crate) const TAB: u8 = b'\t';

pub(crate) const GENERATED_BOUNDARY_LEN: usize = 32;

/// Default upper bound on a single blocking read performed by [`InputStreamSource`](crate::InputStreamSource).
pub const DEFAULT_MAXIMUM_BLOCKING_DURATION: Duration = Duration::from_millis(3000);

/// Default number of bytes read from a blocking source per chunk.
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = 5000;

pub(crate) fn is_lwsp(byte: u8) -> bool {
    byte == SPACE || byte == TAB
}
