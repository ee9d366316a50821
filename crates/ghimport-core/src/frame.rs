//! Sequential reader for snapshot files holding length-prefixed BSON documents.
//!
//! Every document starts with its own total length as a little-endian `i32`
//! that includes the four prefix bytes, so a snapshot file is a plain
//! concatenation of documents with nothing in between.

use std::io::{self, ErrorKind, Read};
use std::iter::FusedIterator;

/// Smallest well-formed document: the prefix plus the trailing NUL.
pub const MIN_DOCUMENT_LEN: usize = 5;
/// Upper bound on a single document, matching the source database limit.
pub const MAX_DOCUMENT_LEN: usize = 16 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("truncated length prefix: read {got} of 4 bytes")]
    TruncatedPrefix { got: usize },
    #[error("invalid document length {0}")]
    InvalidLength(i32),
    #[error("document length {0} exceeds the {MAX_DOCUMENT_LEN} byte limit")]
    Oversized(usize),
    #[error("truncated document: declared {declared} bytes, read {read}")]
    TruncatedDocument { declared: usize, read: usize },
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// Yields raw document bytes, prefix included, until end of input.
///
/// After the first framing error the reader is exhausted; the remainder of
/// the file cannot be resynchronised.
#[derive(Debug)]
pub struct DumpReader<R> {
    inner: R,
    finished: bool,
}

impl<R: Read> DumpReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, finished: false }
    }

    /// Read the next framed document.
    ///
    /// Returns `Ok(None)` when the input ends cleanly on a document boundary.
    ///
    /// # Errors
    /// Returns a [`FrameError`] on a partial prefix, an impossible declared
    /// length, a short body or an underlying read failure.
    pub fn read_document(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.finished {
            return Ok(None);
        }
        let result = self.read_frame();
        if !matches!(result, Ok(Some(_))) {
            self.finished = true;
        }
        result
    }

    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut prefix = [0_u8; PREFIX_LEN];
        let got = read_fully(&mut self.inner, &mut prefix)?;
        if got == 0 {
            return Ok(None);
        }
        if got < PREFIX_LEN {
            return Err(FrameError::TruncatedPrefix { got });
        }

        let declared_raw = i32::from_le_bytes(prefix);
        let declared =
            usize::try_from(declared_raw).map_err(|_| FrameError::InvalidLength(declared_raw))?;
        if declared < MIN_DOCUMENT_LEN {
            return Err(FrameError::InvalidLength(declared_raw));
        }
        if declared > MAX_DOCUMENT_LEN {
            return Err(FrameError::Oversized(declared));
        }

        let mut document = vec![0_u8; declared];
        document[..PREFIX_LEN].copy_from_slice(&prefix);
        let body = read_fully(&mut self.inner, &mut document[PREFIX_LEN..])?;
        if body < declared - PREFIX_LEN {
            return Err(FrameError::TruncatedDocument { declared, read: PREFIX_LEN + body });
        }
        Ok(Some(document))
    }
}

impl<R: Read> Iterator for DumpReader<R> {
    type Item = Result<Vec<u8>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_document().transpose()
    }
}

impl<R: Read> FusedIterator for DumpReader<R> {}

/// Fill `buf` as far as the reader allows, retrying interrupted reads.
/// Returns the number of bytes read, which is short only at end of input.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
