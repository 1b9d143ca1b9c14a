use std::io::{self, Write as _};

use bytes::Bytes;
use flate2::write::GzDecoder;

use super::Writer;

/// Streaming gzip decoder fed from the framed body reader.
///
/// Inflate failures surface as `io::Error` and are re-typed by the caller's
/// error funnel.
pub(crate) struct GzipDecoder {
    decoder: Box<GzDecoder<Writer>>,
}

impl GzipDecoder {
    pub(crate) fn new() -> GzipDecoder {
        GzipDecoder {
            decoder: Box::new(GzDecoder::new(Writer::new())),
        }
    }

    pub(crate) fn feed_data(&mut self, data: &[u8]) -> io::Result<Option<Bytes>> {
        self.decoder.write_all(data)?;
        self.decoder.flush()?;
        let b = self.decoder.get_mut().take();
        if !b.is_empty() {
            Ok(Some(b))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn feed_eof(&mut self) -> io::Result<Option<Bytes>> {
        self.decoder.try_finish()?;
        let b = self.decoder.get_mut().take();
        if !b.is_empty() {
            Ok(Some(b))
        } else {
            Ok(None)
        }
    }
}
