//! Scripted in-memory streams for unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connection::{Connection, Io};

/// One step of a read script.
pub(crate) enum Segment {
    Data(Vec<u8>),
    /// Fail one read with a socket timeout, as a live-but-quiet peer would.
    Timeout,
}

/// In-memory stream that serves reads from a fixed script of segments and
/// records everything written to it. An exhausted script reads as EOF.
pub(crate) struct ScriptedIo {
    reads: VecDeque<Segment>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedIo {
    pub(crate) fn new<T: AsRef<[u8]>>(segments: &[T]) -> ScriptedIo {
        ScriptedIo::with_script(
            segments
                .iter()
                .map(|s| Segment::Data(s.as_ref().to_vec()))
                .collect(),
        )
    }

    pub(crate) fn with_script(reads: Vec<Segment>) -> ScriptedIo {
        ScriptedIo {
            reads: reads.into(),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle onto the write log, usable after the stream is boxed away.
    pub(crate) fn written(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.written)
    }
}

impl Read for ScriptedIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reads.pop_front() {
            Some(Segment::Data(mut segment)) => {
                if segment.len() > buf.len() {
                    let rest = segment.split_off(buf.len());
                    self.reads.push_front(Segment::Data(rest));
                }
                buf[..segment.len()].copy_from_slice(&segment);
                Ok(segment.len())
            }
            Some(Segment::Timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "scripted timeout"))
            }
            None => Ok(0),
        }
    }
}

impl Write for ScriptedIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Io for ScriptedIo {
    fn set_io_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) {}
}

/// Connection over a scripted stream.
pub(crate) fn scripted_conn<T: AsRef<[u8]>>(segments: &[T]) -> Connection {
    Connection::new(Box::new(ScriptedIo::new(segments)))
}

/// Connection over a scripted stream plus a handle on the bytes written.
pub(crate) fn scripted_conn_logged<T: AsRef<[u8]>>(
    segments: &[T],
) -> (Connection, Arc<Mutex<Vec<u8>>>) {
    let io = ScriptedIo::new(segments);
    let written = io.written();
    (Connection::new(Box::new(io)), written)
}
