//! The forward-only view of the input stream.
//!
//! Archives are read in a single pass from a stream that may not be seekable (standard input).
//! [`ForwardReader`] wraps the raw input, refuses to continue once the load was cancelled, and
//! remembers whether a failure came from the input itself.  The latter matters because the tar
//! decoder reports both "the pipe broke" and "this isn't a tar header" as `io::Error`.

use std::{
    cell::Cell,
    io::{self, Read},
    rc::Rc,
};

use crate::cancel::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamFault {
    /// The underlying reader failed.
    Source(io::ErrorKind),
    Cancelled,
}

#[derive(Debug, Default)]
pub(crate) struct StreamState {
    offset: Cell<u64>,
    fault: Cell<Option<StreamFault>>,
}

impl StreamState {
    /// Bytes consumed from the raw input so far.
    pub(crate) fn offset(&self) -> u64 {
        self.offset.get()
    }

    pub(crate) fn fault(&self) -> Option<StreamFault> {
        self.fault.get()
    }
}

pub(crate) struct ForwardReader<R> {
    inner: R,
    cancel: CancellationToken,
    state: Rc<StreamState>,
}

impl<R: Read> ForwardReader<R> {
    pub(crate) fn new(inner: R, cancel: CancellationToken) -> Self {
        Self {
            inner,
            cancel,
            state: Rc::default(),
        }
    }

    /// A handle on the reader's bookkeeping that stays usable after the reader was moved into
    /// a decoder.
    pub(crate) fn state(&self) -> Rc<StreamState> {
        Rc::clone(&self.state)
    }
}

impl<R: Read> Read for ForwardReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            self.state.fault.set(Some(StreamFault::Cancelled));
            return Err(io::Error::other("operation cancelled"));
        }
        match self.inner.read(buf) {
            Ok(n) => {
                self.state.offset.set(self.state.offset.get() + n as u64);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(e),
            Err(e) => {
                self.state.fault.set(Some(StreamFault::Source(e.kind())));
                Err(e)
            }
        }
    }
}
