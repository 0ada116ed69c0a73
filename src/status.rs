//! The status lines printed while unpacking.
//!
//! Verbose output is `unpacking <name> (<digest>)...` when an image starts, completed by `done`
//! and a newline once it finished.  Quiet output is only the digest of each finished image, one
//! per line.  Lines are flushed as soon as they are written so that a failure leaves a truthful
//! partial transcript behind.

use std::io::{self, Write};

use crate::{
    archive::ResolvedImage,
    digest::Digest,
    unpack::{UnpackObserver, UnpackState},
};

pub struct StatusReporter<W> {
    out: W,
    quiet: bool,
}

impl<W: Write> StatusReporter<W> {
    pub fn new(out: W, quiet: bool) -> Self {
        Self { out, quiet }
    }

    pub fn report_start(&mut self, name: &str, digest: &Digest) -> io::Result<()> {
        if !self.quiet {
            write!(self.out, "unpacking {name} ({digest})...")?;
            self.out.flush()?;
        }
        Ok(())
    }

    pub fn report_done(&mut self, _name: &str, digest: &Digest) -> io::Result<()> {
        if self.quiet {
            writeln!(self.out, "{digest}")?;
        } else {
            writeln!(self.out, "done")?;
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> UnpackObserver for StatusReporter<W> {
    fn on_transition(
        &mut self,
        image: &ResolvedImage,
        _from: UnpackState,
        to: UnpackState,
    ) -> io::Result<()> {
        match to {
            UnpackState::Unpacking => self.report_start(&image.name, image.digest()),
            UnpackState::Done => self.report_done(&image.name, image.digest()),
            UnpackState::Pending | UnpackState::Failed => Ok(()),
        }
    }
}
