use std::io::{self, Write};

use tracing::debug;

use super::RemoteSession;
use crate::error::{Error, Phase, RemoteFailure, Result};

/// Runs `command` to completion on `session`, forwarding its output.
/// A non-zero exit status is an error.
pub fn execute<S: RemoteSession + ?Sized>(
    session: &mut S,
    command: &str,
    phase: Phase,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<()> {
    let exit_code = session
        .run(command, stdout, stderr)
        .map_err(|err| Error::remote(phase, err))?;

    debug!(command, exit_code, %phase, "Remote command finished");

    match exit_code {
        0 => Ok(()),
        code => Err(Error::remote(phase, RemoteFailure::ExitStatus(code))),
    }
}

/// Copies everything written into both a capture buffer and another writer
pub struct Tee<'a> {
    captured: &'a mut Vec<u8>,
    forward: &'a mut dyn Write,
}

impl<'a> Tee<'a> {
    pub fn new(captured: &'a mut Vec<u8>, forward: &'a mut dyn Write) -> Self {
        Self { captured, forward }
    }
}

impl Write for Tee<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.forward.write(buf)?;
        self.captured.extend_from_slice(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.forward.flush()
    }
}
