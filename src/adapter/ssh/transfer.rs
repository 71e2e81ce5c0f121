//! Sender half of the scp sink protocol.
//!
//! The wire sequence is a `C<mode> <size> <name>\n` header, exactly `size`
//! bytes of payload and a single `0x00`. The sink answers on its stdout with
//! one status byte per step: `0x00` for ok, `0x01` (warning) or `0x02` (fatal)
//! followed by a message line.

use std::{
    cmp,
    fmt,
    fs::File,
    io::{self, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    thread,
};

use tracing::debug;

use super::RemoteSession;
use crate::{
    error::{Error, Phase, RemoteFailure, Result},
    progress::{ProgressLine, TransferState},
};

pub const SINK_COMMAND: &str = "/usr/bin/scp -qt";
pub const PROGRESS_LABEL: &str = "Transferring";

const PHASE: Phase = Phase::Transfer;

pub fn sink_command(destination: &Path) -> String {
    format!("{SINK_COMMAND} {}", destination.display())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub mode: u32,
    pub size: u64,
    pub name: String,
}

impl FileHeader {
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{:04o} {} {}", self.mode, self.size, self.name)
    }
}

/// A local regular file opened for streaming
#[derive(Debug)]
pub struct Source {
    path: PathBuf,
    file: File,
    size: u64,
}

impl Source {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| Error::source_file(path, err))?;
        let metadata = file.metadata().map_err(|err| Error::source_file(path, err))?;

        if !metadata.is_file() {
            return Err(Error::source_file(
                path,
                io::Error::new(ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            size: metadata.len(),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self, mode: u32) -> Result<FileHeader> {
        let name = self.path.file_name().ok_or_else(|| {
            Error::source_file(
                &self.path,
                io::Error::new(ErrorKind::InvalidInput, "path has no file name"),
            )
        })?;
        let name = name.to_string_lossy().into_owned();

        // The header is newline terminated
        if name.contains('\n') {
            return Err(Error::source_file(
                &self.path,
                io::Error::new(ErrorKind::InvalidInput, "file name contains a newline"),
            ));
        }

        Ok(FileHeader {
            mode,
            size: self.size,
            name,
        })
    }
}

pub enum Framing {
    /// Header, payload and terminating null byte
    Sink(FileHeader),
    /// Payload only
    Raw,
}

/// Everything the producer task needs to stream one file
pub struct Payload {
    source: Source,
    framing: Framing,
    chunk_size: usize,
    progress: Option<ProgressLine<Box<dyn Write + Send>>>,
}

impl Payload {
    pub fn new(source: Source, framing: Framing, chunk_size: usize) -> Self {
        Self {
            source,
            framing,
            chunk_size: chunk_size.max(1),
            progress: None,
        }
    }

    pub fn with_progress(mut self, out: Box<dyn Write + Send>) -> Self {
        self.progress = Some(ProgressLine::new(out, PROGRESS_LABEL));
        self
    }

    /// Writes the framed file into `input` and returns the payload byte count
    pub fn pump(mut self, input: &mut dyn Write) -> Result<u64> {
        let limit = match &self.framing {
            Framing::Sink(header) => {
                input
                    .write_all(header.encode().as_bytes())
                    .map_err(|err| Error::stream(PHASE, err))?;
                Some(header.size)
            }
            Framing::Raw => None,
        };

        let mut state = TransferState::new(self.source.size);
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            let want = match limit {
                Some(limit) => cmp::min(buf.len() as u64, limit - state.copied_bytes) as usize,
                None => buf.len(),
            };
            if want == 0 {
                break;
            }

            let read = match self.source.file.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::source_file(&self.source.path, err)),
            };

            input
                .write_all(&buf[..read])
                .map_err(|err| Error::stream(PHASE, err))?;

            let percent = state.advance(read);
            self.report(percent);
        }

        if let Some(limit) = limit {
            if state.copied_bytes < limit {
                return Err(Error::source_file(
                    &self.source.path,
                    io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!("file shrank to {} of {} bytes", state.copied_bytes, limit),
                    ),
                ));
            }

            input.write_all(&[0]).map_err(|err| Error::stream(PHASE, err))?;
        }

        input.flush().map_err(|err| Error::stream(PHASE, err))?;

        if state.copied_bytes == 0 {
            self.report(state.percent());
        }
        if let Some(progress) = &mut self.progress {
            if let Err(err) = progress.finish() {
                debug!(%err, "Could not finish progress line");
            }
        }

        Ok(state.copied_bytes)
    }

    fn report(&mut self, percent: f64) {
        if let Some(progress) = &mut self.progress {
            if let Err(err) = progress.render(percent) {
                debug!(%err, "Could not render progress");
            }
        }
    }
}

/// Starts the sink at `destination`, streams `payload` into it from a
/// producer thread and waits for the sink to exit
pub fn send_to_sink<S: RemoteSession>(
    session: &mut S,
    destination: &Path,
    payload: Payload,
    stderr: &mut dyn Write,
) -> Result<u64> {
    session
        .exec(&sink_command(destination))
        .map_err(|err| Error::remote(PHASE, err))?;
    let input = session.input().map_err(|err| Error::stream(PHASE, err))?;

    let streamed = thread::scope(|scope| {
        let producer = scope.spawn(move || {
            let mut input = input;
            payload.pump(input.as_mut())
        });
        producer.join().unwrap_or_else(|_| {
            Err(Error::stream(
                PHASE,
                io::Error::new(ErrorKind::Other, "producer thread panicked"),
            ))
        })
    });

    if let Err(err) = session.close_input() {
        if streamed.is_ok() {
            return Err(Error::stream(PHASE, err));
        }
        debug!(%err, "Could not close sink input");
    }

    let mut reply = Vec::new();
    let status = match session.wait(&mut reply, stderr) {
        Ok(status) => status,
        Err(err) => {
            return match streamed {
                Err(streamed) => Err(streamed),
                Ok(_) => Err(Error::remote(PHASE, err)),
            }
        }
    };

    if let Err(message) = check_acknowledgement(&reply) {
        return Err(Error::remote(PHASE, RemoteFailure::Rejected(message)));
    }
    if status != 0 {
        return Err(Error::remote(PHASE, RemoteFailure::ExitStatus(status)));
    }

    let bytes = streamed?;
    debug!(bytes, destination = %destination.display(), "Sink accepted the file");

    Ok(bytes)
}

/// Interprets the status bytes the sink wrote to its stdout
pub fn check_acknowledgement(reply: &[u8]) -> std::result::Result<(), String> {
    let mut bytes = reply.iter();

    while let Some(&code) = bytes.next() {
        if code != 1 && code != 2 {
            continue;
        }

        let message: Vec<u8> = bytes
            .by_ref()
            .take_while(|&&byte| byte != b'\n')
            .copied()
            .collect();
        let message = String::from_utf8_lossy(&message).trim().to_owned();

        return Err(if message.is_empty() {
            format!("reply code {code}")
        } else {
            message
        });
    }

    Ok(())
}
