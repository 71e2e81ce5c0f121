//! In-memory secure channel used by the tests. Sessions replay scripted
//! remote behaviour and record what was sent to them.

use std::{
    collections::VecDeque,
    io::{self, Write},
    sync::{Arc, Mutex},
};

use super::{Closable, Connection, Connector, CredentialChain, RemoteSession, Target};

/// How the next opened session behaves
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub broken_input: bool,
}

impl Script {
    pub fn exit(status: i32) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn stdout(mut self, data: impl AsRef<[u8]>) -> Self {
        self.stdout = data.as_ref().to_vec();
        self
    }

    pub fn stderr(mut self, data: impl AsRef<[u8]>) -> Self {
        self.stderr = data.as_ref().to_vec();
        self
    }

    /// Writes to the session's input fail as if the peer went away
    pub fn broken_input(mut self) -> Self {
        self.broken_input = true;
        self
    }
}

/// A command seen by the fake remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    pub command: String,
    pub input: Vec<u8>,
    pub input_closed: bool,
}

struct Record {
    command: String,
    input: Arc<Mutex<Vec<u8>>>,
    input_closed: bool,
}

#[derive(Default)]
struct State {
    dial_error: Option<io::ErrorKind>,
    session_error: bool,
    scripts: VecDeque<Script>,
    dials: Vec<(Target, Vec<&'static str>)>,
    records: Vec<Record>,
    open_connections: i32,
    open_sessions: i32,
}

#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<State>>,
}

impl FakeRemote {
    pub fn script(&self, script: Script) {
        self.state.lock().unwrap().scripts.push_back(script);
    }

    pub fn fail_dial(&self, kind: io::ErrorKind) {
        self.state.lock().unwrap().dial_error = Some(kind);
    }

    pub fn fail_sessions(&self) {
        self.state.lock().unwrap().session_error = true;
    }

    /// A connection that skips dialing
    pub fn connection(&self) -> FakeConnection {
        self.state.lock().unwrap().open_connections += 1;
        FakeConnection {
            state: self.state.clone(),
        }
    }

    pub fn dials(&self) -> Vec<(Target, Vec<&'static str>)> {
        self.state.lock().unwrap().dials.clone()
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .map(|record| Executed {
                command: record.command.clone(),
                input: record.input.lock().unwrap().clone(),
                input_closed: record.input_closed,
            })
            .collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.executed().into_iter().map(|run| run.command).collect()
    }

    pub fn open_connections(&self) -> i32 {
        self.state.lock().unwrap().open_connections
    }

    pub fn open_sessions(&self) -> i32 {
        self.state.lock().unwrap().open_sessions
    }
}

impl Connector for FakeRemote {
    type Connection = FakeConnection;

    fn dial(&self, target: &Target, credentials: &CredentialChain) -> io::Result<FakeConnection> {
        let mut state = self.state.lock().unwrap();
        state.dials.push((target.clone(), credentials.kinds()));

        if let Some(kind) = state.dial_error {
            return Err(io::Error::new(kind, "scripted dial failure"));
        }

        state.open_connections += 1;
        Ok(FakeConnection {
            state: self.state.clone(),
        })
    }
}

pub struct FakeConnection {
    state: Arc<Mutex<State>>,
}

impl Closable for FakeConnection {
    fn close(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().open_connections -= 1;
        Ok(())
    }
}

impl Connection for FakeConnection {
    type Session = FakeSession;

    fn open_session(&self) -> io::Result<FakeSession> {
        let mut state = self.state.lock().unwrap();
        if state.session_error {
            return Err(io::Error::new(io::ErrorKind::Other, "scripted session failure"));
        }

        state.open_sessions += 1;
        Ok(FakeSession {
            state: self.state.clone(),
            script: state.scripts.pop_front().unwrap_or_default(),
            record: None,
        })
    }
}

pub struct FakeSession {
    state: Arc<Mutex<State>>,
    script: Script,
    record: Option<usize>,
}

impl FakeSession {
    fn input_buffer(&self) -> io::Result<Arc<Mutex<Vec<u8>>>> {
        let index = self
            .record
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no command running"))?;
        Ok(self.state.lock().unwrap().records[index].input.clone())
    }
}

impl Closable for FakeSession {
    fn close(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().open_sessions -= 1;
        Ok(())
    }
}

impl RemoteSession for FakeSession {
    fn exec(&mut self, command: &str) -> io::Result<()> {
        assert!(self.record.is_none(), "one command per session");

        let mut state = self.state.lock().unwrap();
        state.records.push(Record {
            command: command.to_owned(),
            input: Arc::default(),
            input_closed: false,
        });
        self.record = Some(state.records.len() - 1);
        Ok(())
    }

    fn input(&mut self) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(FakeInput {
            buffer: self.input_buffer()?,
            broken: self.script.broken_input,
        }))
    }

    fn close_input(&mut self) -> io::Result<()> {
        if let Some(index) = self.record {
            self.state.lock().unwrap().records[index].input_closed = true;
        }
        Ok(())
    }

    fn wait(&mut self, stdout: &mut dyn Write, stderr: &mut dyn Write) -> io::Result<i32> {
        stdout.write_all(&self.script.stdout)?;
        stderr.write_all(&self.script.stderr)?;
        Ok(self.script.status)
    }
}

struct FakeInput {
    buffer: Arc<Mutex<Vec<u8>>>,
    broken: bool,
}

impl Write for FakeInput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
