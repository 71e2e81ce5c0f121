//! Secure channel abstraction and its libssh2 backed implementation.
//!
//! A [`Connector`] dials one [`Connection`] per logical operation. Each
//! [`RemoteSession`] opened on it runs exactly one remote command. Both are
//! handed out wrapped in a [`Guard`] so they are closed on every exit path.

use std::{
    fmt,
    io::{self, ErrorKind, Read, Write},
    ops::{Deref, DerefMut},
    thread,
    time::Duration,
};

use ssh2::{Channel, Session};
use tracing::debug;

pub mod connect;
pub mod exec;
pub mod transfer;

#[cfg(test)]
pub(crate) mod fake;

pub use connect::{AuthMethod, CredentialChain, PasswordSource, Ssh2Connector};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Effective endpoint and login of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl Target {
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.address())
    }
}

pub trait Connector {
    type Connection: Connection;

    /// Opens an authenticated channel, offering `credentials` in order
    fn dial(&self, target: &Target, credentials: &CredentialChain)
        -> io::Result<Self::Connection>;
}

/// Anything that has to be released once an operation is over
pub trait Closable {
    fn close(&mut self) -> io::Result<()>;
}

pub trait Connection: Closable + Send {
    type Session: RemoteSession;

    fn open_session(&self) -> io::Result<Self::Session>;
}

pub trait RemoteSession: Closable + Send {
    /// Starts `command` without waiting for it
    fn exec(&mut self, command: &str) -> io::Result<()>;

    /// Writer feeding the remote process's stdin
    fn input(&mut self) -> io::Result<Box<dyn Write + Send>>;

    /// Signals end of input to the remote process
    fn close_input(&mut self) -> io::Result<()>;

    /// Forwards remote stdout and stderr until the process exits, then
    /// returns its exit status
    fn wait(&mut self, stdout: &mut dyn Write, stderr: &mut dyn Write) -> io::Result<i32>;

    fn run(
        &mut self,
        command: &str,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> io::Result<i32> {
        self.exec(command)?;
        self.close_input()?;
        self.wait(stdout, stderr)
    }
}

/// Closes the wrapped value when dropped
pub struct Guard<T: Closable>(T);

impl<T: Closable> Guard<T> {
    pub fn new(inner: T) -> Self {
        Self(inner)
    }
}

impl<T: Closable> Deref for Guard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: Closable> DerefMut for Guard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: Closable> Drop for Guard<T> {
    fn drop(&mut self) {
        if let Err(err) = self.0.close() {
            debug!(%err, "Error while closing");
        }
    }
}

pub struct Ssh2Connection {
    session: Session,
}

impl Ssh2Connection {
    pub(crate) fn new(session: Session) -> Self {
        Self { session }
    }
}

impl Closable for Ssh2Connection {
    fn close(&mut self) -> io::Result<()> {
        self.session
            .disconnect(None, "remote-pull done", None)
            .map_err(io::Error::from)
    }
}

impl Connection for Ssh2Connection {
    type Session = Ssh2Session;

    fn open_session(&self) -> io::Result<Ssh2Session> {
        let channel = self.session.channel_session()?;

        Ok(Ssh2Session {
            session: self.session.clone(),
            channel,
            closed: false,
        })
    }
}

pub struct Ssh2Session {
    session: Session,
    channel: Channel,
    closed: bool,
}

impl Closable for Ssh2Session {
    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.channel.close()?;
        self.channel.wait_close()?;
        Ok(())
    }
}

impl RemoteSession for Ssh2Session {
    fn exec(&mut self, command: &str) -> io::Result<()> {
        debug!(command, "Executing on remote");
        self.channel.exec(command)?;
        Ok(())
    }

    fn input(&mut self) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(self.channel.stream(0)))
    }

    fn close_input(&mut self) -> io::Result<()> {
        self.channel.send_eof()?;
        Ok(())
    }

    fn wait(&mut self, stdout: &mut dyn Write, stderr: &mut dyn Write) -> io::Result<i32> {
        let mut out = self.channel.stream(0);
        let mut err = self.channel.stderr();
        let channel = &self.channel;

        // Both streams share one window; a full stderr stalls stdout
        self.session.set_blocking(false);
        let drained = drain_interleaved(&mut out, &mut err, &mut || channel.eof(), stdout, stderr);
        self.session.set_blocking(true);
        drained?;

        self.channel.wait_close()?;

        Ok(self.channel.exit_status()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_brackets_ipv6_hosts() {
        let target = Target {
            host: "fe80::1".into(),
            port: 2200,
            user: "ops".into(),
        };
        assert_eq!(target.address(), "[fe80::1]:2200");
        assert_eq!(target.to_string(), "ops@[fe80::1]:2200");

        let target = Target {
            host: "10.0.0.5".into(),
            port: 22,
            user: "ops".into(),
        };
        assert_eq!(target.address(), "10.0.0.5:22");
    }

    struct Counted<'a>(&'a mut usize);

    impl Closable for Counted<'_> {
        fn close(&mut self) -> io::Result<()> {
            *self.0 += 1;
            Ok(())
        }
    }

    #[test]
    fn guard_closes_on_drop() {
        let mut closed = 0;
        {
            let _guard = Guard::new(Counted(&mut closed));
        }
        assert_eq!(closed, 1);
    }
}

/// Forwards `out` and `err` alternately until `at_eof` reports the remote is
/// done and a whole pass over both streams reads nothing. Both readers must be
/// non-blocking.
fn drain_interleaved(
    out: &mut dyn Read,
    err: &mut dyn Read,
    at_eof: &mut dyn FnMut() -> bool,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> io::Result<()> {
    let mut buf = [0; 8192];

    loop {
        let eof = at_eof();
        let forwarded = forward_available(out, stdout, &mut buf)?
            | forward_available(err, stderr, &mut buf)?;

        if !forwarded {
            if eof {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Copies whatever `src` has ready, returning whether anything was read
fn forward_available(src: &mut dyn Read, dst: &mut dyn Write, buf: &mut [u8]) -> io::Result<bool> {
    let mut forwarded = false;

    loop {
        match src.read(buf) {
            Ok(0) => return Ok(forwarded),
            Ok(n) => {
                dst.write_all(&buf[..n])?;
                forwarded = true;
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(forwarded),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}
