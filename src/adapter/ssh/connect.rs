use std::{
    fmt, fs,
    io::{self, ErrorKind},
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

use ssh2::{CheckResult, KnownHostFileKind, Session};
use tracing::{debug, info, warn};

use super::{Connector, Ssh2Connection, Target};
use crate::{
    config::{ssh::HostProfile, Environment, HostKeyPolicy, Settings},
    util::read_from_stdin,
};

/// Key files tried in `~/.ssh` before the profile's own identity file
pub const DEFAULT_KEY_FILES: [&str; 3] = ["id_rsa", "id_ecdsa", "id_ed25519"];

#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// A running agent reachable through this socket
    Agent(PathBuf),
    PrivateKey(PathBuf),
    Password(PasswordSource),
}

impl AuthMethod {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Agent(_) => "agent",
            AuthMethod::PrivateKey(_) => "publickey",
            AuthMethod::Password(_) => "password",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Agent(socket) => write!(f, "Agent({})", socket.display()),
            AuthMethod::PrivateKey(path) => write!(f, "PrivateKey({})", path.display()),
            AuthMethod::Password(source) => write!(f, "Password({source:?})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordSource {
    Empty,
    /// Asked for on the terminal when the method is reached
    Prompt,
}

impl PasswordSource {
    fn obtain(self, target: &Target) -> io::Result<String> {
        match self {
            PasswordSource::Empty => Ok(String::new()),
            PasswordSource::Prompt => read_from_stdin(true, &format!("[{}] Password: ", target)),
        }
    }
}

/// Authentication methods in the order they are offered. Never empty: a
/// password method always comes last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialChain(Vec<AuthMethod>);

impl CredentialChain {
    pub fn build(profile: &HostProfile, env: &Environment, password: PasswordSource) -> Self {
        let mut methods = Vec::new();

        if let Some(socket) = &env.agent_socket {
            match dial_agent(socket) {
                Ok(()) => methods.push(AuthMethod::Agent(socket.clone())),
                Err(err) => debug!(socket = %socket.display(), %err, "Agent not reachable"),
            }
        }

        for path in candidate_keys(profile, env) {
            match load_private_key(&path) {
                Ok(()) => methods.push(AuthMethod::PrivateKey(path)),
                Err(err) => debug!(path = %path.display(), %err, "Skipping key"),
            }
        }

        methods.push(AuthMethod::Password(password));

        Self(methods)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuthMethod> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.0.iter().map(AuthMethod::kind).collect()
    }
}

fn candidate_keys(profile: &HostProfile, env: &Environment) -> Vec<PathBuf> {
    let mut paths: Vec<_> = env
        .ssh_dir()
        .map(|dir| DEFAULT_KEY_FILES.iter().map(|name| dir.join(name)).collect())
        .unwrap_or_default();

    if let Some(identity_file) = &profile.identity_file {
        paths.push(identity_file.clone());
    }

    paths
}

#[cfg(unix)]
fn dial_agent(socket: &Path) -> io::Result<()> {
    std::os::unix::net::UnixStream::connect(socket).map(drop)
}

#[cfg(not(unix))]
fn dial_agent(_socket: &Path) -> io::Result<()> {
    Err(io::Error::new(ErrorKind::Unsupported, "agent sockets need unix"))
}

/// Reads `path` and checks it holds a PEM armoured private key
fn load_private_key(path: &Path) -> io::Result<()> {
    let content = fs::read_to_string(path)?;

    let armoured = content.lines().map(str::trim).any(|line| {
        line.starts_with("-----BEGIN ") && line.ends_with("PRIVATE KEY-----")
    });
    if !armoured {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "not a PEM encoded private key",
        ));
    }

    Ok(())
}

/// Dials over libssh2
#[derive(Debug, Clone)]
pub struct Ssh2Connector {
    host_key_policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
    connect_timeout: Duration,
}

impl Ssh2Connector {
    pub fn new(settings: &Settings, env: &Environment) -> Self {
        Self {
            host_key_policy: settings.host_key_policy,
            known_hosts: env.known_hosts(),
            connect_timeout: settings.connect_timeout(),
        }
    }
}

impl Connector for Ssh2Connector {
    type Connection = Ssh2Connection;

    fn dial(&self, target: &Target, credentials: &CredentialChain) -> io::Result<Ssh2Connection> {
        let stream = try_connection(&target.address(), self.connect_timeout)?;
        debug!(peer = ?stream.peer_addr().ok(), "TCP connection established");

        let mut session = Session::new()?;
        session.set_tcp_stream(stream);
        session.handshake()?;

        verify_host_key(&session, target, self.host_key_policy, self.known_hosts.as_deref())?;
        authenticate(&session, target, credentials)?;

        info!(%target, "Connected to the remote server");
        Ok(Ssh2Connection::new(session))
    }
}

pub(super) fn try_connection(host: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = None;

    for addr in host.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(%addr, %err, "Could not connect");
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(ErrorKind::NotFound, format!("{host} did not resolve to any address"))
    }))
}

fn verify_host_key(
    session: &Session,
    target: &Target,
    policy: HostKeyPolicy,
    known_hosts: Option<&Path>,
) -> io::Result<()> {
    if policy == HostKeyPolicy::AcceptAny {
        warn!(host = %target.host, "Host key verification is disabled, accepting any host key");
        return Ok(());
    }

    let (key, _) = session.host_key().ok_or_else(|| {
        io::Error::new(ErrorKind::InvalidData, "server did not present a host key")
    })?;

    let known_hosts_path = known_hosts.ok_or_else(|| {
        io::Error::new(ErrorKind::NotFound, "cannot locate known_hosts without a home directory")
    })?;

    let mut store = session.known_hosts()?;
    if let Err(err) = store.read_file(known_hosts_path, KnownHostFileKind::OpenSSH) {
        debug!(path = %known_hosts_path.display(), %err, "Could not load known hosts");
    }

    match store.check_port(&target.host, target.port, key) {
        CheckResult::Match => {
            debug!(host = %target.host, "Host key verified");
            Ok(())
        }
        CheckResult::Mismatch => Err(io::Error::new(
            ErrorKind::PermissionDenied,
            format!("host key for {} does not match known_hosts", target.host),
        )),
        CheckResult::NotFound => Err(io::Error::new(
            ErrorKind::PermissionDenied,
            format!("{} is not listed in {}", target.host, known_hosts_path.display()),
        )),
        CheckResult::Failure => Err(io::Error::new(
            ErrorKind::Other,
            "host key check failed",
        )),
    }
}

/// Offers the chain's methods in order until the server accepts one
fn authenticate(session: &Session, target: &Target, credentials: &CredentialChain) -> io::Result<()> {
    let user = target.user.as_str();

    for method in credentials.iter() {
        let attempt = match method {
            AuthMethod::Agent(_) => authenticate_with_agent(session, user),
            AuthMethod::PrivateKey(path) => session
                .userauth_pubkey_file(user, None, path, None)
                .map_err(io::Error::from),
            AuthMethod::Password(source) => source
                .obtain(target)
                .and_then(|password| Ok(session.userauth_password(user, &password)?)),
        };

        match attempt {
            Ok(()) if session.authenticated() => {
                debug!(method = ?method, "Authenticated");
                return Ok(());
            }
            Ok(()) => {}
            Err(err) => debug!(method = ?method, %err, "Authentication method rejected"),
        }
    }

    Err(io::Error::new(
        ErrorKind::PermissionDenied,
        format!(
            "authentication failed for {}, tried {}",
            user,
            credentials.kinds().join(", ")
        ),
    ))
}

fn authenticate_with_agent(session: &Session, user: &str) -> io::Result<()> {
    let mut agent = session.agent()?;
    agent.connect()?;
    agent.list_identities()?;

    let result = agent
        .identities()?
        .iter()
        .find_map(|identity| agent.userauth(user, identity).ok())
        .ok_or_else(|| io::Error::new(ErrorKind::PermissionDenied, "no agent identity accepted"));

    if let Err(err) = agent.disconnect() {
        debug!(%err, "Could not disconnect from agent");
    }

    result
}
