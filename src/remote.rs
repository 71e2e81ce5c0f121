use std::{path::Path, sync::Arc};

use tracing::{debug, info};

use crate::{
    adapter::ssh::{
        exec::{execute, Tee},
        transfer::{send_to_sink, Framing, Payload, Source},
        Connection, Connector, CredentialChain, Guard, PasswordSource, Ssh2Connector, Target,
    },
    config::{
        ssh::{self, HostProfile},
        Environment, Settings,
    },
    error::{Error, Phase, Result},
    progress::{Console, StdConsole},
};

type SessionOf<C> = <<C as Connector>::Connection as Connection>::Session;

/// Entry point for everything done on a remote host. Every operation opens
/// its own connection and closes it before returning.
pub struct Remote<C: Connector = Ssh2Connector> {
    connector: C,
    settings: Settings,
    env: Environment,
    console: Arc<dyn Console>,
}

impl Remote<Ssh2Connector> {
    pub fn new(settings: Settings, env: Environment) -> Self {
        let connector = Ssh2Connector::new(&settings, &env);
        Self::with_connector(connector, settings, env)
    }
}

impl<C: Connector> Remote<C> {
    pub fn with_connector(connector: C, settings: Settings, env: Environment) -> Self {
        Self {
            connector,
            settings,
            env,
            console: Arc::new(StdConsole),
        }
    }

    pub fn with_console(mut self, console: Arc<dyn Console>) -> Self {
        self.console = console;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Looks `host` up in the SSH config and works out where to connect
    pub fn resolve(&self, user: &str, host: &str) -> Result<(Target, HostProfile)> {
        let profile = match self.settings.ssh_config_path(&self.env) {
            Some(path) => ssh::resolve(host, &path, &self.env)?,
            None => HostProfile::default(),
        };

        let port = profile.port_or_default();
        let target = Target {
            host: profile.host_name.clone().unwrap_or_else(|| host.to_owned()),
            port: port.parse().map_err(|err| Error::Dial {
                target: format!("{host}:{port}"),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid port '{port}': {err}"),
                ),
            })?,
            user: profile.user.clone().unwrap_or_else(|| user.to_owned()),
        };

        Ok((target, profile))
    }

    pub fn connect(&self, user: &str, host: &str) -> Result<Guard<C::Connection>> {
        let (target, profile) = self.resolve(user, host)?;

        let password = if self.settings.prompt_password {
            PasswordSource::Prompt
        } else {
            PasswordSource::Empty
        };
        let credentials = CredentialChain::build(&profile, &self.env, password);
        debug!(%target, methods = ?credentials.kinds(), "Dialing");

        let connection = self
            .connector
            .dial(&target, &credentials)
            .map_err(|source| Error::Dial {
                target: target.to_string(),
                source,
            })?;

        Ok(Guard::new(connection))
    }

    fn open_session(connection: &C::Connection, phase: Phase) -> Result<Guard<SessionOf<C>>> {
        connection
            .open_session()
            .map(Guard::new)
            .map_err(|source| Error::SessionCreation { phase, source })
    }

    /// Runs `command` with its output shown on the console. The captured
    /// stdout is returned as well.
    pub fn run_command(&self, command: &str, user: &str, host: &str) -> Result<String> {
        let connection = self.connect(user, host)?;
        let mut session = Self::open_session(&connection, Phase::Command)?;

        let mut captured = Vec::new();
        let mut stdout = self.console.stdout();
        let mut stderr = self.console.stderr();
        execute(
            &mut *session,
            command,
            Phase::Command,
            &mut Tee::new(&mut captured, &mut stdout),
            &mut stderr,
        )?;

        Ok(String::from_utf8_lossy(&captured).into_owned())
    }

    /// Copies `local_path` into the configured destination directory with
    /// progress shown, then runs `remote_command` on the same connection.
    pub fn copy_and_run(
        &self,
        local_path: &Path,
        remote_command: &str,
        user: &str,
        host: &str,
    ) -> Result<()> {
        let source = Source::open(local_path)?;
        let header = source.header(self.settings.file_mode)?;
        let payload = Payload::new(source, Framing::Sink(header), self.settings.chunk_size)
            .with_progress(self.console.stdout());

        let connection = self.connect(user, host)?;
        let mut stderr = self.console.stderr();

        {
            let mut transfer = Self::open_session(&connection, Phase::Transfer)?;
            let bytes = send_to_sink(
                &mut *transfer,
                &self.settings.destination_dir,
                payload,
                &mut stderr,
            )?;
            info!(bytes, file = %local_path.display(), "Transfer complete");
        }

        let mut command = Self::open_session(&connection, Phase::PostCommand)?;
        info!(command = remote_command, "Running command on remote server");
        let mut stdout = self.console.stdout();
        execute(
            &mut *command,
            remote_command,
            Phase::PostCommand,
            &mut stdout,
            &mut stderr,
        )
    }

    /// Streams the bytes of `src` into a sink started at `dest`, without
    /// header, terminator or progress.
    pub fn transfer_file(&self, src: &Path, dest: &Path, user: &str, host: &str) -> Result<()> {
        let source = Source::open(src)?;
        let payload = Payload::new(source, Framing::Raw, self.settings.chunk_size);

        let connection = self.connect(user, host)?;
        let mut session = Self::open_session(&connection, Phase::Transfer)?;
        let mut stderr = self.console.stderr();

        let bytes = send_to_sink(&mut *session, dest, payload, &mut stderr)?;
        debug!(bytes, file = %src.display(), "Raw transfer complete");

        Ok(())
    }
}
