//! Resolution of a host alias against the user's SSH config file.
//!
//! Only `Host`, `HostName`, `User`, `Port` and `IdentityFile` are understood.
//! A `Host` line opens a block that applies when one of its patterns is the
//! alias itself or `*`. Within each kind of block the last value wins, and
//! values from alias blocks take precedence over `Host *` values.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

use tracing::debug;

use super::Environment;
use crate::{
    error::{Error, Result},
    util::expand_tilde,
};

pub const DEFAULT_PORT: &str = "22";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostProfile {
    pub host_name: Option<String>,
    pub user: Option<String>,
    pub port: Option<String>,
    pub identity_file: Option<PathBuf>,
}

impl HostProfile {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn port_or_default(&self) -> &str {
        self.port.as_deref().unwrap_or(DEFAULT_PORT)
    }

    /// Fields set in `other` replace ours
    fn overlay(mut self, other: HostProfile) -> Self {
        self.host_name = other.host_name.or(self.host_name);
        self.user = other.user.or(self.user);
        self.port = other.port.or(self.port);
        self.identity_file = other.identity_file.or(self.identity_file);
        self
    }
}

/// Resolves `alias` against the config file at `path`. A missing file is not
/// an error and yields an empty profile.
pub fn resolve(alias: &str, path: &Path, env: &Environment) -> Result<HostProfile> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No SSH config, using the alias as given");
            return Ok(HostProfile::default());
        }
        Err(source) => {
            return Err(Error::ConfigRead {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let profile = parse(alias, BufReader::new(file), env).map_err(|source| Error::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(alias, ?profile, "Resolved host profile");
    Ok(profile)
}

pub fn parse(alias: &str, reader: impl BufRead, env: &Environment) -> io::Result<HostProfile> {
    #[derive(Clone, Copy, PartialEq)]
    enum Scope {
        Inactive,
        Wildcard,
        Alias,
    }

    let mut wildcard = HostProfile::default();
    let mut specific = HostProfile::default();
    let mut scope = Scope::Inactive;

    // Split on raw bytes: stray non-UTF-8 bytes must not fail the scan
    for line in reader.split(b'\n') {
        let line = line?;
        let line = String::from_utf8_lossy(&line);
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((keyword, value)) = split_directive(line) else {
            continue;
        };

        if keyword.eq_ignore_ascii_case("host") {
            let patterns: Vec<_> = value.split_whitespace().collect();
            scope = if patterns.contains(&alias) {
                Scope::Alias
            } else if patterns.contains(&"*") {
                Scope::Wildcard
            } else {
                Scope::Inactive
            };
            continue;
        }

        let profile = match scope {
            Scope::Inactive => continue,
            Scope::Wildcard => &mut wildcard,
            Scope::Alias => &mut specific,
        };

        match keyword.to_ascii_lowercase().as_str() {
            "hostname" => profile.host_name = Some(value),
            "user" => profile.user = Some(value),
            "port" => profile.port = Some(value),
            "identityfile" => {
                profile.identity_file = Some(expand_tilde(&value, env.home.as_deref()))
            }
            _ => {}
        }
    }

    Ok(wildcard.overlay(specific))
}

/// Splits `Keyword value...` into the keyword and the rest of the line
fn split_directive(line: &str) -> Option<(&str, String)> {
    let mut fields = line.split_whitespace();
    let keyword = fields.next()?;
    let value = fields.collect::<Vec<_>>().join(" ");

    if value.is_empty() {
        return None;
    }

    Some((keyword, value))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn env() -> Environment {
        Environment::with_home("/home/ops")
    }

    fn parse_str(alias: &str, config: &str) -> HostProfile {
        parse(alias, config.as_bytes(), &env()).unwrap()
    }

    #[test]
    fn alias_block_and_wildcard_are_merged() {
        let config = "Host deploy\n HostName 10.0.0.5\n User ops\n\nHost *\n Port 2200\n";
        let profile = parse_str("deploy", config);

        assert_eq!(profile.host_name.as_deref(), Some("10.0.0.5"));
        assert_eq!(profile.user.as_deref(), Some("ops"));
        assert_eq!(profile.port.as_deref(), Some("2200"));
        assert_eq!(profile.identity_file, None);
    }

    #[test]
    fn alias_value_wins_over_wildcard_in_either_order() {
        let alias_first = "Host deploy\n User ops\nHost *\n User nobody\n";
        let wildcard_first = "Host *\n User nobody\nHost deploy\n User ops\n";

        assert_eq!(parse_str("deploy", alias_first).user.as_deref(), Some("ops"));
        assert_eq!(parse_str("deploy", wildcard_first).user.as_deref(), Some("ops"));
        assert_eq!(parse_str("other", alias_first).user.as_deref(), Some("nobody"));
    }

    #[test]
    fn later_blocks_overwrite_earlier_ones() {
        let config = "Host deploy\n Port 2200\nHost deploy\n Port 2222\n";
        assert_eq!(parse_str("deploy", config).port.as_deref(), Some("2222"));
    }

    #[test]
    fn keywords_are_case_insensitive_and_comments_skipped() {
        let config = "# personal hosts\nhost deploy\n  HOSTNAME example.org\n  # User root\n  user ops\n";
        let profile = parse_str("deploy", config);

        assert_eq!(profile.host_name.as_deref(), Some("example.org"));
        assert_eq!(profile.user.as_deref(), Some("ops"));
    }

    #[test]
    fn non_utf8_bytes_do_not_abort_resolution() {
        let config: &[u8] = b"# caf\xe9 hosts\r\nHost deploy\r\n HostName 10.0.0.5\n User \xffops\n";
        let profile = parse("deploy", config, &env()).unwrap();

        assert_eq!(profile.host_name.as_deref(), Some("10.0.0.5"));
        assert_eq!(profile.user.as_deref(), Some("\u{fffd}ops"));
    }

    #[test]
    fn other_hosts_are_ignored() {
        let config = "Host staging\n HostName 10.0.0.9\n";
        let profile = parse_str("deploy", config);

        assert!(profile.is_empty());
        assert_eq!(profile.port_or_default(), "22");
    }

    #[test]
    fn host_lines_may_list_several_patterns() {
        let config = "Host staging deploy\n HostName 10.0.0.9\n";
        assert_eq!(
            parse_str("deploy", config).host_name.as_deref(),
            Some("10.0.0.9")
        );
    }

    #[test]
    fn identity_file_expands_home() {
        let config = "Host deploy\n IdentityFile ~/.ssh/deploy_key\n";
        assert_eq!(
            parse_str("deploy", config).identity_file,
            Some(PathBuf::from("/home/ops/.ssh/deploy_key"))
        );
    }

    #[test]
    fn missing_file_gives_empty_profile() {
        let dir = tempfile::tempdir().unwrap();
        let profile = resolve("deploy", &dir.path().join("config"), &env()).unwrap();
        assert!(profile.is_empty());
    }

    #[test]
    fn unreadable_file_is_a_config_error() {
        // A directory opens on unix but fails on the first read
        let dir = tempfile::tempdir().unwrap();
        let err = resolve("deploy", dir.path(), &env()).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }

    #[test]
    fn resolves_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "Host deploy\n HostName 10.0.0.5\n User ops\nHost *\n Port 2200\n").unwrap();

        let profile = resolve("deploy", file.path(), &env()).unwrap();
        assert_eq!(profile.host_name.as_deref(), Some("10.0.0.5"));
        assert_eq!(profile.user.as_deref(), Some("ops"));
        assert_eq!(profile.port_or_default(), "2200");
    }
}
