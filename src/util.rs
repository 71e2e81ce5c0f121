use std::{
    io::{self, stdin, Write},
    path::{Path, PathBuf},
};

pub fn read_from_stdin(hidden: bool, prompt: &str) -> io::Result<String> {
    if hidden {
        rpassword::prompt_password(prompt)
    } else {
        print!("{}", prompt);
        io::stdout().flush()?;
        let mut read = String::new();
        stdin().read_line(&mut read)?;

        Ok(read.trim_end_matches(['\r', '\n']).to_owned())
    }
}

/// Expands a leading `~` to `home`. Paths are returned untouched when no home
/// is known.
pub fn expand_tilde(path: &str, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix('~'), home) {
        (Some(""), Some(home)) => home.to_path_buf(),
        (Some(rest), Some(home)) if rest.starts_with('/') => home.join(&rest[1..]),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_leading_tilde_only() {
        let home = Some(Path::new("/home/ops"));

        assert_eq!(expand_tilde("~/.ssh/id", home), PathBuf::from("/home/ops/.ssh/id"));
        assert_eq!(expand_tilde("~", home), PathBuf::from("/home/ops"));
        assert_eq!(expand_tilde("/keys/~id", home), PathBuf::from("/keys/~id"));
        assert_eq!(expand_tilde("~other/id", home), PathBuf::from("~other/id"));
        assert_eq!(expand_tilde("~/.ssh/id", None), PathBuf::from("~/.ssh/id"));
    }
}
