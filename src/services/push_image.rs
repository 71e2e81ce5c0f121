//! Ships a local Docker image to a remote host that does not have it yet:
//! export it to a tar archive, stream the archive over and `docker load` it
//! there.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use tokio::{process::Command, task::block_in_place};
use tracing::warn;

use crate::{adapter::ssh::Connector, progress::ProgressView, remote::Remote};

/// Must run on a multi-threaded runtime: remote operations block their worker
pub async fn push_image<C: Connector>(
    remote: &Remote<C>,
    image: &str,
    server: &str,
    skip_pull: bool,
) -> Result<()> {
    let (user, host) = split_server(server)?;

    println!("[CHECKING] Verifying if {image} exists on {server}...");
    let exists = image_exists(remote, image, user, host)
        .await
        .context("error checking remote image")?;

    if exists {
        println!("[SKIPPING] Image {image} already exists on {server} - no transfer needed");
        return Ok(());
    }
    println!("[PROCEEDING] Image {image} not found on {server} - proceeding with transfer");

    if !skip_pull {
        pull_local_image(image)
            .await
            .context("error pulling local image")?;
    }

    transfer_image(remote, image, user, host)
        .await
        .context("error transferring image")
}

/// Splits `user@host`
pub fn split_server(server: &str) -> Result<(&str, &str)> {
    match server.split('@').collect::<Vec<_>>()[..] {
        [user, host] if !user.is_empty() && !host.is_empty() => Ok((user, host)),
        _ => bail!("invalid remote server format '{server}', expected user@host"),
    }
}

pub fn archive_name(image: &str) -> String {
    format!("{}.tar", image.replace('/', "_"))
}

async fn image_exists<C: Connector>(
    remote: &Remote<C>,
    image: &str,
    user: &str,
    host: &str,
) -> Result<bool> {
    let command = format!("docker images -q {image}");
    let output = block_in_place(|| remote.run_command(&command, user, host))?;

    Ok(!output.trim().is_empty())
}

async fn pull_local_image(image: &str) -> Result<()> {
    let status = Command::new("docker")
        .args(["pull", image])
        .status()
        .await
        .context("failed to run docker pull")?;

    if !status.success() {
        bail!("docker pull {image} exited with {status}");
    }

    Ok(())
}

async fn save_image(image: &str, archive: &Path) -> Result<()> {
    let output = Command::new("docker")
        .args(["save", "-o"])
        .arg(archive)
        .arg(image)
        .output()
        .await
        .context("failed to run docker save")?;

    if !output.status.success() {
        bail!(
            "docker save exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(())
}

async fn transfer_image<C: Connector>(
    remote: &Remote<C>,
    image: &str,
    user: &str,
    host: &str,
) -> Result<()> {
    println!("[CONNECTING] Establishing connection to '{user}@{host}' ...");

    let name = archive_name(image);
    let archive: PathBuf = std::env::temp_dir().join(&name);
    println!("[PREPARING] Creating temporary archive at {}", archive.display());

    let result = async {
        ProgressView::with(
            format!("Exporting Docker image {image:?} to archive"),
            save_image(image, &archive),
        )
        .await?;

        let size = tokio::fs::metadata(&archive)
            .await
            .context("failed to get archive size")?
            .len();
        let size_mb = size as f64 / 1024.0 / 1024.0;
        println!("[STATUS] Archive size: {size_mb:.2} MB");
        println!("[TRANSFER] Starting transfer to {host} ({size_mb:.2} MB)");

        let remote_archive = remote.settings().destination_dir.join(&name);
        let command = format!("docker load -i {}", remote_archive.display());
        block_in_place(|| remote.copy_and_run(&archive, &command, user, host))?;

        println!("[SUCCESS] Image {image} successfully transferred and loaded on {host}");
        Ok::<_, anyhow::Error>(())
    }
    .await;

    println!("[CLEANUP] Removing temporary archive {}", archive.display());
    if let Err(err) = tokio::fs::remove_file(&archive).await {
        if err.kind() != ErrorKind::NotFound {
            warn!(archive = %archive.display(), %err, "Could not remove archive");
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        adapter::ssh::fake::{FakeRemote, Script},
        config::{Environment, Settings},
        progress::testing::BufferConsole,
    };

    #[test]
    fn splits_user_and_host() {
        assert_eq!(split_server("ops@10.0.0.5").unwrap(), ("ops", "10.0.0.5"));
        assert!(split_server("10.0.0.5").is_err());
        assert!(split_server("a@b@c").is_err());
        assert!(split_server("@host").is_err());
    }

    #[test]
    fn archive_names_flatten_repositories() {
        assert_eq!(archive_name("nginx"), "nginx.tar");
        assert_eq!(archive_name("library/nginx:1.25"), "library_nginx:1.25.tar");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn existing_image_is_not_transferred() {
        let home = tempfile::tempdir().unwrap();
        let fake = FakeRemote::default();
        fake.script(Script::exit(0).stdout("4f2a9c0e1b7d\n"));
        let remote = Remote::with_connector(
            fake.clone(),
            Settings::default(),
            Environment::with_home(home.path()),
        )
        .with_console(Arc::new(BufferConsole::default()));

        push_image(&remote, "nginx:latest", "ops@deploy", true)
            .await
            .unwrap();

        assert_eq!(fake.commands(), vec!["docker images -q nginx:latest"]);
    }

    #[tokio::test]
    async fn bad_server_fails_before_connecting() {
        let fake = FakeRemote::default();
        let remote =
            Remote::with_connector(fake.clone(), Settings::default(), Environment::default());

        assert!(push_image(&remote, "nginx", "deploy", true).await.is_err());
        assert!(fake.dials().is_empty());
    }
}
