//! Container runtime client.
//!
//! A thin async wrapper over the `docker` CLI. Every call shells out with
//! [`tokio::process::Command`]; a non-zero exit status becomes an error
//! carrying the captured stderr, which is all the context the manager needs
//! to wrap into its own messages.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("docker exited with {}: {}", .0.status, .0.stderr.trim())]
    NonZero(Output),
    #[error("unexpected docker output: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Captured output of one docker invocation.
#[derive(Debug, Clone)]
pub struct Output {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl From<std::process::Output> for Output {
    fn from(value: std::process::Output) -> Self {
        Self {
            status: value.status,
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

/// Run `docker <args...>`, capturing output and failing on non-zero status.
pub async fn run<I, S>(args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut cmd = tokio::process::Command::new("docker");
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

    tracing::debug!(?cmd, "running docker command");

    let output: Output = cmd.spawn()?.wait_with_output().await?.into();

    if !output.status.success() {
        tracing::debug!(?output.stderr, ?output.status, "docker returned non-zero status");
        return Err(Error::NonZero(output));
    }

    Ok(output)
}

/// Create a container without starting it. Returns the container id.
///
/// Containers get no network from docker (the daemon wires every interface
/// itself) and run privileged so sysctls and qdiscs work inside.
pub async fn create(
    image: &str,
    name: &str,
    hostname: &str,
    volumes: &[String],
    env: &[String],
) -> Result<String> {
    let mut args: Vec<String> = vec![
        "create".into(),
        "--privileged".into(),
        "--network".into(),
        "none".into(),
        "--name".into(),
        name.into(),
        "--hostname".into(),
        hostname.into(),
    ];
    for volume in volumes {
        args.push("--volume".into());
        args.push(volume.clone());
    }
    for var in env {
        args.push("--env".into());
        args.push(var.clone());
    }
    args.push(image.into());

    let output = run(args).await?;
    let id = output.stdout.trim().to_string();
    if id.is_empty() {
        return Err(Error::Unexpected("create printed no container id".into()));
    }
    Ok(id)
}

pub async fn start(name: &str) -> Result<()> {
    run(["start", name]).await.map(|_| ())
}

pub async fn stop(name: &str) -> Result<()> {
    run(["stop", name]).await.map(|_| ())
}

/// Force-remove a container, running or not.
pub async fn remove(name: &str) -> Result<()> {
    run(["rm", "--force", name]).await.map(|_| ())
}

/// Run a command inside a running container.
pub async fn exec<I, S>(name: &str, cmd: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut args: Vec<std::ffi::OsString> = vec!["exec".into(), name.into()];
    args.extend(cmd.into_iter().map(|s| s.as_ref().to_owned()));
    run(args).await
}

/// Copy a local file or directory into a container.
pub async fn cp_to(local: &Path, name: &str, container_path: &str) -> Result<()> {
    let src = local.display().to_string();
    let dest = format!("{name}:{container_path}");
    run(["cp", src.as_str(), dest.as_str()]).await.map(|_| ())
}

/// Copy a file or directory out of a container.
pub async fn cp_from(name: &str, container_path: &str, local: &Path) -> Result<()> {
    let src = format!("{name}:{container_path}");
    let dest = local.display().to_string();
    run(["cp", src.as_str(), dest.as_str()]).await.map(|_| ())
}

/// Pid of a running container's init process, for namespace access.
pub async fn pid(name: &str) -> Result<u32> {
    let output = run(["inspect", "--format", "{{.State.Pid}}", name]).await?;
    let text = output.stdout.trim();
    text.parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| Error::Unexpected(format!("container {name} has no pid ({text})")))
}
