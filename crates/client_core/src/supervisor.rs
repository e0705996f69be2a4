use std::{path::PathBuf, process::Stdio, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
};
use tracing::{debug, info, warn};

use crate::config::ControllerSettings;

const TERMINATE_WAIT: Duration = Duration::from_secs(2);

/// Everything the backend needs to come up on an allocated port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub entrypoint: PathBuf,
    pub args: Vec<String>,
    pub port: u16,
    pub debug: bool,
    pub open_browser: bool,
}

impl LaunchSpec {
    pub fn from_settings(settings: &ControllerSettings, port: u16) -> Self {
        Self {
            entrypoint: settings.backend_entrypoint.clone(),
            args: settings.backend_args.clone(),
            port,
            debug: settings.debug,
            open_browser: settings.open_browser,
        }
    }

    /// Environment handed to the backend process.
    pub fn env(&self) -> [(&'static str, String); 3] {
        [
            ("PORT", self.port.to_string()),
            ("DEBUG", self.debug.to_string()),
            ("OPEN_BROWSER", self.open_browser.to_string()),
        ]
    }
}

#[async_trait]
pub trait BackendProcess: Send {
    fn id(&self) -> Option<u32>;
    /// Best-effort shutdown; the process may outlive this call.
    async fn terminate(&mut self) -> Result<()>;
}

#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn BackendProcess>>;
}

/// Spawns the backend as a child process and forwards its output to tracing.
pub struct ProcessLauncher;

#[async_trait]
impl BackendLauncher for ProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn BackendProcess>> {
        let mut cmd = Command::new(&spec.entrypoint);
        cmd.args(&spec.args)
            .envs(spec.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn backend entrypoint '{}'",
                spec.entrypoint.display()
            )
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        info!(
            pid = child.id(),
            port = spec.port,
            entrypoint = %spec.entrypoint.display(),
            "supervisor: backend process started"
        );
        Ok(Box::new(ChildProcess { child }))
    }
}

fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(target: "backend", stream, "{line}"),
                Ok(None) => break,
                Err(error) => {
                    debug!(stream, %error, "supervisor: backend output closed");
                    break;
                }
            }
        }
    });
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl BackendProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self) -> Result<()> {
        if let Some(status) = self.child.try_wait()? {
            debug!(%status, "supervisor: backend already exited");
            return Ok(());
        }
        self.child
            .start_kill()
            .context("failed to signal backend process")?;
        match tokio::time::timeout(TERMINATE_WAIT, self.child.wait()).await {
            Ok(status) => {
                let status = status.context("failed to reap backend process")?;
                info!(%status, "supervisor: backend process stopped");
            }
            Err(_) => warn!(
                wait_ms = TERMINATE_WAIT.as_millis() as u64,
                "supervisor: backend did not exit in time; leaving it to the OS"
            ),
        }
        Ok(())
    }
}
