//! Dev server management - spawning, health checking and stopping

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ServerSettings;
use crate::error::{SandboxError, SandboxResult};

/// A running dev server owned by one sandbox.
#[async_trait]
pub trait ServerProcess: Send + Sync {
    fn port(&self) -> u16;

    /// Stop the process and wait for it to exit.
    async fn terminate(&mut self) -> SandboxResult<()>;
}

/// Dev server started from [`ServerSettings::command`].
pub struct DevServer {
    child: Child,
    port: u16,
    shutdown_grace: Duration,
}

impl DevServer {
    /// Spawn the dev server in `root` and wait until it answers HTTP.
    pub async fn spawn(settings: &ServerSettings, root: &Path, port: u16) -> SandboxResult<Self> {
        let base_url = format!("http://localhost:{}", port);
        let args = settings.resolved_args(port, root);

        info!(port, command = %settings.command, "Spawning dev server");

        let mut cmd = Command::new(&settings.command);
        cmd.args(&args)
            .current_dir(root)
            .env("PORT", port.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::ServerStartup(format!("failed to spawn {}: {}", settings.command, e))
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, port));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, port));
        }

        let mut server = DevServer {
            child,
            port,
            shutdown_grace: settings.shutdown_grace(),
        };

        let health_url = format!("{}{}", base_url, settings.health_path);
        if let Err(e) = server.wait_for_healthy(&health_url, settings.startup_timeout()).await {
            let _ = server.terminate().await;
            return Err(e);
        }

        info!("Dev server is healthy at {}", base_url);
        Ok(server)
    }

    /// Poll until the server responds successfully.
    async fn wait_for_healthy(&mut self, url: &str, timeout_duration: Duration) -> SandboxResult<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = std::time::Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout_duration {
            attempts += 1;

            if let Some(status) = self.child.try_wait()? {
                return Err(SandboxError::ServerStartup(format!(
                    "dev server exited early with {}",
                    status
                )));
            }

            match client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    debug!("Health check returned {}", resp.status());
                }
                Err(e) => {
                    // Connection refused is expected while the server boots
                    if !e.is_connect() {
                        warn!("Health check error: {}", e);
                    }
                }
            }

            sleep(Duration::from_millis(100)).await;
        }

        Err(SandboxError::ServerHealthCheck(attempts))
    }
}

#[async_trait]
impl ServerProcess for DevServer {
    fn port(&self) -> u16 {
        self.port
    }

    async fn terminate(&mut self) -> SandboxResult<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        info!(port = self.port, pid = ?self.child.id(), "Stopping dev server");

        // Graceful shutdown first
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id() {
                if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                    && tokio::time::timeout(self.shutdown_grace, self.child.wait())
                        .await
                        .is_ok()
                {
                    return Ok(());
                }
            }
        }

        self.child.kill().await?;
        Ok(())
    }
}

async fn forward_output<R>(stream: R, port: u16)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "dev_server", port, "{}", line);
    }
}

/// Find a free port to use
pub fn find_free_port() -> SandboxResult<u16> {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
