use shared_child::SharedChild;
use std::os::fd::OwnedFd;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

/// Pipe to or from a plugin process.
pub type ChildStdio = tokio::fs::File;

/// Child is a plugin process which may be waited on and signaled from
/// multiple tasks. A Child which is dropped before it exits is sent SIGTERM.
pub struct Child {
    inner: Arc<SharedChild>,
}

/// Piped standard streams of a spawned Child.
pub struct Pipes {
    pub stdin: ChildStdio,
    pub stdout: ChildStdio,
    pub stderr: ChildStdio,
}

impl Child {
    /// Spawn `cmd` with piped stdin, stdout, and stderr.
    pub fn spawn(cmd: &mut Command) -> std::io::Result<(Self, Pipes)> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pipes = match (
            into_stdio(child.stdin.take()),
            into_stdio(child.stdout.take()),
            into_stdio(child.stderr.take()),
        ) {
            (Some(stdin), Some(stdout), Some(stderr)) => Pipes {
                stdin,
                stdout,
                stderr,
            },
            _ => {
                let _ = child.kill();
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "child process stdio is not piped",
                ));
            }
        };

        Ok((
            Self {
                inner: Arc::new(SharedChild::new(child)?),
            },
            pipes,
        ))
    }

    pub fn id(&self) -> u32 {
        self.inner.id()
    }

    /// Exit status of the process, if it has exited.
    pub fn try_wait(&self) -> std::io::Result<Option<ExitStatus>> {
        self.inner.try_wait()
    }

    /// Wait for the process to exit.
    pub fn wait(&self) -> impl std::future::Future<Output = std::io::Result<ExitStatus>> {
        let inner = self.inner.clone();
        let handle = tokio::task::spawn_blocking(move || inner.wait());

        async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(std::io::Error::new(std::io::ErrorKind::Other, err)),
            }
        }
    }

    /// Send SIGTERM and wait up to `grace` for the process to exit,
    /// after which it's sent SIGKILL.
    pub async fn terminate(&self, grace: Duration) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.try_wait()? {
            return Ok(status);
        }
        let pid = self.id();
        self.signal(libc::SIGTERM);

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(status) => status,
            Err(_elapsed) => {
                tracing::warn!(%pid, ?grace, "plugin process didn't exit after SIGTERM; killing it");
                self.inner.kill()?;
                self.wait().await
            }
        }
    }

    fn signal(&self, signal: libc::c_int) {
        use shared_child::unix::SharedChildExt;

        // send_signal() is Ok() if the child has already been waited on.
        if let Err(error) = self.inner.send_signal(signal) {
            tracing::error!(pid = %self.id(), %signal, ?error, "failed to signal plugin process");
        }
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if let Ok(Some(_status)) = self.inner.try_wait() {
            return; // Already exited.
        }
        self.signal(libc::SIGTERM);

        // Reap the process in the background, if we're within a runtime.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pid = self.id();
        let wait = self.wait();

        handle.spawn(async move {
            match tokio::time::timeout(Duration::from_secs(15), wait).await {
                Ok(Ok(status)) => tracing::debug!(%pid, %status, "dropped plugin process exited"),
                Ok(Err(error)) => {
                    tracing::error!(%pid, ?error, "failed to wait for dropped plugin process")
                }
                Err(_) => tracing::error!(%pid, "dropped plugin process is not exiting"),
            }
        });
    }
}

fn into_stdio<F: Into<OwnedFd>>(f: Option<F>) -> Option<ChildStdio> {
    f.map(|f| std::fs::File::from(f.into()).into())
}
