//! Socket transport for client-worker IPC.
//!
//! The worker binds the listening sockets; the client only decides where they
//! live and dials them once the worker reports READY.
//!
//! - **Configured paths**: used verbatim, never removed by the client
//! - **Generated paths**: `{temp_dir}/jsd_XXXX/jsd_{n}.sock`, removed when the
//!   owning generation tears down (or is dropped)

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::UnixStream;

/// Socket paths offered to one worker process.
#[derive(Debug)]
pub struct SocketSet {
    paths: Vec<PathBuf>,
    dir: Option<TempDir>,
}

impl SocketSet {
    /// Use an explicit list of socket paths.
    pub fn configured(paths: Vec<PathBuf>) -> Self {
        Self { paths, dir: None }
    }

    /// Create a fresh temporary directory holding `count` socket paths.
    ///
    /// The directory name is kept short because Unix socket paths are limited
    /// to around 100 bytes on most platforms.
    pub fn temporary(count: usize) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("jsd_").tempdir()?;
        let paths = (0..count)
            .map(|i| dir.path().join(format!("jsd_{i}.sock")))
            .collect();
        tracing::debug!(dir = %dir.path().display(), count, "Created socket directory");
        Ok(Self {
            paths,
            dir: Some(dir),
        })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Directory owned by this set, if the paths were generated.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    /// Remove the generated directory now, reporting failures.
    ///
    /// Dropping the set also removes it, silently.
    pub fn cleanup(&mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => {
                tracing::debug!(dir = %dir.path().display(), "Cleaning up socket directory");
                dir.close()
            }
            None => Ok(()),
        }
    }
}

impl Drop for SocketSet {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to cleanup socket directory");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("dial {}: {source}", path.display())]
    Connect { path: PathBuf, source: io::Error },
    #[error("dial {}: timed out after {timeout:?}", path.display())]
    Timeout { path: PathBuf, timeout: Duration },
}

/// Connect to one socket, giving up after `timeout`.
pub async fn dial(path: &Path, timeout: Duration) -> Result<UnixStream, DialError> {
    tracing::trace!(path = %path.display(), "Connecting to socket");
    match tokio::time::timeout(timeout, UnixStream::connect(path)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(DialError::Connect {
            path: path.to_path_buf(),
            source,
        }),
        Err(_) => Err(DialError::Timeout {
            path: path.to_path_buf(),
            timeout,
        }),
    }
}

/// Dial `paths` in order, each with the same timeout. Stops at the first failure.
pub async fn dial_all(paths: &[PathBuf], timeout: Duration) -> Result<Vec<UnixStream>, DialError> {
    let mut streams = Vec::with_capacity(paths.len());
    for (i, path) in paths.iter().enumerate() {
        streams.push(dial(path, timeout).await?);
        tracing::trace!(connection = i, "Connected");
    }
    Ok(streams)
}
