//! Local query service on a Unix domain stream socket.
//!
//! - creates an owner-only directory for the socket
//! - refuses to start if another instance answers on the socket
//! - accepts up to `max_clients` connections and answers line requests
//! - removes the socket and its directory on shutdown

mod buffer;
mod connection;
mod error;
mod protocol;

pub use connection::{Connection, ConnectionManager, Readiness};
pub use error::QueryError;

use connection::{ReadOutcome, WriteOutcome};

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::tracker::SafetyTracker;

/// Pending connections the OS may queue while every slot is taken.
const CONNECTION_BACKLOG: libc::c_int = 1;

/// Listener plus the connections it has accepted.
pub struct QueryServer {
    listener: UnixListener,
    connections: ConnectionManager,
    socket_dir: PathBuf,
    socket_path: PathBuf,
    closed: bool,
}

impl QueryServer {
    /// Create the socket directory and start listening.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: &ServiceConfig) -> Result<Self, QueryError> {
        let socket_dir = config.socket_dir();
        let socket_path = config.socket_path();

        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&socket_dir)
            .map_err(|source| QueryError::SocketDir {
                path: socket_dir.clone(),
                source,
            })?;

        remove_stale_socket(&socket_path)?;

        let bind_err = |source| QueryError::Bind {
            path: socket_path.clone(),
            source,
        };
        let std_listener = StdUnixListener::bind(&socket_path).map_err(bind_err)?;
        std_listener.set_nonblocking(true).map_err(bind_err)?;
        shrink_backlog(&std_listener);

        let listener = UnixListener::from_std(std_listener).map_err(QueryError::Register)?;

        info!(
            "Query service listening on {:?} (max {} clients)",
            socket_path, config.max_clients
        );

        Ok(Self {
            listener,
            connections: ConnectionManager::new(config.max_clients, config.buffer_capacity),
            socket_dir,
            socket_path,
            closed: false,
        })
    }

    #[cfg(test)]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    #[cfg(test)]
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    #[cfg(test)]
    pub fn connections_mut(&mut self) -> &mut ConnectionManager {
        &mut self.connections
    }

    /// Wait up to `timeout` for new connections or connection readiness.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Readiness {
        self.connections
            .poll_readiness(Some(&self.listener), timeout)
            .await
    }

    /// Run one read / handle / write pass over the ready connections.
    pub fn service(&mut self, readiness: &Readiness, tracker: &SafetyTracker) {
        for &id in &readiness.readable {
            if let ReadOutcome::Received(n) = self.connections.read_available(id) {
                debug!("read {} bytes from client {}", n, id);
            }
        }

        for id in self.connections.ids() {
            let pending = self
                .connections
                .get(id)
                .is_some_and(Connection::has_message);
            if pending {
                self.connections.handle_messages(id, tracker);
            }
        }

        for &id in &readiness.writable {
            if let WriteOutcome::Partial(queued) = self.connections.write_pending(id) {
                debug!("client {} has {} bytes still queued", id, queued);
            }
        }
    }

    /// Drop every client and remove the socket and its directory.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if !self.connections.is_empty() {
            debug!("Closing {} client connections", self.connections.len());
        }
        self.connections.close_all();

        if let Err(e) = fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove socket {:?}: {}", self.socket_path, e);
            }
        }
        if let Err(e) = fs::remove_dir(&self.socket_dir) {
            warn!("Failed to delete folder {:?}: {}", self.socket_dir, e);
        }

        info!("Query service stopped");
    }
}

impl Drop for QueryServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Remove a socket file left behind by a dead process, refusing if a live
/// instance still answers on it.
fn remove_stale_socket(path: &Path) -> Result<(), QueryError> {
    if !path.exists() {
        return Ok(());
    }

    if StdUnixStream::connect(path).is_ok() {
        return Err(QueryError::AlreadyRunning(path.to_path_buf()));
    }

    debug!("Removing stale socket {:?}", path);
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(QueryError::StaleSocket {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Re-issue listen(2) so at most one connection waits beyond the slot table.
fn shrink_backlog(listener: &StdUnixListener) {
    // SAFETY: the fd is a bound, listening socket owned by `listener`.
    let rc = unsafe { libc::listen(listener.as_raw_fd(), CONNECTION_BACKLOG) };
    if rc == -1 {
        warn!(
            "Could not set listen backlog to {}: {}",
            CONNECTION_BACKLOG,
            io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackingWindow;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    const WAIT: Duration = Duration::from_secs(1);

    fn service_config(dir: &Path) -> ServiceConfig {
        ServiceConfig {
            socket_dir: Some(dir.join("norsi")),
            ..ServiceConfig::default()
        }
    }

    fn tracker() -> SafetyTracker {
        SafetyTracker::new(vec![
            TrackingWindow::new("micro", 180, 15, 30).unwrap(),
            TrackingWindow::new("normal", 2700, 0, 600).unwrap(),
            TrackingWindow::new("workday", 14400, 0, 28800).unwrap(),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_bind_creates_private_dir() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = service_config(temp_dir.path());

        let server = tokio_test::assert_ok!(QueryServer::bind(&config));
        assert_eq!(server.socket_path(), config.socket_path());
        assert!(server.socket_path().exists());

        let mode = fs::metadata(config.socket_dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_second_instance_refused() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = service_config(temp_dir.path());

        let _first = QueryServer::bind(&config).unwrap();
        let second = QueryServer::bind(&config);
        assert!(matches!(second, Err(QueryError::AlreadyRunning(_))));
    }

    #[tokio::test]
    async fn test_stale_socket_replaced() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = service_config(temp_dir.path());

        // A dropped listener leaves its socket file behind
        fs::create_dir_all(config.socket_dir()).unwrap();
        drop(StdUnixListener::bind(config.socket_path()).unwrap());
        assert!(config.socket_path().exists());

        tokio_test::assert_ok!(QueryServer::bind(&config));
    }

    #[tokio::test]
    async fn test_shutdown_removes_socket_and_dir() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = service_config(temp_dir.path());

        let mut server = QueryServer::bind(&config).unwrap();
        server.shutdown();
        server.shutdown();

        assert!(!config.socket_path().exists());
        assert!(!config.socket_dir().exists());
    }

    #[tokio::test]
    async fn test_status_round_trip_over_socket() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = service_config(temp_dir.path());
        let mut server = QueryServer::bind(&config).unwrap();
        let mut tracker = tracker();
        tracker.provide_active_seconds(200);

        let client = UnixStream::connect(server.socket_path()).await.unwrap();
        let (read_half, mut write_half) = client.into_split();
        write_half.write_all(b"status\n").await.unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let response = loop {
            let ready = server.wait_ready(Duration::from_millis(20)).await;
            server.service(&ready, &tracker);
            if let Ok(Ok(Some(line))) =
                tokio::time::timeout(Duration::from_millis(5), lines.next_line()).await
            {
                break line;
            }
        };

        let value: serde_json::Value = serde_json::from_str(&response).unwrap();
        let safe: Vec<bool> = value["periods"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["safe"].as_bool().unwrap())
            .collect();
        assert_eq!(safe, vec![false, true, true]);
        assert_eq!(value["periods"][2]["accumulated_seconds"], 200);
    }

    #[tokio::test]
    async fn test_reply_reaches_client_that_stopped_sending() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = service_config(temp_dir.path());
        let mut server = QueryServer::bind(&config).unwrap();
        let tracker = tracker();

        let mut client = UnixStream::connect(server.socket_path()).await.unwrap();
        client.write_all(b"status\n").await.unwrap();
        client.shutdown().await.unwrap();

        let mut accepted = false;
        for _ in 0..100 {
            let ready = server.wait_ready(Duration::from_millis(20)).await;
            accepted |= !ready.accepted.is_empty();
            server.service(&ready, &tracker);
            if accepted && server.connections().is_empty() {
                break;
            }
        }
        assert!(accepted);
        assert!(server.connections().is_empty());

        let mut response = String::new();
        tokio::time::timeout(WAIT, client.read_to_string(&mut response))
            .await
            .expect("connection left open")
            .unwrap();
        assert_eq!(response.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(response.trim_end()).unwrap();
        assert_eq!(value["periods"][0]["name"], "micro");
    }

    #[tokio::test]
    async fn test_seventeenth_client_waits_for_free_slot() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = service_config(temp_dir.path());
        let mut server = QueryServer::bind(&config).unwrap();

        let mut clients = Vec::new();
        for _ in 0..16 {
            clients.push(UnixStream::connect(server.socket_path()).await.unwrap());
            let ready = server.wait_ready(WAIT).await;
            assert_eq!(ready.accepted.len(), 1);
        }
        assert_eq!(server.connections().len(), 16);

        // Queued in the backlog, not refused
        let _pending = tokio_test::assert_ok!(UnixStream::connect(server.socket_path()).await);

        let ready = server.wait_ready(Duration::from_millis(50)).await;
        assert!(ready.accepted.is_empty());
        assert_eq!(server.connections().len(), 16);

        server.connections_mut().close_connection(3);
        let ready = server.wait_ready(WAIT).await;
        assert_eq!(ready.accepted, vec![3]);
        assert_eq!(server.connections().len(), 16);
    }
}
