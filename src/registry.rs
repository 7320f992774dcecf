//! Registry backends supplying route commands to the config watcher.
//!
//! A backend exposes three asynchronous streams (service-derived routes,
//! manual overrides, no-route HTML) and accepts alias registrations back.
//! The streams deliver full text snapshots; the watcher merges and diffs
//! them. Richer backends (service catalogs, push sources) implement the
//! same trait out of tree.

use crate::config::RegistryConfig;
use crate::error::{ProxyError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Channel depth for watch streams. Snapshots supersede each other, so a
/// short buffer is enough.
const WATCH_BUFFER: usize = 4;

/// A source of route configuration.
pub trait Backend: Send + Sync {
    /// Stream of service-derived route command snapshots.
    fn watch_services(&self) -> mpsc::Receiver<String>;

    /// Stream of manual override snapshots. Manual commands are applied
    /// after service commands and take precedence.
    fn watch_manual(&self) -> mpsc::Receiver<String>;

    /// Stream of no-route HTML snapshots.
    fn watch_noroute_html(&self) -> mpsc::Receiver<String>;

    /// Announces discovered host aliases back to the registry.
    fn register(&self, aliases: &[String]) -> Result<()>;

    /// Removes all registrations on shutdown.
    fn deregister_all(&self);
}

/// Constructs the backend named in the registry config.
pub fn new_backend(cfg: &RegistryConfig) -> Result<Arc<dyn Backend>> {
    match cfg.backend.as_str() {
        "static" => Ok(Arc::new(StaticBackend::new(cfg))),
        "file" => Ok(Arc::new(FileBackend::new(cfg))),
        other => Err(ProxyError::Registry(format!(
            "unknown registry backend {:?}",
            other
        ))),
    }
}

/// Backend that pushes a fixed route string once at startup.
pub struct StaticBackend {
    routes: String,
    noroute_html: String,
    // Senders stay alive so the streams remain open after the single push.
    senders: Mutex<Vec<mpsc::Sender<String>>>,
}

impl StaticBackend {
    pub fn new(cfg: &RegistryConfig) -> Self {
        Self {
            routes: cfg.static_routes.clone(),
            noroute_html: cfg.static_noroute_html.clone(),
            senders: Mutex::new(Vec::new()),
        }
    }

    fn push_once(&self, value: String) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let _ = tx.try_send(value);
        self.senders.lock().push(tx);
        rx
    }
}

impl Backend for StaticBackend {
    fn watch_services(&self) -> mpsc::Receiver<String> {
        self.push_once(self.routes.clone())
    }

    fn watch_manual(&self) -> mpsc::Receiver<String> {
        self.push_once(String::new())
    }

    fn watch_noroute_html(&self) -> mpsc::Receiver<String> {
        self.push_once(self.noroute_html.clone())
    }

    fn register(&self, aliases: &[String]) -> Result<()> {
        if !aliases.is_empty() {
            debug!(?aliases, "static registry ignores alias registration");
        }
        Ok(())
    }

    fn deregister_all(&self) {}
}

/// Backend that reads route commands from a file and re-reads it on a
/// poll interval. A zero interval reads once.
pub struct FileBackend {
    path: String,
    noroute_path: String,
    poll: std::time::Duration,
}

impl FileBackend {
    pub fn new(cfg: &RegistryConfig) -> Self {
        Self {
            path: cfg.file_path.clone(),
            noroute_path: cfg.noroute_html_path.clone(),
            poll: cfg.poll,
        }
    }

    fn watch_file(&self, path: String) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let poll = self.poll;
        tokio::spawn(async move {
            let mut last: Option<String> = None;
            loop {
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => {
                        if last.as_deref() != Some(content.as_str()) {
                            if tx.send(content.clone()).await.is_err() {
                                return;
                            }
                            last = Some(content);
                        }
                    }
                    Err(e) => warn!(path = %path, error = %e, "cannot read routes file"),
                }
                if poll.is_zero() {
                    // Keep the sender alive so the stream stays open.
                    std::future::pending::<()>().await;
                }
                tokio::time::sleep(poll).await;
            }
        });
        rx
    }
}

impl Backend for FileBackend {
    fn watch_services(&self) -> mpsc::Receiver<String> {
        info!(path = %self.path, poll = ?self.poll, "watching routes file");
        self.watch_file(self.path.clone())
    }

    fn watch_manual(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let _ = tx.try_send(String::new());
        tokio::spawn(async move {
            tx.closed().await;
        });
        rx
    }

    fn watch_noroute_html(&self) -> mpsc::Receiver<String> {
        if self.noroute_path.is_empty() {
            let (tx, rx) = mpsc::channel(WATCH_BUFFER);
            let _ = tx.try_send(String::new());
            tokio::spawn(async move {
                tx.closed().await;
            });
            return rx;
        }
        self.watch_file(self.noroute_path.clone())
    }

    fn register(&self, aliases: &[String]) -> Result<()> {
        if !aliases.is_empty() {
            debug!(?aliases, "file registry ignores alias registration");
        }
        Ok(())
    }

    fn deregister_all(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_cfg(routes: &str) -> RegistryConfig {
        RegistryConfig {
            backend: "static".to_string(),
            static_routes: routes.to_string(),
            ..RegistryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_static_backend_pushes_once() {
        let backend = StaticBackend::new(&static_cfg("route add a b/ http://c/"));
        let mut rx = backend.watch_services();
        assert_eq!(rx.recv().await.unwrap(), "route add a b/ http://c/");
        // No second value, but the stream stays open.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_backend_rejected() {
        let cfg = RegistryConfig {
            backend: "consul".to_string(),
            ..RegistryConfig::default()
        };
        assert!(new_backend(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_file_backend_emits_changes() {
        let dir = std::env::temp_dir().join("routegate-registry-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("routes.txt");
        std::fs::write(&path, "route add a b/ http://c/\n").unwrap();

        let cfg = RegistryConfig {
            backend: "file".to_string(),
            file_path: path.to_string_lossy().into_owned(),
            poll: std::time::Duration::from_millis(20),
            ..RegistryConfig::default()
        };
        let backend = FileBackend::new(&cfg);
        let mut rx = backend.watch_services();

        let first = rx.recv().await.unwrap();
        assert!(first.contains("route add a"));

        std::fs::write(&path, "route add x y/ http://z/\n").unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("file change not observed")
            .unwrap();
        assert!(second.contains("route add x"));
    }
}
