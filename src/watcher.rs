//! Config watcher: merges registry streams into table publications.
//!
//! Two snapshot streams (service-derived routes and manual overrides) are
//! combined, diffed against the previous text, parsed, and published as
//! the next routing table. Manual commands are appended after service
//! commands, so they see and override their effect. A failing parse keeps
//! the previous table serving.

use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::noroute;
use crate::parser;
use crate::registry::Backend;
use crate::table::{Table, TableHandle};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Runs the merge loop until both input streams close.
///
/// `first` fires exactly once, after the first successful publication;
/// listener startup blocks on it.
pub async fn watch_backend(
    cfg: Arc<ProxyConfig>,
    backend: Arc<dyn Backend>,
    table: Arc<TableHandle>,
    mut svc: mpsc::Receiver<String>,
    mut man: mpsc::Receiver<String>,
    first: oneshot::Sender<()>,
) {
    let mut svccfg = String::new();
    let mut mancfg = String::new();
    let mut last = String::new();
    let mut version: i64 = 0;
    let mut first = Some(first);
    let mut man_open = true;

    loop {
        tokio::select! {
            msg = svc.recv() => match msg {
                Some(v) => svccfg = v,
                None => break,
            },
            msg = man.recv(), if man_open => match msg {
                Some(v) => mancfg = v,
                None => {
                    man_open = false;
                    continue;
                }
            },
        }

        // Manual config overrides service config because its commands are
        // applied later.
        let next = format!("{}\n{}", svccfg, mancfg);
        if next == last {
            continue;
        }

        let cmds = match parser::parse(&next) {
            Ok(cmds) => cmds,
            Err(e) => {
                warn!(error = %e, "ignoring config update");
                continue;
            }
        };

        let aliases: Vec<String> = cmds
            .iter()
            .filter_map(|c| match c {
                parser::RouteCmd::Alias { alias, .. } => Some(alias.clone()),
                _ => None,
            })
            .collect();
        if let Err(e) = backend.register(&aliases) {
            warn!(error = %e, "alias registration failed");
        }

        let t = match Table::from_commands(&cmds) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "ignoring config update");
                continue;
            }
        };

        log_routes(&t, &last, &next, &cfg.routes_format);
        table.store(t);
        version += 1;
        Metrics::set_table_version(version);
        last = next;

        if let Some(tx) = first.take() {
            let _ = tx.send(());
        }
    }
    info!("config watcher stopped");
}

/// Runs the no-route HTML watcher: set-if-changed on the process cell.
pub async fn watch_noroute_html(mut html: mpsc::Receiver<String>) {
    while let Some(next) = html.recv().await {
        if next == *noroute::html() {
            continue;
        }
        if next.is_empty() {
            info!("unset noroute HTML");
        } else {
            info!(bytes = next.len(), "set noroute HTML");
        }
        noroute::set_html(next);
    }
}

/// Logs a table update in the configured format.
fn log_routes(table: &Table, last: &str, next: &str, format: &str) {
    match format {
        "detail" => info!("updated config to\n{}", table.dump()),
        "all" => info!("updated config to\n{}", next),
        "delta" => {
            let delta = line_diff(last, next);
            if !delta.is_empty() {
                info!("config updates\n{}", delta);
            }
        }
        other => {
            warn!(format = %other, "invalid route format, defaulting to \"delta\"");
            log_routes(table, last, next, "delta");
        }
    }
}

/// Line-based diff: removed lines prefixed `-`, added lines prefixed `+`.
fn line_diff(last: &str, next: &str) -> String {
    let old: HashSet<&str> = last.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let new: HashSet<&str> = next.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    let mut out = Vec::new();
    for line in last.lines().map(str::trim) {
        if !line.is_empty() && !new.contains(line) {
            out.push(format!("- {}", line));
        }
    }
    for line in next.lines().map(str::trim) {
        if !line.is_empty() && !old.contains(line) {
            out.push(format!("+ {}", line));
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::registry::StaticBackend;
    use std::time::Duration;

    fn spawn_watcher(
        table: Arc<TableHandle>,
    ) -> (
        mpsc::Sender<String>,
        mpsc::Sender<String>,
        oneshot::Receiver<()>,
    ) {
        let cfg = Arc::new(ProxyConfig::default());
        let backend = Arc::new(StaticBackend::new(&RegistryConfig::default()));
        let (svc_tx, svc_rx) = mpsc::channel(4);
        let (man_tx, man_rx) = mpsc::channel(4);
        let (first_tx, first_rx) = oneshot::channel();
        tokio::spawn(watch_backend(
            cfg,
            backend,
            table,
            svc_rx,
            man_rx,
            first_tx,
        ));
        (svc_tx, man_tx, first_rx)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_first_publication_signals_ready() {
        let table = Arc::new(TableHandle::new());
        let (svc, _man, first) = spawn_watcher(Arc::clone(&table));

        svc.send("route add a example.com/ http://10.0.0.1:80/".to_string())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), first)
            .await
            .expect("first-table signal")
            .unwrap();
        assert_eq!(table.load().route_count(), 1);
    }

    #[tokio::test]
    async fn test_manual_overrides_service() {
        let table = Arc::new(TableHandle::new());
        let (svc, man, _first) = spawn_watcher(Arc::clone(&table));

        svc.send("route add a example.com/ http://10.0.0.1:80/".to_string())
            .await
            .unwrap();
        man.send(
            "route del a\nroute add b example.com/ http://10.0.0.2:80/".to_string(),
        )
        .await
        .unwrap();
        settle().await;

        let t = table.load();
        let target = t
            .lookup_host("example.com", crate::config::Strategy::RoundRobin)
            .unwrap();
        assert_eq!(target.service, "b");
    }

    #[tokio::test]
    async fn test_identical_update_not_republished() {
        let table = Arc::new(TableHandle::new());
        let (svc, _man, _first) = spawn_watcher(Arc::clone(&table));

        svc.send("route add a example.com/ http://10.0.0.1:80/".to_string())
            .await
            .unwrap();
        settle().await;
        let before = table.load();

        svc.send("route add a example.com/ http://10.0.0.1:80/".to_string())
            .await
            .unwrap();
        settle().await;
        let after = table.load();

        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_parse_failure_keeps_previous_table() {
        let table = Arc::new(TableHandle::new());
        let (svc, _man, _first) = spawn_watcher(Arc::clone(&table));

        svc.send("route add a example.com/ http://10.0.0.1:80/".to_string())
            .await
            .unwrap();
        settle().await;
        assert_eq!(table.load().route_count(), 1);

        svc.send("this is not a route command".to_string())
            .await
            .unwrap();
        settle().await;
        assert_eq!(table.load().route_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_update_replaces_table() {
        let table = Arc::new(TableHandle::new());
        let (svc, _man, _first) = spawn_watcher(Arc::clone(&table));

        svc.send("route add a example.com/ http://10.0.0.1:80/".to_string())
            .await
            .unwrap();
        settle().await;
        assert_eq!(table.load().route_count(), 1);

        svc.send(String::new()).await.unwrap();
        settle().await;
        assert!(table.load().is_empty());
    }

    #[tokio::test]
    async fn test_noroute_watcher_sets_cell() {
        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(watch_noroute_html(rx));
        tx.send("<h1>gone</h1>".to_string()).await.unwrap();
        settle().await;
        assert_eq!(*noroute::html(), "<h1>gone</h1>");
        noroute::set_html(String::new());
    }

    #[test]
    fn test_line_diff() {
        let last = "route add a x/ http://1/\nroute add b y/ http://2/";
        let next = "route add a x/ http://1/\nroute add c z/ http://3/";
        let diff = line_diff(last, next);
        assert!(diff.contains("- route add b"));
        assert!(diff.contains("+ route add c"));
        assert!(!diff.contains("route add a x/ http://1/\n+"));
    }
}
