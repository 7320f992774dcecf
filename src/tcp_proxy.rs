//! L4 forwarders: raw TCP, TCP with SNI peek, and dynamic TCP.
//!
//! All three modes resolve a `tcp`-proto target from the current table,
//! dial it under the configured timeout, and splice both directions until
//! either side closes. The SNI mode reads the TLS ClientHello first and
//! replays the consumed bytes toward the backend.

use crate::config::{ProxyConfig, Strategy};
use crate::error::{ProxyError, Result};
use crate::metrics::Metrics;
use crate::sni::read_client_hello;
use crate::table::{TableHandle, Target};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Which lookup the adapter performs on accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpMode {
    /// Lookup by listener port host key (`:9000`).
    Direct,
    /// Peek the ClientHello and look up by SNI.
    Sni,
    /// Lookup by backend port; listeners are managed by the supervisor.
    Dynamic,
}

/// TCP forwarder shared by all connections of one listener.
#[derive(Clone)]
pub struct TcpProxy {
    mode: TcpMode,
    dial_timeout: Duration,
    strategy: Strategy,
    table: Arc<TableHandle>,
}

impl TcpProxy {
    pub fn new(mode: TcpMode, cfg: &ProxyConfig, table: Arc<TableHandle>) -> Self {
        Self {
            mode,
            dial_timeout: cfg.dial_timeout,
            strategy: cfg.strategy,
            table,
        }
    }

    /// Metrics label for this adapter.
    pub fn proto_label(&self) -> &'static str {
        match self.mode {
            TcpMode::Direct => "tcp",
            TcpMode::Sni => "tcp_sni",
            TcpMode::Dynamic => "tcp_dynamic",
        }
    }

    /// Handles one accepted connection to completion.
    #[instrument(level = "debug", skip(self, client), fields(mode = ?self.mode))]
    pub async fn serve(&self, mut client: TcpStream) -> Result<()> {
        let local_port = client.local_addr()?.port();

        let (target, peeked) = match self.mode {
            TcpMode::Direct => (self.lookup_port_key(local_port), Vec::new()),
            TcpMode::Dynamic => (self.lookup_port_key(local_port), Vec::new()),
            TcpMode::Sni => {
                let (sni, peeked) = read_client_hello(&mut client).await;
                match sni {
                    Some(name) => (self.lookup_sni(&name), peeked),
                    // No SNI: close silently.
                    None => return Ok(()),
                }
            }
        };

        let target = match target {
            Some(t) => t,
            None => {
                Metrics::inc_noroute(self.proto_label());
                debug!(port = local_port, "no route");
                return Ok(());
            }
        };

        self.splice_to_target(&target, client, peeked).await
    }

    /// Resolves a target for a raw listener port: the `:port` host key
    /// form first, then targets whose backend URL carries the port.
    fn lookup_port_key(&self, port: u16) -> Option<Arc<Target>> {
        let table = self.table.load();
        table
            .lookup_host(&format!(":{}", port), self.strategy)
            .or_else(|| table.lookup_port(port, self.strategy))
            .filter(|t| t.proto() == "tcp")
    }

    /// Resolves a target by SNI server name.
    pub fn lookup_sni(&self, sni: &str) -> Option<Arc<Target>> {
        self.table
            .load()
            .lookup_host(sni, self.strategy)
            .filter(|t| t.proto() == "tcp")
    }

    /// Dials the target and splices both halves until either closes.
    /// `peeked` bytes are written to the backend before the splice.
    pub async fn splice_to_target(
        &self,
        target: &Target,
        mut client: TcpStream,
        peeked: Vec<u8>,
    ) -> Result<()> {
        let label = self.proto_label();
        let host = match target.url.host() {
            Some(h) => h.to_string(),
            None => {
                Metrics::record_connection(label, "connfail");
                return Err(ProxyError::Config(format!(
                    "target URL {} has no host",
                    target.url
                )));
            }
        };
        let port = match target.url.port_u16() {
            Some(p) => p,
            None => {
                Metrics::record_connection(label, "connfail");
                return Err(ProxyError::Config(format!(
                    "target URL {} has no port",
                    target.url
                )));
            }
        };

        let mut upstream = match timeout(self.dial_timeout, TcpStream::connect((host.as_str(), port)))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                Metrics::record_connection(label, "connfail");
                warn!(upstream = %target.url, error = %e, "upstream dial failed");
                return Err(ProxyError::UpstreamConnect {
                    addr: format!("{}:{}", host, port),
                    source: e,
                });
            }
            Err(_) => {
                Metrics::record_connection(label, "connfail");
                warn!(upstream = %target.url, "upstream dial timed out");
                return Err(ProxyError::UpstreamTimeout {
                    duration_ms: self.dial_timeout.as_millis() as u64,
                });
            }
        };

        Metrics::record_connection(label, "conn");

        if !peeked.is_empty() {
            upstream.write_all(&peeked).await?;
        }

        // Any splice error tears down both halves.
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((up, down)) => {
                debug!(
                    upstream = %target.url,
                    bytes_up = up,
                    bytes_down = down,
                    "connection closed"
                );
            }
            Err(e) => {
                debug!(upstream = %target.url, error = %e, "splice ended");
            }
        }
        Metrics::record_connection(label, "closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Table;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn proxy_for(table_text: &str, mode: TcpMode) -> TcpProxy {
        let handle = Arc::new(TableHandle::new());
        handle.store(Table::parse(table_text).unwrap());
        TcpProxy::new(mode, &ProxyConfig::default(), handle)
    }

    #[tokio::test]
    async fn test_splice_raw_bytes() {
        // Echo upstream.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = conn.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                conn.write_all(&buf[..n]).await.unwrap();
            }
        });

        let proxy = proxy_for(
            &format!("route add db db.example.com/ tcp://{}", upstream_addr),
            TcpMode::Sni,
        );
        let target = proxy.lookup_sni("db.example.com").unwrap();

        // Proxy-facing socket pair.
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let client_task = tokio::spawn(async move {
            let mut client = TcpStream::connect(front_addr).await.unwrap();
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 6];
            client.read_exact(&mut buf).await.unwrap();
            buf.to_vec()
        });
        let (server_side, _) = front.accept().await.unwrap();

        proxy
            .splice_to_target(&target, server_side, b"pi".to_vec())
            .await
            .unwrap();
        // The upstream saw the peeked prefix plus the client bytes and
        // echoed them all back.
        let echoed = client_task.await.unwrap();
        assert_eq!(echoed, b"piping");
    }

    #[tokio::test]
    async fn test_sni_lookup_requires_tcp_proto() {
        let proxy = proxy_for("route add web web.example.com/ http://10.0.0.1:80/", TcpMode::Sni);
        assert!(proxy.lookup_sni("web.example.com").is_none());
    }

    #[tokio::test]
    async fn test_port_key_lookup() {
        let proxy = proxy_for("route add db :9000/ tcp://10.0.0.7:9000", TcpMode::Direct);
        assert!(proxy.lookup_port_key(9000).is_some());
        assert!(proxy.lookup_port_key(9001).is_none());
    }

    #[tokio::test]
    async fn test_dial_failure_counted() {
        // Port 1 on localhost is almost certainly closed.
        let proxy = proxy_for("route add db db.example.com/ tcp://127.0.0.1:1", TcpMode::Sni);
        let target = proxy.lookup_sni("db.example.com").unwrap();

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let _client = TcpStream::connect(front_addr).await.unwrap();
        let (server_side, _) = front.accept().await.unwrap();

        let result = proxy.splice_to_target(&target, server_side, Vec::new()).await;
        assert!(result.is_err());
    }
}
