//! Listener supervisor: binds and runs one protocol adapter per
//! configured listener, with graceful shutdown support.
//!
//! Every adapter follows the same shape: an accept loop that stops on
//! the shutdown broadcast, a per-listener connection limiter, and one
//! task per accepted connection. Dynamic TCP listeners are opened and
//! closed by a rescan task that follows the published table.

use crate::auth::AuthScheme;
use crate::config::{ListenConfig, Proto, ProxyConfig};
use crate::connection::ConnLimiter;
use crate::error::{ProxyError, Result};
use crate::glob::GlobCache;
use crate::grpc_proxy::GrpcProxy;
use crate::http_proxy::HttpProxy;
use crate::metrics::Metrics;
use crate::sni::{read_client_hello, PrefixedStream};
use crate::table::TableHandle;
use crate::tcp_proxy::{TcpMode, TcpProxy};
use crate::tls;
use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tracing::{debug, info, warn};

/// Running listeners plus the limiters used for graceful drain.
pub struct ListenerSet {
    handles: Vec<JoinHandle<()>>,
    limiters: Vec<Arc<ConnLimiter>>,
    addrs: Vec<(Proto, std::net::SocketAddr)>,
}

impl ListenerSet {
    /// Bound addresses of the static listeners (dynamic TCP ports are
    /// not included).
    pub fn addrs(&self) -> &[(Proto, std::net::SocketAddr)] {
        &self.addrs
    }

    /// Waits until every listener reports zero active connections or the
    /// deadline passes. Returns true when fully drained.
    pub async fn drain(&self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let active: usize = self.limiters.iter().map(|l| l.active()).sum();
            if active == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(active, "drain deadline passed, forcing shutdown");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Aborts all accept loops.
    pub fn abort_all(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Binds all configured listeners and spawns their adapters. A bind
/// failure is fatal and aborts startup.
pub async fn spawn_listeners(
    cfg: Arc<ProxyConfig>,
    table: Arc<TableHandle>,
    glob: Arc<GlobCache>,
    auth: Arc<HashMap<String, Arc<dyn AuthScheme>>>,
    shutdown: broadcast::Sender<()>,
) -> Result<ListenerSet> {
    let mut handles = Vec::new();
    let mut limiters = Vec::new();
    let mut addrs = Vec::new();

    let http_proxy = HttpProxy::new(
        Arc::clone(&cfg),
        Arc::clone(&table),
        Arc::clone(&glob),
        Arc::clone(&auth),
    );

    for listen in &cfg.listen {
        let limiter = Arc::new(ConnLimiter::new(cfg.max_conn));
        limiters.push(Arc::clone(&limiter));
        info!(proto = %listen.proto, addr = %listen.addr, "starting listener");

        match listen.proto {
            Proto::Http => {
                let listener = bind(&listen.addr).await?;
                addrs.push((listen.proto, local_addr(&listener, &listen.addr)?));
                let proxy = http_proxy.clone();
                handles.push(tokio::spawn(serve_http(
                    listener,
                    proxy,
                    None,
                    limiter,
                    shutdown.subscribe(),
                )));
            }
            Proto::Https => {
                let acceptor = tls_acceptor(listen, &shutdown)?;
                let listener = bind(&listen.addr).await?;
                addrs.push((listen.proto, local_addr(&listener, &listen.addr)?));
                let proxy = http_proxy.clone();
                handles.push(tokio::spawn(serve_http(
                    listener,
                    proxy,
                    Some(acceptor),
                    limiter,
                    shutdown.subscribe(),
                )));
            }
            Proto::Grpc | Proto::Grpcs => {
                let acceptor = if listen.proto == Proto::Grpcs {
                    Some(tls_acceptor(listen, &shutdown)?)
                } else {
                    None
                };
                let listener = bind(&listen.addr).await?;
                addrs.push((listen.proto, local_addr(&listener, &listen.addr)?));
                let proxy = GrpcProxy::new(
                    Arc::clone(&cfg),
                    Arc::clone(&table),
                    Arc::clone(&glob),
                    acceptor.is_some(),
                );
                handles.push(tokio::spawn(serve_grpc(
                    listener,
                    proxy,
                    acceptor,
                    limiter,
                    shutdown.subscribe(),
                )));
            }
            Proto::Tcp => {
                let listener = bind(&listen.addr).await?;
                addrs.push((listen.proto, local_addr(&listener, &listen.addr)?));
                let proxy = TcpProxy::new(TcpMode::Direct, &cfg, Arc::clone(&table));
                handles.push(tokio::spawn(serve_tcp(
                    listener,
                    proxy,
                    limiter,
                    shutdown.subscribe(),
                )));
            }
            Proto::TcpSni => {
                let listener = bind(&listen.addr).await?;
                addrs.push((listen.proto, local_addr(&listener, &listen.addr)?));
                let proxy = TcpProxy::new(TcpMode::Sni, &cfg, Arc::clone(&table));
                handles.push(tokio::spawn(serve_tcp(
                    listener,
                    proxy,
                    limiter,
                    shutdown.subscribe(),
                )));
            }
            Proto::TcpDynamic => {
                handles.push(tokio::spawn(serve_tcp_dynamic(
                    listen.clone(),
                    Arc::clone(&cfg),
                    Arc::clone(&table),
                    limiter,
                    shutdown.clone(),
                )));
            }
            Proto::HttpsTcpSni => {
                let acceptor = tls_acceptor(listen, &shutdown)?;
                let listener = bind(&listen.addr).await?;
                addrs.push((listen.proto, local_addr(&listener, &listen.addr)?));
                let proxy = http_proxy.clone();
                let tcp = TcpProxy::new(TcpMode::Sni, &cfg, Arc::clone(&table));
                handles.push(tokio::spawn(serve_mixed(
                    listener,
                    proxy,
                    tcp,
                    acceptor,
                    limiter,
                    shutdown.subscribe(),
                )));
            }
        }
    }

    Ok(ListenerSet {
        handles,
        limiters,
        addrs,
    })
}

fn local_addr(listener: &TcpListener, addr: &str) -> Result<std::net::SocketAddr> {
    listener.local_addr().map_err(|e| ProxyError::ListenerBind {
        addr: addr.to_string(),
        source: e,
    })
}

fn tls_acceptor(listen: &ListenConfig, shutdown: &broadcast::Sender<()>) -> Result<TlsAcceptor> {
    let (config, resolver) = tls::server_config(listen)?;
    if let Some(source) = &listen.cert_source {
        tls::spawn_cert_reload(source.clone(), resolver, shutdown.subscribe());
    }
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Binds an address, mapping a bare `:port` form to all interfaces.
async fn bind(addr: &str) -> Result<TcpListener> {
    let addr = normalize_addr(addr);
    TcpListener::bind(&addr)
        .await
        .map_err(|e| ProxyError::ListenerBind {
            addr: addr.clone(),
            source: e,
        })
}

fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// HTTP(S) accept loop.
async fn serve_http(
    listener: TcpListener,
    proxy: HttpProxy,
    acceptor: Option<TlsAcceptor>,
    limiter: Arc<ConnLimiter>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let guard = match limiter.try_acquire() {
                    Some(g) => g,
                    None => continue,
                };
                let local_port = stream.local_addr().map(|a| a.port()).unwrap_or(0);
                let service = proxy.with_conn(peer_addr, local_port, acceptor.is_some());
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    Metrics::record_connection("http", "conn");
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                serve_http_conn(TokioIo::new(tls_stream), service).await;
                            }
                            Err(e) => {
                                Metrics::inc_tls_handshake_error();
                                debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                            }
                        },
                        None => serve_http_conn(TokioIo::new(stream), service).await,
                    }
                    Metrics::record_connection("http", "closed");
                });
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown: http listener stopping");
                break;
            }
        }
    }
}

/// Serves one connection with HTTP/1.1 + HTTP/2 auto-negotiation and
/// upgrade support.
async fn serve_http_conn<I>(io: I, service: HttpProxy)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let svc = service_fn(move |req: Request<Incoming>| {
        let mut service = service.clone();
        async move { service.call(req).await }
    });
    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, svc)
        .await
    {
        debug!(error = %e, "connection ended");
    }
}

/// gRPC accept loop: HTTP/2 only.
async fn serve_grpc(
    listener: TcpListener,
    proxy: GrpcProxy,
    acceptor: Option<TlsAcceptor>,
    limiter: Arc<ConnLimiter>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let guard = match limiter.try_acquire() {
                    Some(g) => g,
                    None => continue,
                };
                let service = proxy.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    Metrics::record_connection("grpc", "conn");
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                serve_grpc_conn(TokioIo::new(tls_stream), service).await;
                            }
                            Err(e) => {
                                Metrics::inc_tls_handshake_error();
                                debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                            }
                        },
                        None => serve_grpc_conn(TokioIo::new(stream), service).await,
                    }
                    Metrics::record_connection("grpc", "closed");
                });
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown: grpc listener stopping");
                break;
            }
        }
    }
}

async fn serve_grpc_conn<I>(io: I, service: GrpcProxy)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let svc = service_fn(move |req: Request<Incoming>| {
        let mut service = service.clone();
        async move { service.call(req).await }
    });
    if let Err(e) = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
        .serve_connection(io, svc)
        .await
    {
        debug!(error = %e, "grpc connection ended");
    }
}

/// Raw TCP accept loop for the direct, SNI, and dynamic adapters.
async fn serve_tcp(
    listener: TcpListener,
    proxy: TcpProxy,
    limiter: Arc<ConnLimiter>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let label = proxy.proto_label();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let guard = match limiter.try_acquire() {
                    Some(g) => g,
                    None => continue,
                };
                let proxy = proxy.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = proxy.serve(stream).await {
                        debug!(peer = %peer_addr, error = %e, "tcp connection error");
                    }
                });
            }
            _ = shutdown_rx.recv() => {
                info!(proto = label, "shutdown: tcp listener stopping");
                break;
            }
        }
    }
}

/// Rescan loop for dynamic TCP: opens a listener for every backend port
/// referenced only by `tcp` targets, closes listeners whose port
/// disappeared from the table.
async fn serve_tcp_dynamic(
    listen: ListenConfig,
    cfg: Arc<ProxyConfig>,
    table: Arc<TableHandle>,
    limiter: Arc<ConnLimiter>,
    shutdown: broadcast::Sender<()>,
) {
    let open: DashMap<u16, JoinHandle<()>> = DashMap::new();
    let host = listen
        .addr
        .rsplit_once(':')
        .map(|(h, _)| h)
        .filter(|h| !h.is_empty())
        .unwrap_or("0.0.0.0")
        .to_string();
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(listen.refresh) => {}
            _ = shutdown_rx.recv() => break,
        }

        let ports = table.load().tcp_backend_ports();

        open.retain(|port, handle| {
            if ports.contains(port) {
                true
            } else {
                info!(port = *port, "closing dynamic tcp listener");
                handle.abort();
                false
            }
        });

        for port in ports {
            if open.contains_key(&port) {
                continue;
            }
            let addr = format!("{}:{}", host, port);
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!(addr = %addr, "starting dynamic tcp listener");
                    let proxy = TcpProxy::new(TcpMode::Dynamic, &cfg, Arc::clone(&table));
                    let handle = tokio::spawn(serve_tcp(
                        listener,
                        proxy,
                        Arc::clone(&limiter),
                        shutdown.subscribe(),
                    ));
                    open.insert(port, handle);
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "dynamic tcp port not bindable");
                }
            }
        }
    }

    info!("shutdown: dynamic tcp supervisor stopping");
    for entry in open.iter() {
        entry.value().abort();
    }
}

/// Combined HTTPS/TCP+SNI listener: peeks the ClientHello on the shared
/// port; SNI resolving to a `tcp` target bypasses TLS termination,
/// everything else is terminated locally and served as HTTPS.
async fn serve_mixed(
    listener: TcpListener,
    proxy: HttpProxy,
    tcp: TcpProxy,
    acceptor: TlsAcceptor,
    limiter: Arc<ConnLimiter>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let guard = match limiter.try_acquire() {
                    Some(g) => g,
                    None => continue,
                };
                let local_port = stream.local_addr().map(|a| a.port()).unwrap_or(0);
                let service = proxy.with_conn(peer_addr, local_port, true);
                let tcp = tcp.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    let mut stream = stream;
                    let (sni, peeked) = read_client_hello(&mut stream).await;

                    if let Some(name) = &sni {
                        if let Some(target) = tcp.lookup_sni(name) {
                            if let Err(e) = tcp.splice_to_target(&target, stream, peeked).await {
                                debug!(peer = %peer_addr, error = %e, "sni splice error");
                            }
                            return;
                        }
                    }

                    let replay = PrefixedStream::new(peeked, stream);
                    match acceptor.accept(replay).await {
                        Ok(tls_stream) => {
                            Metrics::record_connection("http", "conn");
                            serve_http_conn(TokioIo::new(tls_stream), service).await;
                            Metrics::record_connection("http", "closed");
                        }
                        Err(e) => {
                            Metrics::inc_tls_handshake_error();
                            debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                        }
                    }
                });
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown: mixed listener stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr(":9999"), "0.0.0.0:9999");
        assert_eq!(normalize_addr("127.0.0.1:80"), "127.0.0.1:80");
    }

    #[tokio::test]
    async fn test_bind_invalid_address_fails() {
        let result = bind("999.999.999.999:0").await;
        assert!(matches!(result, Err(ProxyError::ListenerBind { .. })));
    }

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawn_listeners_and_drain() {
        let mut cfg = ProxyConfig::default();
        cfg.listen = vec![ListenConfig::parse("127.0.0.1:0;proto=http").unwrap()];
        let cfg = Arc::new(cfg);
        let table = Arc::new(TableHandle::new());
        let glob = Arc::new(GlobCache::new(16));
        let auth = Arc::new(HashMap::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        let set = spawn_listeners(cfg, table, glob, auth, shutdown_tx.clone())
            .await
            .unwrap();
        assert!(set.drain(Duration::from_millis(100)).await);

        let _ = shutdown_tx.send(());
        set.abort_all();
    }
}
