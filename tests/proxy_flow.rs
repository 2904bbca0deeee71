//! End-to-end flows against a local fake upstream proxy: plain forwarding,
//! management endpoints, auth enforcement, and the CONNECT fallback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use veil::config::Config;
use veil::database::Database;
use veil::forward::ProxyServer;
use veil::models::{CheckResult, Proxy, ProxyKind, ProxyStatus};
use veil::pool::PoolManager;
use veil::repository::ProxyRepository;

/// Fake HTTP upstream proxy: answers any absolute-form request with a
/// fixed body and reports each request head it saw.
async fn fake_http_upstream(heads: mpsc::UnboundedSender<String>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let heads = heads.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                if head.is_empty() {
                    return;
                }
                let _ = heads.send(String::from_utf8_lossy(&head).into_owned());

                let body = "hello from upstream";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    port
}

/// Fake upstream for CONNECT: rejects the first connection's CONNECT with
/// 405, accepts the second (the fallback re-dial), then echoes the
/// tunneled bytes.
async fn fake_connect_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let n = connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let read = stream.read(&mut buf).await.unwrap_or(0);
                if read == 0 {
                    return;
                }
                let head = String::from_utf8_lossy(&buf[..read]).into_owned();
                assert!(head.starts_with("CONNECT "), "expected CONNECT, got: {head}");

                if n == 0 {
                    let _ = stream
                        .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
                        .await;
                    return;
                }

                assert!(
                    head.contains("Proxy-Connection: keep-alive"),
                    "fallback CONNECT missing keep-alive header: {head}"
                );
                let _ = stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await;

                // Echo the spliced bytes back
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    port
}

/// Seed the store with healthy records pointing at `upstream_port`
async fn seed_healthy(repo: &ProxyRepository, upstream_port: u16, count: usize) {
    for i in 0..count {
        // Distinct hosts, same local listener
        let proxy = Proxy::new(format!("127.0.0.{}", i + 1), upstream_port, ProxyKind::Http);
        let record = repo.upsert(&proxy).await.unwrap();
        repo.batch_update_health(&[(
            record.id,
            CheckResult {
                proxy,
                status: ProxyStatus::Healthy,
                response_time: Duration::from_millis(10),
                error: None,
                checked_at: Utc::now(),
            },
        )])
        .await
        .unwrap();
    }
}

/// Boot a veil instance over an in-memory store. Returns the listen port
/// and the shutdown sender.
async fn start_veil(config: Config, seed_port: Option<u16>, seed_count: usize) -> (u16, watch::Sender<bool>) {
    let db = Database::open_in_memory().await.unwrap();
    let repo = ProxyRepository::new(db.pool().clone());

    if let Some(upstream_port) = seed_port {
        seed_healthy(&repo, upstream_port, seed_count).await;
    }

    let manager = PoolManager::new(&db, &config);
    if seed_port.is_some() {
        // Cache loads from the seeded store; no scrape cycle fires
        manager.start().await.unwrap();
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = ProxyServer::new(config.server.clone(), manager);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = server.serve(listener, shutdown_rx).await;
    });

    (port, shutdown_tx)
}

#[tokio::test]
async fn test_forward_through_rotating_upstream() {
    let (heads_tx, mut heads_rx) = mpsc::unbounded_channel();
    let upstream_port = fake_http_upstream(heads_tx).await;

    // One dialable upstream; only 127.0.0.1 is actually bound
    let (port, _shutdown) = start_veil(Config::default(), Some(upstream_port), 1).await;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://127.0.0.1:{port}")).unwrap())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();

    let response = client
        .get("http://example.com/")
        .header("X-Forwarded-For", "203.0.113.7")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello from upstream");

    // The upstream saw a sanitized request: identifying header gone,
    // configured User-Agent applied.
    let head = heads_rx.recv().await.unwrap();
    assert!(head.starts_with("GET http://example.com/"));
    assert!(!head.to_lowercase().contains("x-forwarded-for"));
    assert!(head.contains("Chrome"));
}

#[tokio::test]
async fn test_health_and_proxies_reflect_seeded_cache() {
    let (heads_tx, _heads_rx) = mpsc::unbounded_channel();
    let upstream_port = fake_http_upstream(heads_tx).await;

    let (port, _shutdown) = start_veil(Config::default(), Some(upstream_port), 10).await;

    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(
        health.text().await.unwrap(),
        "OK - 10 healthy proxies available"
    );

    // Cache rehydrated straight from the store, no scrape involved
    let proxies = client
        .get(format!("http://127.0.0.1:{port}/proxies"))
        .send()
        .await
        .unwrap();
    let list: serde_json::Value = proxies.json().await.unwrap();
    assert_eq!(list.as_array().unwrap().len(), 10);

    let stats = client
        .get(format!("http://127.0.0.1:{port}/stats"))
        .send()
        .await
        .unwrap();
    let stats: serde_json::Value = stats.json().await.unwrap();
    assert_eq!(stats["proxy_stats"]["cached_healthy"], 10);
    assert_eq!(stats["database_stats"]["healthy"], 10);
}

#[tokio::test]
async fn test_health_without_proxies_is_503() {
    let (port, _shutdown) = start_veil(Config::default(), None, 0).await;

    let client = reqwest::Client::new();
    let health = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(health.status(), 503);
    assert_eq!(health.text().await.unwrap(), "No healthy proxies");
}

#[tokio::test]
async fn test_auth_gates_stats_but_not_health() {
    let mut config = Config::default();
    config.server.auth_token = "hunter2".to_string();

    let (port, _shutdown) = start_veil(config, None, 0).await;
    let client = reqwest::Client::new();

    // /health stays public
    let health = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 503);

    // /stats without credentials: 407 challenge, no stats payload
    let denied = client
        .get(format!("http://127.0.0.1:{port}/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 407);
    assert_eq!(
        denied
            .headers()
            .get("proxy-authenticate")
            .map(|v| v.to_str().unwrap().to_string()),
        Some("Bearer".to_string())
    );
    let body = denied.text().await.unwrap();
    assert!(!body.contains("proxy_stats"));

    // Wrong token is still 407
    let wrong = client
        .get(format!("http://127.0.0.1:{port}/stats"))
        .header("Proxy-Authorization", "Bearer hunter3")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 407);

    // Correct token unlocks the JSON
    let allowed = client
        .get(format!("http://127.0.0.1:{port}/stats"))
        .header("Proxy-Authorization", "Bearer hunter2")
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
    let stats: serde_json::Value = allowed.json().await.unwrap();
    assert!(stats.get("proxy_stats").is_some());
}

#[tokio::test]
async fn test_relative_non_endpoint_request_is_400() {
    let (port, _shutdown) = start_veil(Config::default(), None, 0).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{port}/favicon.ico"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_connect_falls_back_and_splices() {
    let upstream_port = fake_connect_upstream().await;

    let (port, _shutdown) = start_veil(Config::default(), Some(upstream_port), 1).await;

    // Speak the proxy protocol by hand: CONNECT, expect 200, then rely on
    // the echo upstream to prove bytes flow both ways.
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"CONNECT target.example:443 HTTP/1.1\r\nHost: target.example:443\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut buf))
            .await
            .expect("timed out waiting for CONNECT response")
            .unwrap();
        assert!(n > 0, "connection closed before CONNECT response");
        response.extend_from_slice(&buf[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let head = String::from_utf8_lossy(&response);
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected response: {head}");

    stream.write_all(b"ping through the tunnel").await.unwrap();

    let mut echoed = vec![0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut echoed))
        .await
        .expect("timed out waiting for echoed bytes")
        .unwrap();
    assert_eq!(&echoed[..n], b"ping through the tunnel");
}

#[tokio::test]
async fn test_dead_upstream_is_evicted_and_pool_drains_to_503() {
    // Seed one healthy record pointing at a closed port
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = closed.local_addr().unwrap().port();
    drop(closed);

    let (port, _shutdown) = start_veil(Config::default(), Some(dead_port), 1).await;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://127.0.0.1:{port}")).unwrap())
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap();

    // The failed attempt evicts the only upstream, the next selection
    // finds an empty pool, and the client sees 503.
    let response = client.get("http://example.com/").send().await.unwrap();
    assert_eq!(response.status(), 503);

    let health = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .unwrap();
    assert_eq!(health.status(), 503);
}
