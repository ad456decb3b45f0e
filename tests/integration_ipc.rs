//! End-to-end tests over real loopback sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use diskjockey_ipc::IpcError;
use diskjockey_ipc::handlers::{BackendHandlerFactory, HelperHandlerFactory, MountRegistry};
use diskjockey_ipc::ipc::messages::{
    CreateMountRequest, ListDiskTypesRequest, ListMountsRequest, ListMountsResponse, MountRequest,
    MountStatus, MountStatusUpdate,
};
use diskjockey_ipc::ipc::{
    Connection, ConnectionConfig, ConnectionPool, ConnectionState, DEFAULT_MAX_FRAME_LENGTH, Endpoint, HandlerFactory,
    Message, MessageServer, MessageType, ReconnectHook, Role, ServerConfig, TransportListener, read_frame,
    redial_hook,
};
use futures::future::BoxFuture;
use tokio::net::TcpListener;

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        request_timeout: Duration::from_secs(2),
        reconnect_poll_interval: Duration::from_millis(20),
        reconnect_timeout: Duration::from_millis(400),
        ..Default::default()
    }
}

async fn start_server(factory: impl HandlerFactory) -> (MessageServer, Endpoint) {
    let listener = TransportListener::bind(&Endpoint::tcp_loopback(0)).await.unwrap();
    let endpoint = listener.local_endpoint().unwrap();
    let server = MessageServer::new(ServerConfig::default(), factory);
    let running = server.clone();
    tokio::spawn(async move { running.run(listener).await });
    (server, endpoint)
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_connect_twice_leaves_one_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let live = Arc::new(AtomicUsize::new(0));

    let (a, l) = (Arc::clone(&accepted), Arc::clone(&live));
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            a.fetch_add(1, Ordering::SeqCst);
            l.fetch_add(1, Ordering::SeqCst);
            let l = Arc::clone(&l);
            tokio::spawn(async move {
                // Returns once the client side closes.
                let _ = read_frame(&mut socket, DEFAULT_MAX_FRAME_LENGTH).await;
                l.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    let endpoint = Endpoint::tcp_loopback(port);
    let conn = Connection::new(fast_config());
    conn.connect(&endpoint).await.unwrap();
    conn.connect(&endpoint).await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Connected(endpoint));
    assert!(eventually(|| accepted.load(Ordering::SeqCst) == 2).await);
    assert!(eventually(|| live.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test]
async fn test_pool_keeps_at_most_max_entries() {
    let (server, endpoint) = start_server(BackendHandlerFactory::new(MountRegistry::new())).await;
    let pool = ConnectionPool::new(endpoint, 2, fast_config()).with_role(Role::App);

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.acquire().await.unwrap());
    }
    for conn in held {
        pool.release(conn);
    }
    assert_eq!(pool.len(), 2);

    // Pooled connections are live and already identified.
    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.role().await, Some(Role::App));
    conn.request(&ListMountsRequest {}).await.unwrap();
    assert_eq!(pool.len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_back_to_back_requests_correlate() {
    let registry = MountRegistry::new();
    let (server, endpoint) = start_server(BackendHandlerFactory::new(registry.clone())).await;
    registry
        .create("docs", "local_directory", Default::default())
        .unwrap();

    let conn = Arc::new(Connection::new(fast_config()));
    conn.connect_as(&endpoint, Role::App).await.unwrap();

    let (mounts, disk_types) = tokio::join!(
        conn.request(&ListMountsRequest {}),
        conn.request(&ListDiskTypesRequest {})
    );
    let mounts = mounts.unwrap();
    let disk_types = disk_types.unwrap();
    assert_eq!(mounts.mounts.len(), 1);
    assert_eq!(mounts.mounts[0].name, "docs");
    assert_eq!(disk_types.disk_types.len(), 6);

    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_hook_runs_once_then_not_connected() {
    let (server, endpoint) = start_server(BackendHandlerFactory::new(MountRegistry::new())).await;
    let conn = Connection::new(fast_config());
    conn.connect_as(&endpoint, Role::App).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let hook: ReconnectHook = Arc::new(move || -> BoxFuture<'static, diskjockey_ipc::Result<()>> {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    });
    conn.set_reconnect_hook(hook).await;

    conn.disconnect().await;
    let started = tokio::time::Instant::now();
    let err = conn.request(&ListMountsRequest {}).await.unwrap_err();
    assert!(matches!(err, IpcError::NotConnected));
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_redial_hook_recovers_request() {
    let (server, endpoint) = start_server(BackendHandlerFactory::new(MountRegistry::new())).await;
    let conn = Arc::new(Connection::new(fast_config()));
    conn.connect_as(&endpoint, Role::App).await.unwrap();
    conn.set_reconnect_hook(redial_hook(&conn)).await;

    conn.disconnect().await;
    assert!(!conn.is_connected());

    // The hook redials and re-handshakes before the request is retried.
    let response = conn.request(&ListMountsRequest {}).await.unwrap();
    assert!(response.error.is_empty());
    assert!(conn.is_connected());

    server.stop().await;
}

#[tokio::test]
async fn test_abandoned_request_does_not_block_next() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut seen = 0;
        while let Ok(frame) = read_frame(&mut socket, DEFAULT_MAX_FRAME_LENGTH).await {
            seen += 1;
            // Stay silent for the first request only.
            if seen > 1 && frame.tag == MessageType::ListMountsRequest.tag() {
                let reply = ListMountsResponse::default().to_frame().unwrap().encode().unwrap();
                tokio::io::AsyncWriteExt::write_all(&mut socket, &reply).await.unwrap();
            }
        }
    });

    let conn = Connection::new(fast_config());
    conn.connect(&Endpoint::tcp_loopback(port)).await.unwrap();

    let err = conn
        .request_with_timeout(&ListMountsRequest {}, Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::Timeout(_)));
    assert!(conn.is_connected());

    let response = conn
        .request_with_timeout(&ListMountsRequest {}, Duration::from_millis(500))
        .await
        .unwrap();
    assert!(response.mounts.is_empty());
}

#[tokio::test]
async fn test_handshake_rejection_closes_socket() {
    let (server, endpoint) = start_server(BackendHandlerFactory::new(MountRegistry::new())).await;
    let conn = Connection::new(fast_config());
    let err = conn.connect_as(&endpoint, Role::Backend).await.unwrap_err();
    assert!(matches!(err, IpcError::Handshake(_)));
    assert!(!conn.is_connected());
    assert_eq!(conn.state(), ConnectionState::Failed(String::new()));

    server.stop().await;
}

#[tokio::test]
async fn test_mount_status_reaches_app_through_helper() {
    let (helper, helper_endpoint) = start_server(HelperHandlerFactory::default()).await;

    let link = Arc::new(Connection::new(fast_config()));
    link.connect_as(&helper_endpoint, Role::Backend).await.unwrap();
    link.set_reconnect_hook(redial_hook(&link)).await;
    let factory = BackendHandlerFactory::new(MountRegistry::new()).with_helper(Arc::clone(&link));
    let (backend, backend_endpoint) = start_server(factory).await;

    let watcher = Connection::new(fast_config());
    watcher.connect_as(&helper_endpoint, Role::FileProvider).await.unwrap();

    let app = Connection::new(fast_config());
    app.connect_as(&backend_endpoint, Role::App).await.unwrap();
    let created = app
        .request(&CreateMountRequest {
            name: "remote".into(),
            disk_type: "sftp".into(),
            config: [("host".to_string(), "example.org".to_string())].into_iter().collect(),
        })
        .await
        .unwrap();
    assert!(created.error.is_empty());

    let mounted = app
        .request(&MountRequest {
            mount_id: created.mount_id,
        })
        .await
        .unwrap();
    assert!(mounted.error.is_empty());

    // The requesting app gets the update as an event on its own connection.
    let own = tokio::time::timeout(Duration::from_secs(2), app.next_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(own.tag, MessageType::MountStatusUpdate.tag());

    // And the helper relays it to its subscribers.
    let relayed = tokio::time::timeout(Duration::from_secs(2), watcher.next_event())
        .await
        .unwrap()
        .unwrap();
    let update = MountStatusUpdate::from_frame(&relayed).unwrap();
    assert_eq!(update.mount_id, created.mount_id);
    assert_eq!(update.name, "remote");
    assert_eq!(update.status, MountStatus::Mounted);

    backend.stop().await;
    helper.stop().await;
}
