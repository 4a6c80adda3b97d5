
use std::time::Duration;

use harness::{
    http_request, send_and_collect, tls_client_connect, EchoBackend, MarkerBackend, ProxyHandle,
    TlsBackend,
};
use hostproxy::proxy::Route;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn host_header_routes_to_correct_backend() {
    let backend_a = MarkerBackend::spawn("A").await.unwrap();
    let backend_b = MarkerBackend::spawn("B").await.unwrap();

    let proxy = ProxyHandle::spawn(vec![
        Route::new("a.example.test", backend_a.addr),
        Route::new("b.example.test", backend_b.addr),
    ])
    .await;

    let reply_a = timeout(
        TEST_TIMEOUT,
        send_and_collect(proxy.listen_addr, &http_request("a.example.test")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply_a, b"A");

    let reply_b = timeout(
        TEST_TIMEOUT,
        send_and_collect(proxy.listen_addr, &http_request("b.example.test")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply_b, b"B");

    assert_eq!(backend_a.connection_count(), 1);
    assert_eq!(backend_b.connection_count(), 1);

    proxy.server.stop().await;
}

#[tokio::test]
async fn host_matching_is_case_insensitive() {
    let backend = MarkerBackend::spawn("ok").await.unwrap();

    let proxy = ProxyHandle::spawn(vec![Route::new("mixed.example.test", backend.addr)]).await;

    let reply = timeout(
        TEST_TIMEOUT,
        send_and_collect(proxy.listen_addr, &http_request("MIXED.Example.TEST")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply, b"ok");

    proxy.server.stop().await;
}

#[tokio::test]
async fn unknown_hostname_closes_connection() {
    let backend = MarkerBackend::spawn("ok").await.unwrap();

    let proxy = ProxyHandle::spawn(vec![Route::new("known.example.test", backend.addr)]).await;

    let reply = timeout(
        TEST_TIMEOUT,
        send_and_collect(proxy.listen_addr, &http_request("unknown.example.test")),
    )
    .await
    .unwrap()
    .unwrap();

    // No fallback backend: the connection is closed with nothing written.
    assert!(reply.is_empty());
    assert_eq!(backend.connection_count(), 0);

    proxy.server.stop().await;
}

#[tokio::test]
async fn garbage_first_bytes_close_connection() {
    let backend = MarkerBackend::spawn("ok").await.unwrap();

    let proxy = ProxyHandle::spawn(vec![Route::new("known.example.test", backend.addr)]).await;

    let reply = timeout(
        TEST_TIMEOUT,
        send_and_collect(proxy.listen_addr, b"SSH-2.0-OpenSSH_9.6\r\n"),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(reply.is_empty());
    assert_eq!(backend.connection_count(), 0);

    proxy.server.stop().await;
}

#[tokio::test]
async fn sni_routes_tls_passthrough_to_correct_backend() {
    let backend_a = TlsBackend::spawn("a.example.test", "A").await.unwrap();
    let backend_b = TlsBackend::spawn("b.example.test", "B").await.unwrap();

    let proxy = ProxyHandle::spawn(vec![
        Route::new("a.example.test", backend_a.addr),
        Route::new("b.example.test", backend_b.addr),
    ])
    .await;

    let reply = timeout(TEST_TIMEOUT, async {
        let mut stream =
            tls_client_connect(proxy.listen_addr, "a.example.test", &backend_a.cert_der)
                .await
                .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = vec![0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    })
    .await
    .unwrap();
    assert_eq!(reply, b"A");

    let reply = timeout(TEST_TIMEOUT, async {
        let mut stream =
            tls_client_connect(proxy.listen_addr, "b.example.test", &backend_b.cert_der)
                .await
                .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = vec![0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    })
    .await
    .unwrap();
    assert_eq!(reply, b"B");

    proxy.server.stop().await;
}

#[tokio::test]
async fn concurrent_sessions_never_cross_backends() {
    let backend_a = EchoBackend::spawn().await.unwrap();
    let backend_b = EchoBackend::spawn().await.unwrap();

    let proxy = ProxyHandle::spawn(vec![
        Route::new("a.example.test", backend_a.addr),
        Route::new("b.example.test", backend_b.addr),
    ])
    .await;

    let addr = proxy.listen_addr;
    let session = |hostname: &'static str, tag: &'static str| async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut payload = http_request(hostname);
        payload.extend_from_slice(tag.as_bytes());
        stream.write_all(&payload).await.unwrap();

        // Echo backend sends everything back; read until we have it all.
        let mut collected = Vec::new();
        let mut buf = vec![0u8; 4096];
        while collected.len() < payload.len() {
            let n = stream.read(&mut buf).await.unwrap();
            assert_ne!(n, 0, "echo ended early");
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, payload);
    };

    timeout(TEST_TIMEOUT, async {
        tokio::join!(
            session("a.example.test", "PAYLOAD-ALPHA"),
            session("b.example.test", "PAYLOAD-BRAVO"),
        )
    })
    .await
    .unwrap();

    let received_a = backend_a.received_bytes().await;
    let received_b = backend_b.received_bytes().await;

    assert!(find(&received_a, b"PAYLOAD-ALPHA"));
    assert!(!find(&received_a, b"PAYLOAD-BRAVO"));
    assert!(find(&received_b, b"PAYLOAD-BRAVO"));
    assert!(!find(&received_b, b"PAYLOAD-ALPHA"));

    proxy.server.stop().await;
}

#[tokio::test]
async fn table_reload_applies_to_new_connections() {
    let backend_old = MarkerBackend::spawn("old").await.unwrap();
    let backend_new = MarkerBackend::spawn("new").await.unwrap();

    let proxy = ProxyHandle::spawn(vec![Route::new("app.example.test", backend_old.addr)]).await;

    let reply = timeout(
        TEST_TIMEOUT,
        send_and_collect(proxy.listen_addr, &http_request("app.example.test")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply, b"old");

    proxy.table.replace(
        hostproxy::proxy::RoutingTable::build(vec![Route::new(
            "app.example.test",
            backend_new.addr,
        )])
        .unwrap(),
    );

    let reply = timeout(
        TEST_TIMEOUT,
        send_and_collect(proxy.listen_addr, &http_request("app.example.test")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply, b"new");

    proxy.server.stop().await;
}

fn find(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
