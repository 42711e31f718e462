//! End-to-end runs through the listener manager: config -> allocation -> listeners.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use routegate::config::AccountTable;
use routegate::context::GatewayContext;
use routegate::listener::ListenerManager;
use routegate::registry::{allocate, AllocationPlan, BindProbe, ListenerKind, PortAllocationTable};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Minimal chain upstream: accepts no-auth SOCKS5 CONNECT, reports the
/// address type and host it was asked for, then splices to the target.
async fn chain_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<(u8, String)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut greeting = [0u8; 2];
                stream.read_exact(&mut greeting).await.unwrap();
                let mut methods = vec![0u8; greeting[1] as usize];
                stream.read_exact(&mut methods).await.unwrap();
                stream.write_all(&[0x05, 0x00]).await.unwrap();

                let mut head = [0u8; 4];
                stream.read_exact(&mut head).await.unwrap();
                let atyp = head[3];
                assert_eq!(atyp, 0x03, "chain requests must use the domain address type");
                let len = stream.read_u8().await.unwrap() as usize;
                let mut host = vec![0u8; len];
                stream.read_exact(&mut host).await.unwrap();
                let host = String::from_utf8(host).unwrap();
                let port = stream.read_u16().await.unwrap();
                let _ = tx.send((atyp, host.clone()));

                let mut target = TcpStream::connect((host.as_str(), port)).await.unwrap();
                stream
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut target).await;
            });
        }
    });
    (addr, rx)
}

async fn ephemeral_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    probe.local_addr().unwrap().port()
}

async fn start_gateway(config_json: &str) -> (ListenerManager, PortAllocationTable) {
    let table = AccountTable::from_json(config_json).unwrap();
    let plan = AllocationPlan {
        http: true,
        socks: true,
        socks_port_offset: 1000,
        probe_limit: 50,
    };
    let allocation = allocate(&table.accounts, &plan, &BindProbe { ip: LOCALHOST });
    assert!(allocation.failures.is_empty(), "{:?}", allocation.failures);

    let ctx = Arc::new(GatewayContext::new(
        "routegate-test",
        Duration::from_secs(5),
        Duration::from_secs(5),
    ));
    let mut manager = ListenerManager::new(ctx);
    let started = manager.start(&allocation.table, LOCALHOST).await;
    assert_eq!(started.len(), allocation.table.len());
    (manager, allocation.table)
}

async fn http_connect(port: u16, target: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect((LOCALHOST, port)).await.unwrap();
    let req = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    stream.write_all(req.as_bytes()).await.unwrap();

    let expected = b"HTTP/1.1 200 Connection Established\r\nProxy-agent: routegate-test\r\n\r\n";
    let mut reply = vec![0u8; expected.len()];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, expected);
    stream
}

async fn socks_connect(port: u16, target: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect((LOCALHOST, port)).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    req.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&req).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    stream
}

async fn assert_echo(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut back = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut back))
        .await
        .expect("echo arrived")
        .unwrap();
    assert_eq!(back, payload);
}

#[tokio::test]
async fn direct_account_serves_both_protocols() {
    let echo = echo_server().await;
    let port = ephemeral_port().await;
    let config = format!(
        r#"{{ "accounts": {{ "alice@example.com": {{ "proxy_port": {}, "upstream": {{ "type": "direct" }} }} }} }}"#,
        port
    );
    let (manager, table) = start_gateway(&config).await;

    let http = table.find("alice@example.com", ListenerKind::Http).unwrap();
    let socks = table.find("alice@example.com", ListenerKind::Socks5).unwrap();
    assert_eq!(socks.requested_port, port + 1000);

    let mut tunnel = http_connect(http.port, echo).await;
    assert_echo(&mut tunnel, b"through the http listener").await;

    let mut tunnel = socks_connect(socks.port, echo).await;
    assert_echo(&mut tunnel, b"through the socks listener").await;

    manager.shutdown().await;
}

#[tokio::test]
async fn tor_account_chains_with_domain_addresses() {
    let echo = echo_server().await;
    let (upstream, mut seen) = chain_upstream().await;
    let port = ephemeral_port().await;
    let config = format!(
        r#"{{ "accounts": {{ "bob@example.com": {{
            "proxy_port": {},
            "upstream": {{ "type": "tor", "name": "Tor", "socks_host": "127.0.0.1", "socks_port": {} }}
        }} }} }}"#,
        port,
        upstream.port()
    );
    let (manager, table) = start_gateway(&config).await;
    let http = table.find("bob@example.com", ListenerKind::Http).unwrap();
    let socks = table.find("bob@example.com", ListenerKind::Socks5).unwrap();
    assert_eq!(http.route_name, "Tor");

    let mut tunnel = http_connect(http.port, echo).await;
    assert_echo(&mut tunnel, b"chained over http").await;
    assert_eq!(seen.recv().await.unwrap(), (0x03, "127.0.0.1".to_string()));

    // The SOCKS client speaks IPv4; the chain still gets a domain request.
    let mut tunnel = socks_connect(socks.port, echo).await;
    assert_echo(&mut tunnel, b"chained over socks").await;
    assert_eq!(seen.recv().await.unwrap(), (0x03, "127.0.0.1".to_string()));

    manager.shutdown().await;
}

#[tokio::test]
async fn accounts_are_isolated_from_each_others_failures() {
    let echo = echo_server().await;
    let dead = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };
    let port = ephemeral_port().await;
    let config = format!(
        r#"{{ "accounts": {{
            "broken@example.com": {{ "proxy_port": {}, "upstream": {{ "type": "tor", "socks_host": "127.0.0.1", "socks_port": {} }} }},
            "fine@example.com": {{ "proxy_port": {}, "upstream": {{ "type": "direct" }} }}
        }} }}"#,
        port, dead, port
    );
    let (manager, table) = start_gateway(&config).await;

    let broken = table.find("broken@example.com", ListenerKind::Http).unwrap();
    let fine = table.find("fine@example.com", ListenerKind::Http).unwrap();
    assert_eq!(fine.requested_port, port);
    assert!(fine.port > port, "second account requesting the same port is relocated");

    let mut stream = TcpStream::connect((LOCALHOST, broken.port)).await.unwrap();
    let req = format!("CONNECT {} HTTP/1.1\r\n\r\n", echo);
    stream.write_all(req.as_bytes()).await.unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert!(reply.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));

    let mut tunnel = http_connect(fine.port, echo).await;
    assert_echo(&mut tunnel, b"unaffected").await;

    manager.shutdown().await;
}

#[tokio::test]
async fn connection_count_returns_to_zero() {
    let echo = echo_server().await;
    let port = ephemeral_port().await;
    let config = format!(
        r#"{{ "accounts": {{ "carol@example.com": {{ "proxy_port": {}, "upstream": {{ "type": "direct" }} }} }} }}"#,
        port
    );
    let (manager, table) = start_gateway(&config).await;
    let tracker = manager.tracker();
    let http = table.find("carol@example.com", ListenerKind::Http).unwrap().port;
    let socks = table.find("carol@example.com", ListenerKind::Socks5).unwrap().port;

    for i in 0..20 {
        let mut tunnel = if i % 2 == 0 {
            http_connect(http, echo).await
        } else {
            socks_connect(socks, echo).await
        };
        assert_echo(&mut tunnel, format!("cycle {}", i).as_bytes()).await;
        tunnel.shutdown().await.unwrap();
        let mut rest = Vec::new();
        tunnel.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tracker.active() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(tracker.active(), 0);
    assert_eq!(tracker.total(), 20);

    manager.shutdown().await;
}
