//! SOCKS5 listener side: no-auth negotiation and CONNECT only.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::context::GatewayContext;
use crate::error::ProxyError;
use crate::registry::AccountRoute;
use crate::relay::relay;

// SOCKS5 protocol constants.
pub const VERSION5: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPT: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Serve one accepted SOCKS5 connection for `route`
pub async fn handle_socks5<S>(
    mut client: S,
    route: &AccountRoute,
    ctx: &GatewayContext,
    conn_id: u64,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate(&mut client).await?;

    // VER CMD RSV ATYP
    let mut header = [0u8; 4];
    client.read_exact(&mut header).await?;
    if header[0] != VERSION5 {
        return Err(ProxyError::protocol(format!(
            "unsupported SOCKS version {} in request",
            header[0]
        )));
    }
    let cmd = header[1];
    let atyp = header[3];

    let host = match read_host(&mut client, atyp).await? {
        Some(host) => host,
        None => {
            send_reply(&mut client, REP_ADDR_NOT_SUPPORTED).await?;
            return Err(ProxyError::protocol(format!(
                "unsupported address type 0x{:02x}",
                atyp
            )));
        }
    };
    let port = client.read_u16().await?;

    if cmd != CMD_CONNECT {
        send_reply(&mut client, REP_CMD_NOT_SUPPORTED).await?;
        return Err(ProxyError::protocol(format!(
            "unsupported command 0x{:02x}",
            cmd
        )));
    }

    info!(
        "#{} [{}] SOCKS5 CONNECT {}:{} via {}",
        conn_id, route.port, host, port, route.route_name
    );

    let dest = match ctx.connector.connect(&route.upstream, &host, port).await {
        Ok(dest) => dest,
        Err(e) => {
            warn!("#{} [{}] {}", conn_id, route.port, e);
            send_reply(&mut client, REP_CONN_REFUSED).await?;
            return Err(e.into());
        }
    };

    send_reply(&mut client, REP_SUCCESS).await?;

    let stats = relay(client, dest).await;
    debug!(
        "#{} [{}] SOCKS5 tunnel to {}:{} closed: {} bytes up, {} bytes down",
        conn_id, route.port, host, port, stats.a_to_b, stats.b_to_a
    );
    Ok(())
}

/// Greeting: only "no authentication" is offered back
async fn negotiate<S>(client: &mut S) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    if greeting[0] != VERSION5 {
        return Err(ProxyError::protocol(format!(
            "unsupported SOCKS version {}",
            greeting[0]
        )));
    }

    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        client.write_all(&[VERSION5, AUTH_NO_ACCEPT]).await?;
        client.flush().await?;
        return Err(ProxyError::protocol("client offered no acceptable auth method"));
    }

    client.write_all(&[VERSION5, AUTH_NONE]).await?;
    client.flush().await?;
    Ok(())
}

/// Destination host in text form, or `None` for an address type we do not speak
async fn read_host<R>(r: &mut R, atyp: u8) -> Result<Option<String>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            r.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = r.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            r.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            r.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        _ => return Ok(None),
    };
    Ok(Some(host))
}

/// Reply with the bound address always reported as 0.0.0.0:0
async fn send_reply<W>(w: &mut W, rep: u8) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&[VERSION5, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    w.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ListenerKind;
    use crate::upstream::UpstreamDescriptor;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

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

    async fn start_proxy() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let route = AccountRoute {
            account: "tester@example.com".to_string(),
            kind: ListenerKind::Socks5,
            requested_port: 9888,
            port: 9888,
            upstream: Arc::new(UpstreamDescriptor::Direct),
            route_name: "direct".to_string(),
            cookies_file: None,
        };
        let ctx = GatewayContext::new("TestProxy/1.0", Duration::from_secs(5), Duration::from_secs(5));
        tokio::spawn(async move {
            let mut id = 0;
            while let Ok((stream, _)) = listener.accept().await {
                id += 1;
                let route = route.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let _ = handle_socks5(stream, &route, &ctx, id).await;
                });
            }
        });
        addr
    }

    async fn greet(proxy: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(&[VERSION5, 1, AUTH_NONE]).await.unwrap();
        let mut resp = [0u8; 2];
        stream.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [VERSION5, AUTH_NONE]);
        stream
    }

    async fn read_reply(stream: &mut TcpStream) -> [u8; 10] {
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_socks5_handshake_no_auth() {
        let proxy = start_proxy().await;
        let _stream = greet(proxy).await;
    }

    #[tokio::test]
    async fn test_socks5_handshake_reject() {
        let proxy = start_proxy().await;
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        // Username/password only.
        stream.write_all(&[VERSION5, 1, 0x02]).await.unwrap();
        let mut resp = [0u8; 2];
        stream.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [VERSION5, AUTH_NO_ACCEPT]);

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_socks4_greeting_is_dropped() {
        let proxy = start_proxy().await;
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(&[0x04, 0x01, 0x00, 0x50]).await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_socks5_connect_ipv4() {
        let echo = echo_server().await;
        let proxy = start_proxy().await;
        let mut stream = greet(proxy).await;

        let mut req = vec![VERSION5, CMD_CONNECT, 0x00, ATYP_IPV4, 127, 0, 0, 1];
        req.extend_from_slice(&echo.port().to_be_bytes());
        stream.write_all(&req).await.unwrap();

        let reply = read_reply(&mut stream).await;
        assert_eq!(reply, [VERSION5, REP_SUCCESS, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0]);

        stream.write_all(b"ping over socks").await.unwrap();
        let mut buf = [0u8; 15];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping over socks");
    }

    #[tokio::test]
    async fn test_socks5_connect_domain() {
        let echo = echo_server().await;
        let proxy = start_proxy().await;
        let mut stream = greet(proxy).await;

        let domain = b"localhost";
        let mut req = vec![VERSION5, CMD_CONNECT, 0x00, ATYP_DOMAIN, domain.len() as u8];
        req.extend_from_slice(domain);
        req.extend_from_slice(&echo.port().to_be_bytes());
        stream.write_all(&req).await.unwrap();

        let reply = read_reply(&mut stream).await;
        assert_eq!(reply[1], REP_SUCCESS);

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_socks5_unknown_address_type() {
        let proxy = start_proxy().await;
        let mut stream = greet(proxy).await;
        stream
            .write_all(&[VERSION5, CMD_CONNECT, 0x00, 0x02, 1, 2, 3, 4])
            .await
            .unwrap();
        let reply = read_reply(&mut stream).await;
        assert_eq!(reply[1], REP_ADDR_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_socks5_unsupported_command() {
        let proxy = start_proxy().await;
        let mut stream = greet(proxy).await;
        // BIND
        stream
            .write_all(&[VERSION5, 0x02, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let reply = read_reply(&mut stream).await;
        assert_eq!(reply[1], REP_CMD_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_socks5_refused_destination() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let proxy = start_proxy().await;
        let mut stream = greet(proxy).await;
        let mut req = vec![VERSION5, CMD_CONNECT, 0x00, ATYP_IPV4, 127, 0, 0, 1];
        req.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&req).await.unwrap();

        let reply = read_reply(&mut stream).await;
        assert_eq!(reply[1], REP_CONN_REFUSED);
    }

    #[tokio::test]
    async fn read_host_renders_ipv6_canonically() {
        let mut raw: &[u8] = &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let host = read_host(&mut raw, ATYP_IPV6).await.unwrap();
        assert_eq!(host.as_deref(), Some("::1"));

        let mut raw: &[u8] = &[];
        assert_eq!(read_host(&mut raw, 0x09).await.unwrap(), None);
    }
}
