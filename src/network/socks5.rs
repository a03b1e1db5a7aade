//! Minimal SOCKS5 client: no authentication, IPv4 CONNECT only.

use std::net::{IpAddr, Ipv4Addr};

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};

use crate::error::NetError;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;

/// Resolves `host` to its first IPv4 address.
pub async fn resolve_ipv4(host: &str, port: u16) -> Result<Ipv4Addr, NetError> {
    lookup_host((host, port))
        .await?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| NetError::InvalidPeerAddress(format!("{} has no IPv4 address", host)))
}

/// Runs the client side of a CONNECT exchange on an already open proxy stream.
pub async fn handshake<S>(stream: &mut S, target: Ipv4Addr, port: u16) -> Result<(), NetError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Err(NetError::Socks5(format!("proxy refused no-auth method: {:02x?}", reply)));
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4];
    request.extend_from_slice(&target.octets());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let [_version, rep, _reserved, atyp] = head;
    // drain the bound address so the stream starts at the peer's first byte
    let bound_len = if atyp == ATYP_IPV4 {
        4
    } else {
        stream.read_u8().await? as usize
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;

    if rep != 0 {
        return Err(NetError::Socks5(format!("connect to {}:{} failed with reply {}", target, port, rep)));
    }
    debug!("socks5 tunnel to {}:{} established", target, port);
    Ok(())
}

/// Opens a tunnel to `host:port` through the proxy at `proxy_host:proxy_port`.
pub async fn connect(proxy_host: &str, proxy_port: u16, host: &str, port: u16) -> Result<TcpStream, NetError> {
    let target = resolve_ipv4(host, port).await?;
    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;
    handshake(&mut stream, target, port).await?;
    Ok(stream)
}
