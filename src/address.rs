use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use anyhow::anyhow;
use tokio::net::{lookup_host, UdpSocket};
use tracing::debug;
use crate::protocol::DEFAULT_PORT;

/// Resolves `host`, `host:port`, an IP literal or `[ipv6]:port` to a socket address, using
///  [`DEFAULT_PORT`] if no port is given
pub async fn resolve_address(address: &str) -> anyhow::Result<SocketAddr> {
    let (host, port) = split_host_port(address)?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    lookup_host((host, port)).await?
        .next()
        .ok_or_else(|| anyhow!("address {} does not resolve", address))
}

/// Resolves a listen address. A host of `*` stands for this machine's preferred public
///  address, falling back to localhost.
pub async fn resolve_listen_address(address: &str) -> anyhow::Result<SocketAddr> {
    let (host, port) = split_host_port(address)?;
    if host == "*" {
        let ip = find_public_address().await
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        return Ok(SocketAddr::new(ip, port));
    }
    resolve_address(address).await
}

fn split_host_port(address: &str) -> anyhow::Result<(&str, u16)> {
    let address = address.trim();
    if address.is_empty() {
        return Err(anyhow!("empty address"));
    }

    if let Some(rest) = address.strip_prefix('[') {
        let (host, after) = rest.split_once(']')
            .ok_or_else(|| anyhow!("unterminated '[' in address {}", address))?;
        return match after.strip_prefix(':') {
            Some(port) => Ok((host, port.parse()?)),
            None if after.is_empty() => Ok((host, DEFAULT_PORT)),
            None => Err(anyhow!("invalid address {}", address)),
        };
    }

    // a bare IPv6 literal contains several colons and no port
    if address.matches(':').count() > 1 {
        return Ok((address, DEFAULT_PORT));
    }

    match address.split_once(':') {
        Some((host, port)) => Ok((host, port.parse()?)),
        None => Ok((address, DEFAULT_PORT)),
    }
}

/// The local address the OS would use to reach the internet. Connecting a UDP socket sends
///  nothing, it only picks a route.
async fn find_public_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 53)).await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    debug!("detected public address {}", ip);

    if ip.is_unspecified() || ip.is_loopback() {
        None
    }
    else {
        Some(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::host("example.org", "example.org", 3413)]
    #[case::host_port("example.org:80", "example.org", 80)]
    #[case::ipv4("127.0.0.1", "127.0.0.1", 3413)]
    #[case::ipv4_port("127.0.0.1:4000", "127.0.0.1", 4000)]
    #[case::ipv6("::1", "::1", 3413)]
    #[case::ipv6_brackets("[::1]", "::1", 3413)]
    #[case::ipv6_port("[::1]:9", "::1", 9)]
    #[case::star("*", "*", 3413)]
    #[case::star_port("*:5000", "*", 5000)]
    fn test_split_host_port(#[case] address: &str, #[case] host: &str, #[case] port: u16) {
        assert_eq!(split_host_port(address).unwrap(), (host, port));
    }

    #[rstest]
    #[case::empty("")]
    #[case::bad_port("host:abc")]
    #[case::port_too_big("host:70000")]
    #[case::unterminated("[::1")]
    fn test_split_host_port_invalid(#[case] address: &str) {
        assert!(split_host_port(address).is_err());
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        assert_eq!(resolve_address("127.0.0.1").await.unwrap(), "127.0.0.1:3413".parse().unwrap());
        assert_eq!(resolve_address("[::1]:7").await.unwrap(), "[::1]:7".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_listen_star() {
        let resolved = resolve_listen_address("*:4567").await.unwrap();
        assert_eq!(resolved.port(), 4567);
        assert!(!resolved.ip().is_unspecified());
    }
}
