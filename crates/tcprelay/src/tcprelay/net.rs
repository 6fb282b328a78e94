use std::{
    borrow::Cow,
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener},
};

use socket2::{Domain, Protocol, Socket, Type};

/// Normalize a bind/listen address.
///
/// Configs commonly use the shorthand `":PORT"` to mean "bind on all interfaces".
/// `SocketAddr` parsing does not accept `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Binds a non-blocking listener with `SO_REUSEADDR`, so a port given up by a previous
/// public listener can be taken again while old connections sit in `TIME_WAIT`.
pub fn bind_reusable(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    sock.bind(&addr.into())?;
    sock.listen(backlog)?;
    sock.set_nonblocking(true)?;
    Ok(sock.into())
}

/// Parses `host:port` where host must be a literal IPv4 address (or empty for
/// `0.0.0.0`). Registration frames only carry IPv4 targets.
pub fn parse_ipv4_target(s: &str) -> anyhow::Result<SocketAddrV4> {
    let s = normalize_bind_addr(s);
    s.parse::<SocketAddrV4>()
        .map_err(|_| anyhow::anyhow!("expected IPv4 host:port, got {s:?}"))
}

pub fn ipv4_or_unspecified(host: &str) -> anyhow::Result<Ipv4Addr> {
    let host = host.trim();
    if host.is_empty() {
        return Ok(Ipv4Addr::UNSPECIFIED);
    }
    host.parse()
        .map_err(|_| anyhow::anyhow!("expected IPv4 address, got {host:?}"))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::net::{SocketAddrV4, TcpListener};

    /// Returns distinct loopback addresses whose ports were free a moment ago.
    pub fn free_local_addrs(n: usize) -> Vec<SocketAddrV4> {
        let held: Vec<TcpListener> = (0..n)
            .map(|_| TcpListener::bind("127.0.0.1:0").expect("bind ephemeral"))
            .collect();
        held.iter()
            .map(|l| match l.local_addr().expect("local_addr") {
                std::net::SocketAddr::V4(a) => a,
                other => panic!("unexpected {other}"),
            })
            .collect()
    }

    pub fn free_local_addr() -> SocketAddrV4 {
        free_local_addrs(1).remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn parse_ipv4_target_rejects_hostnames_and_v6() {
        assert_eq!(
            parse_ipv4_target(":10086").unwrap(),
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 10086)
        );
        assert!(parse_ipv4_target("localhost:80").is_err());
        assert!(parse_ipv4_target("[::1]:80").is_err());
        assert_eq!(ipv4_or_unspecified("").unwrap(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn bind_reusable_rebinds_after_drop() {
        let addr = testing::free_local_addr();
        let first = bind_reusable(addr.into(), 1).unwrap();
        assert!(bind_reusable(addr.into(), 1).is_err());
        drop(first);
        let second = bind_reusable(addr.into(), 1).unwrap();
        assert_eq!(second.local_addr().unwrap(), SocketAddr::V4(addr));
    }
}
