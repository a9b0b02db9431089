use std::fmt::{Debug, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::str::FromStr;
use anyhow::{anyhow, bail};

/// An IPv4 address and a UDP port. This is the only kind of address the transport deals with,
///  and it is a plain value: two addresses are the same peer iff ip and port are equal.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NetAddress {
    ip: u32,
    port: u16,
}

impl NetAddress {
    pub const DEFAULT_PORT: u16 = 27960;

    pub const fn new(ip: Ipv4Addr, port: u16) -> NetAddress {
        NetAddress {
            ip: ip.to_bits(),
            port,
        }
    }

    pub const fn localhost(port: u16) -> NetAddress {
        Self::new(Ipv4Addr::LOCALHOST, port)
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.ip)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parses `host[:port]`. The host is either a dotted quad, `localhost`, or a name that is
    ///  resolved to its first IPv4 address. The port defaults to [NetAddress::DEFAULT_PORT].
    pub fn parse(text: &str) -> anyhow::Result<NetAddress> {
        let text = text.trim();
        let (host, port) = match text.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>()
                    .map_err(|e| anyhow!("invalid port in address {:?}: {}", text, e))?;
                (host, port)
            }
            None => (text, Self::DEFAULT_PORT),
        };

        if host.is_empty() {
            bail!("missing host in address {:?}", text);
        }

        if let Ok(ip) = Ipv4Addr::from_str(host) {
            return Ok(NetAddress::new(ip, port));
        }
        if host.eq_ignore_ascii_case("localhost") {
            return Ok(NetAddress::localhost(port));
        }

        (host, port).to_socket_addrs()?
            .find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(NetAddress::from(v4)),
                SocketAddr::V6(_) => None,
            })
            .ok_or_else(|| anyhow!("host {:?} does not resolve to an IPv4 address", host))
    }

    pub fn format(&self) -> String {
        self.to_string()
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip(), self.port))
    }
}

impl Display for NetAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

impl Debug for NetAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self)
    }
}

impl FromStr for NetAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NetAddress::parse(s)
    }
}

impl From<SocketAddrV4> for NetAddress {
    fn from(addr: SocketAddrV4) -> Self {
        NetAddress::new(*addr.ip(), addr.port())
    }
}

impl TryFrom<SocketAddr> for NetAddress {
    type Error = anyhow::Error;

    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(v6) => Err(anyhow!("IPv6 address {} is not supported", v6)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::loopback("127.0.0.1:4000")]
    #[case::zero("0.0.0.0:0")]
    #[case::max("255.255.255.255:65535")]
    #[case::private("192.168.17.4:27960")]
    fn test_parse_format(#[case] text: &str) {
        let parsed = NetAddress::parse(text).unwrap();
        assert_eq!(parsed.format(), text);
        assert_eq!(NetAddress::parse(&parsed.format()).unwrap(), parsed);
    }

    #[rstest]
    #[case::localhost("localhost:5000", "127.0.0.1:5000")]
    #[case::localhost_upper("LOCALHOST:5001", "127.0.0.1:5001")]
    #[case::default_port("10.1.2.3", "10.1.2.3:27960")]
    #[case::localhost_default_port("localhost", "127.0.0.1:27960")]
    #[case::whitespace(" 10.1.2.3:9 ", "10.1.2.3:9")]
    fn test_parse_normalizing(#[case] text: &str, #[case] expected: &str) {
        assert_eq!(NetAddress::parse(text).unwrap(), NetAddress::parse(expected).unwrap());
    }

    #[rstest]
    #[case::empty("")]
    #[case::no_host(":80")]
    #[case::bad_port("1.2.3.4:abc")]
    #[case::port_too_big("1.2.3.4:70000")]
    fn test_parse_invalid(#[case] text: &str) {
        assert!(NetAddress::parse(text).is_err());
    }

    #[test]
    fn test_equality_by_value() {
        let a = NetAddress::new(Ipv4Addr::new(1, 2, 3, 4), 5);
        let b: NetAddress = "1.2.3.4:5".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, NetAddress::new(Ipv4Addr::new(1, 2, 3, 4), 6));
    }

    #[test]
    fn test_socket_addr_conversion() {
        let addr = NetAddress::localhost(1234);
        assert_eq!(NetAddress::try_from(addr.to_socket_addr()).unwrap(), addr);
        assert!(NetAddress::try_from("[::1]:1234".parse::<SocketAddr>().unwrap()).is_err());
    }
}
