/// Socket domain parameterisation for the epoll stressor
use crate::config::types::{Result, StressError, MAX_STRESS_PORT, MIN_STRESS_PORT};
use nix::sys::socket::{AddressFamily, SockaddrIn, SockaddrIn6, SockaddrLike, UnixAddr};
use std::net::{Ipv6Addr, SocketAddrV6};
use std::path::{Path, PathBuf};

/// Most listening ports any domain uses per instance
pub const MAX_SERVERS: u16 = 4;

/// Prefix of unix-domain socket file names
pub const SOCKET_FILE_PREFIX: &str = "stressbox";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketDomain {
    Ipv4,
    Ipv6,
    Unix,
}

impl SocketDomain {
    pub const ALL: [SocketDomain; 3] = [Self::Ipv4, Self::Ipv6, Self::Unix];

    pub fn name(self) -> &'static str {
        match self {
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
            Self::Unix => "unix",
        }
    }

    /// Look a domain up by name
    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| {
                StressError::Config(format!(
                    "socket domain must be one of: {}",
                    Self::ALL.map(|d| d.name()).join(" ")
                ))
            })
    }

    /// Listening ports per instance. IP domains spread connections over four
    /// ports to widen the 4-tuple space so TIME_WAIT entries run out later.
    pub fn max_servers(self) -> u16 {
        match self {
            Self::Ipv4 | Self::Ipv6 => MAX_SERVERS,
            Self::Unix => 1,
        }
    }

    pub fn family(self) -> AddressFamily {
        match self {
            Self::Ipv4 => AddressFamily::Inet,
            Self::Ipv6 => AddressFamily::Inet6,
            Self::Unix => AddressFamily::Unix,
        }
    }

    /// First port owned by `instance`
    pub fn first_port(self, base: u16, instance: u32) -> u32 {
        base as u32 + self.max_servers() as u32 * instance
    }

    /// Port used by server `child` of `instance`
    pub fn server_port(self, base: u16, child: u16, instance: u32) -> u16 {
        (self.first_port(base, instance) + child as u32) as u16
    }
}

impl std::fmt::Display for SocketDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Largest base port that still leaves room for every instance's servers
pub fn max_base_port(domain: SocketDomain, instances: u32) -> u32 {
    (MAX_STRESS_PORT as u32).saturating_sub(domain.max_servers() as u32 * instances)
}

/// Reject a base port whose instance/server expansion leaves the port space
pub fn check_port_range(base: u16, domain: SocketDomain, instances: u32) -> Result<()> {
    let max = max_base_port(domain, instances);
    if base < MIN_STRESS_PORT || base as u32 > max {
        return Err(StressError::Config(format!(
            "epoll-port {} must be in the range {}..{} for {} instance(s) of {} servers",
            base,
            MIN_STRESS_PORT,
            max,
            instances,
            domain.max_servers()
        )));
    }
    Ok(())
}

/// Socket file for a unix-domain instance: `<dir>/stressbox-<ppid>-<instance>`
pub fn unix_socket_path(dir: &Path, ppid: u32, instance: u32) -> PathBuf {
    dir.join(format!("{}-{}-{}", SOCKET_FILE_PREFIX, ppid, instance))
}

/// Concrete socket address for one endpoint
#[derive(Clone, Debug)]
pub enum Endpoint {
    V4(SockaddrIn),
    V6(SockaddrIn6),
    Unix(UnixAddr),
}

impl Endpoint {
    /// Address a server binds: the wildcard address, or the socket file
    pub fn listen(domain: SocketDomain, port: u16, path: &Path) -> Result<Self> {
        Ok(match domain {
            SocketDomain::Ipv4 => Self::V4(SockaddrIn::new(0, 0, 0, 0, port)),
            SocketDomain::Ipv6 => Self::V6(SockaddrIn6::from(SocketAddrV6::new(
                Ipv6Addr::UNSPECIFIED,
                port,
                0,
                0,
            ))),
            SocketDomain::Unix => Self::unix(path)?,
        })
    }

    /// Address a client connects to: loopback, or the socket file
    pub fn loopback(domain: SocketDomain, port: u16, path: &Path) -> Result<Self> {
        Ok(match domain {
            SocketDomain::Ipv4 => Self::V4(SockaddrIn::new(127, 0, 0, 1, port)),
            SocketDomain::Ipv6 => Self::V6(SockaddrIn6::from(SocketAddrV6::new(
                Ipv6Addr::LOCALHOST,
                port,
                0,
                0,
            ))),
            SocketDomain::Unix => Self::unix(path)?,
        })
    }

    fn unix(path: &Path) -> Result<Self> {
        UnixAddr::new(path)
            .map(Self::Unix)
            .map_err(|e| StressError::Config(format!("socket path {}: {}", path.display(), e)))
    }

    pub fn as_sockaddr(&self) -> &dyn SockaddrLike {
        match self {
            Self::V4(a) => a,
            Self::V6(a) => a,
            Self::Unix(a) => a,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_counts_match_descriptors() {
        assert_eq!(SocketDomain::from_name("ipv4").unwrap().max_servers(), 4);
        assert_eq!(SocketDomain::from_name("ipv6").unwrap().max_servers(), 4);
        assert_eq!(SocketDomain::from_name("unix").unwrap().max_servers(), 1);
    }

    #[test]
    fn unknown_domain_lists_choices() {
        let err = SocketDomain::from_name("sctp").unwrap_err().to_string();
        assert!(err.contains("ipv4 ipv6 unix"), "{}", err);
    }

    #[test]
    fn ports_are_partitioned_per_instance() {
        let d = SocketDomain::Ipv4;
        assert_eq!(d.server_port(6000, 0, 0), 6000);
        assert_eq!(d.server_port(6000, 3, 0), 6003);
        assert_eq!(d.server_port(6000, 0, 1), 6004);
        assert_eq!(SocketDomain::Unix.server_port(6000, 0, 2), 6002);
    }

    #[test]
    fn port_range_leaves_room_for_every_server() {
        assert!(check_port_range(6000, SocketDomain::Ipv4, 8).is_ok());
        assert!(check_port_range(65535 - 32, SocketDomain::Ipv4, 8).is_ok());
        assert!(check_port_range(65535 - 31, SocketDomain::Ipv4, 8).is_err());
        assert!(check_port_range(1023, SocketDomain::Unix, 1).is_err());
    }

    #[test]
    fn unix_path_is_namespaced() {
        let p = unix_socket_path(Path::new("/tmp"), 42, 3);
        assert_eq!(p, PathBuf::from("/tmp/stressbox-42-3"));
    }

    #[test]
    fn endpoints_carry_the_right_family() {
        let path = Path::new("/tmp/stressbox-endpoint-test");
        for domain in SocketDomain::ALL {
            let ep = Endpoint::loopback(domain, 7000, path).unwrap();
            assert_eq!(ep.as_sockaddr().family(), Some(domain.family()));
        }
    }
}
