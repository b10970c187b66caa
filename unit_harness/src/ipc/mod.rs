//! Server IPC
//! ==========
//!
//! Transport addressing shared by the raw [`http::HttpClient`] and the JSON
//! [`control::ControlClient`].
//!
//! | Form                 | Transport                    |
//! |----------------------|------------------------------|
//! | `127.0.0.1:7080`     | TCP (IPv4)                   |
//! | `[::1]:7080`         | TCP (IPv6)                   |
//! | `unix:/tmp/x.sock`   | filesystem Unix socket       |
//! | `unix:@name`         | abstract Unix socket (Linux) |

pub mod control;
pub mod error;
pub mod http;

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    os::unix::net::UnixStream,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use socket2::{Domain, SockAddr, Socket, Type};

pub use error::*;

/// Longest `sun_path` accepted by Linux, minus the trailing NUL.
const UDS_MAX: usize = 107;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ControlAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
    /// Name in the kernel's abstract namespace, without the leading `@`.
    Abstract(String),
}

impl ControlAddr {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }

    /// Filesystem path the server creates for this address, if any.
    pub fn socket_path(&self) -> Option<&std::path::Path> {
        match self {
            Self::Unix(p) => Some(p),
            _ => None,
        }
    }

    /// Opens a blocking stream with `timeout` applied to connect (TCP) and to
    /// every read and write.
    pub fn connect(&self, timeout: Duration) -> Result<IpcStream> {
        debug_assert!(timeout > Duration::ZERO);
        let stream = match self {
            Self::Tcp(addr) => {
                let sock = Socket::new(Domain::for_address(*addr), Type::STREAM, None)?;
                sock.connect_timeout(&SockAddr::from(*addr), timeout)?;
                IpcStream::Tcp(sock.into())
            }
            Self::Unix(path) => {
                let sock = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                sock.connect(&SockAddr::unix(path)?)?;
                IpcStream::Unix(std::os::fd::OwnedFd::from(sock).into())
            }
            Self::Abstract(name) => IpcStream::Unix(connect_abstract(name)?),
        };
        stream.set_timeouts(timeout)?;
        Ok(stream)
    }
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    Ok(UnixStream::connect_addr(&addr)?)
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(name: &str) -> Result<UnixStream> {
    Err(ClientError::Address {
        addr: format!("unix:@{name}"),
        reason: "abstract sockets are only available on Linux".into(),
    })
}

impl std::fmt::Display for ControlAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Abstract(name) => write!(f, "unix:@{name}"),
        }
    }
}

impl FromStr for ControlAddr {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |reason: &str| ClientError::Address {
            addr: s.to_owned(),
            reason: reason.to_owned(),
        };
        if let Some(rest) = s.strip_prefix("unix:") {
            if let Some(name) = rest.strip_prefix('@') {
                if name.is_empty() {
                    return Err(bad("empty abstract name"));
                }
                return Ok(Self::Abstract(name.to_owned()));
            }
            if rest.is_empty() {
                return Err(bad("empty socket path"));
            }
            if rest.len() > UDS_MAX {
                return Err(bad("socket path exceeds the platform limit"));
            }
            return Ok(Self::Unix(PathBuf::from(rest)));
        }
        s.parse::<SocketAddr>()
            .map(Self::Tcp)
            .map_err(|e| bad(&e.to_string()))
    }
}

impl TryFrom<String> for ControlAddr {
    type Error = ClientError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ControlAddr> for String {
    fn from(value: ControlAddr) -> Self {
        value.to_string()
    }
}

impl cmdstruct::Arg for ControlAddr {
    fn append_arg(&self, cmd: &mut std::process::Command) {
        cmd.arg(self.to_string());
    }
}

/// Connected stream over either transport family.
#[derive(Debug)]
pub enum IpcStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl IpcStream {
    pub fn set_timeouts(&self, timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        match self {
            Self::Tcp(s) => s.set_write_timeout(Some(timeout)),
            Self::Unix(s) => s.set_write_timeout(Some(timeout)),
        }
    }

    pub fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_read_timeout(Some(timeout)),
            Self::Unix(s) => s.set_read_timeout(Some(timeout)),
        }
    }
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip_forms() {
        for s in ["127.0.0.1:7080", "[::1]:7080", "unix:/tmp/control.unit.sock", "unix:@unit"] {
            let addr: ControlAddr = s.parse().unwrap();
            assert_eq!(addr.to_string(), s);
        }
        assert_eq!(
            "unix:@unit".parse::<ControlAddr>().unwrap(),
            ControlAddr::Abstract("unit".into())
        );
        assert!(
            "unix:/tmp/control.unit.sock"
                .parse::<ControlAddr>()
                .unwrap()
                .socket_path()
                .is_some()
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        for s in ["unix:", "unix:@", "localhost", "127.0.0.1"] {
            assert!(
                matches!(s.parse::<ControlAddr>(), Err(ClientError::Address { .. })),
                "{s} should not parse"
            );
        }
        let long = format!("unix:/{}", "a".repeat(200));
        assert!(long.parse::<ControlAddr>().is_err());
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        let td = tempfile::tempdir().unwrap();
        let addr = ControlAddr::unix(td.path().join("absent.sock"));
        assert!(matches!(
            addr.connect(Duration::from_millis(200)),
            Err(ClientError::Io(_))
        ));
    }
}
