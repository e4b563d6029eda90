use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// Any byte stream a milter conversation can run over.
pub trait MilterStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> MilterStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn MilterStream>;

/// Socket address in milter notation: `unix:/path`, `inet:PORT@HOST`,
/// `inet6:PORT@HOST`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConnectionSpec {
    Unix(PathBuf),
    Inet { port: u16, host: Option<String> },
    Inet6 { port: u16, host: Option<String> },
}

impl FromStr for ConnectionSpec {
    type Err = String;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = spec
            .split_once(':')
            .ok_or_else(|| format!("missing socket type in connection spec <{spec}>"))?;
        match kind {
            "unix" | "local" => {
                if rest.is_empty() {
                    return Err(format!("missing socket path in <{spec}>"));
                }
                Ok(ConnectionSpec::Unix(PathBuf::from(rest)))
            }
            "inet" | "inet6" => {
                let (port, host) = match rest.split_once('@') {
                    Some((port, host)) => (port, Some(host)),
                    None => (rest, None),
                };
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port <{port}> in <{spec}>"))?;
                let host = host
                    .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
                    .filter(|h| !h.is_empty());
                if kind == "inet" {
                    Ok(ConnectionSpec::Inet { port, host })
                } else {
                    Ok(ConnectionSpec::Inet6 { port, host })
                }
            }
            other => Err(format!("unknown socket type <{other}> in <{spec}>")),
        }
    }
}

impl TryFrom<String> for ConnectionSpec {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConnectionSpec> for String {
    fn from(spec: ConnectionSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionSpec::Unix(path) => write!(f, "unix:{}", path.display()),
            ConnectionSpec::Inet { port, host: None } => write!(f, "inet:{port}"),
            ConnectionSpec::Inet { port, host: Some(host) } => write!(f, "inet:{port}@{host}"),
            ConnectionSpec::Inet6 { port, host: None } => write!(f, "inet6:{port}"),
            ConnectionSpec::Inet6 { port, host: Some(host) } => {
                write!(f, "inet6:{port}@[{host}]")
            }
        }
    }
}

impl ConnectionSpec {
    fn address(&self, default_host: &str) -> Option<String> {
        match self {
            ConnectionSpec::Unix(_) => None,
            ConnectionSpec::Inet { port, host } => {
                Some(format!("{}:{port}", host.as_deref().unwrap_or(default_host)))
            }
            ConnectionSpec::Inet6 { port, host } => {
                let host = host.as_deref().unwrap_or(if default_host == "0.0.0.0" {
                    "::"
                } else {
                    "::1"
                });
                Some(format!("[{host}]:{port}"))
            }
        }
    }

    pub async fn connect(&self) -> io::Result<BoxedStream> {
        match self {
            ConnectionSpec::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
            _ => {
                let address = self.address("127.0.0.1").unwrap_or_default();
                let stream = TcpStream::connect(address).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    pub async fn bind(&self) -> io::Result<Listener> {
        match self {
            ConnectionSpec::Unix(path) => {
                // Remove a stale socket left by a previous run
                if Path::new(path).exists() {
                    std::fs::remove_file(path)?;
                }
                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
            _ => {
                let address = self.address("0.0.0.0").unwrap_or_default();
                Ok(Listener::Tcp(TcpListener::bind(address).await?))
            }
        }
    }
}

/// Listening socket for MTA connections.
pub enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Accepts one connection, returning the stream and a printable peer.
    pub async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        match self {
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), "unix".to_string()))
            }
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
        }
    }

    pub fn local_spec(&self) -> io::Result<String> {
        match self {
            Listener::Unix(listener) => {
                let address = listener.local_addr()?;
                Ok(address
                    .as_pathname()
                    .map(|p| format!("unix:{}", p.display()))
                    .unwrap_or_else(|| "unix:".to_string()))
            }
            Listener::Tcp(listener) => {
                let address = listener.local_addr()?;
                Ok(match address {
                    std::net::SocketAddr::V4(v4) => format!("inet:{}@{}", v4.port(), v4.ip()),
                    std::net::SocketAddr::V6(v6) => format!("inet6:{}@[{}]", v6.port(), v6.ip()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_specs() {
        assert_eq!(
            "unix:/var/run/milter.sock".parse::<ConnectionSpec>().unwrap(),
            ConnectionSpec::Unix("/var/run/milter.sock".into())
        );
        assert_eq!(
            "local:/tmp/x".parse::<ConnectionSpec>().unwrap(),
            ConnectionSpec::Unix("/tmp/x".into())
        );
        assert_eq!(
            "inet:10025@[127.0.0.1]".parse::<ConnectionSpec>().unwrap(),
            ConnectionSpec::Inet {
                port: 10025,
                host: Some("127.0.0.1".into())
            }
        );
        assert_eq!(
            "inet:2525".parse::<ConnectionSpec>().unwrap(),
            ConnectionSpec::Inet {
                port: 2525,
                host: None
            }
        );
        assert_eq!(
            "inet6:10025@::1".parse::<ConnectionSpec>().unwrap(),
            ConnectionSpec::Inet6 {
                port: 10025,
                host: Some("::1".into())
            }
        );
    }

    #[test]
    fn test_invalid_specs() {
        assert!("/tmp/socket".parse::<ConnectionSpec>().is_err());
        assert!("inet:port@host".parse::<ConnectionSpec>().is_err());
        assert!("inet:70000".parse::<ConnectionSpec>().is_err());
        assert!("tcp:25".parse::<ConnectionSpec>().is_err());
        assert!("unix:".parse::<ConnectionSpec>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for spec in ["unix:/tmp/a.sock", "inet:25@mx.example.org", "inet6:25@[::1]", "inet:99"] {
            let parsed: ConnectionSpec = spec.parse().unwrap();
            let again: ConnectionSpec = parsed.to_string().parse().unwrap();
            assert_eq!(parsed, again);
        }
    }

    #[tokio::test]
    async fn test_bind_and_connect_tcp() {
        let spec: ConnectionSpec = "inet:0@127.0.0.1".parse().unwrap();
        let listener = spec.bind().await.unwrap();
        let local: ConnectionSpec = listener.local_spec().unwrap().parse().unwrap();
        let (client, server) = tokio::join!(local.connect(), listener.accept());
        assert!(client.is_ok());
        let (_, peer) = server.unwrap();
        assert!(peer.starts_with("127.0.0.1:"));
    }
}
