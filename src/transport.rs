//! Address parsing (`network@address`, spec.md §6) and a small
//! boxed-stream abstraction so the rest of the crate doesn't need to be
//! generic over `TcpStream` vs `UnixStream`.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::Error;

/// Any duplex byte stream the codec can run over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Splits `network@address` into its two halves. Absence of `@` is
/// ill-formed (spec.md §4.5).
pub fn parse_address(addr: &str) -> Result<(&str, &str), Error> {
    addr.split_once('@')
        .ok_or_else(|| Error::Handshake(format!("ill-formed address, expected network@address: {}", addr)))
}

/// Connects to `network@address`. `tcp` and `unix` (unix targets only)
/// are supported; other network names are rejected.
pub async fn connect(addr: &str) -> Result<Box<dyn Stream>, Error> {
    let (network, address) = parse_address(addr)?;
    match network {
        "tcp" => {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        "unix" => {
            let stream = UnixStream::connect(address).await?;
            Ok(Box::new(stream))
        }
        other => Err(Error::Handshake(format!(
            "unsupported network {:?}, expected \"tcp\" or \"unix\"",
            other
        ))),
    }
}

/// Server-side counterpart of [`connect`]: binds a listener for
/// `network@address` and accepts connections as boxed streams.
pub enum Listener {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Listener {
    pub async fn bind(addr: &str) -> Result<Self, Error> {
        let (network, address) = parse_address(addr)?;
        match network {
            "tcp" => Ok(Listener::Tcp(tokio::net::TcpListener::bind(address).await?)),
            #[cfg(unix)]
            "unix" => Ok(Listener::Unix(tokio::net::UnixListener::bind(address)?)),
            other => Err(Error::Handshake(format!(
                "unsupported network {:?}, expected \"tcp\" or \"unix\"",
                other
            ))),
        }
    }

    pub async fn accept(&self) -> Result<(Box<dyn Stream>, String), Error> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                stream.set_nodelay(true).ok();
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(l) => {
                let (stream, _peer) = l.accept().await?;
                Ok((Box::new(stream), "unix".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_network_and_address() {
        assert_eq!(parse_address("tcp@127.0.0.1:8000").unwrap(), ("tcp", "127.0.0.1:8000"));
        assert_eq!(parse_address("unix@/tmp/rpc.sock").unwrap(), ("unix", "/tmp/rpc.sock"));
    }

    #[test]
    fn rejects_addresses_without_at() {
        let err = parse_address("127.0.0.1:8000").unwrap_err();
        assert!(err.to_string().contains("ill-formed"));
    }

    #[tokio::test]
    async fn rejects_unknown_network() {
        let err = match connect("sctp@127.0.0.1:1").await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("unsupported network"));
    }
}
