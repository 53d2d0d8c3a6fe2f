//! Target dialer: resolve (if needed) and dial a CONNECT address,
//! classifying the outcome into the single reply byte carried back in
//! CONNECT_REPLY.

use std::{io, net::SocketAddr, time::Duration};

use codec::address::Address;
use tokio::net::{self, TcpStream};

/// Reply byte for CONNECT_REPLY, per the wire protocol.
pub const REPLY_SUCCESS: u8 = 0x00;
pub const REPLY_GENERIC_FAILURE: u8 = 0x01;
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;

/// Bound on both DNS resolution and the TCP connect itself.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Dial `address`, returning the connected socket on success or the
/// classified reply byte on failure. Never retries: one failed attempt
/// terminates the CONNECT.
pub async fn dial(address: &Address) -> Result<TcpStream, u8> {
    let socket_addr = resolve(address).await?;

    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(socket_addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(classify(&e)),
        Err(_elapsed) => Err(REPLY_GENERIC_FAILURE),
    }
}

/// Resolve `address` to a single [`SocketAddr`]. IPv4/IPv6 literals never
/// touch the resolver; only `DOMAIN` addresses do.
async fn resolve(address: &Address) -> Result<SocketAddr, u8> {
    match address {
        Address::V4(ip, port) => Ok(SocketAddr::new((*ip).into(), *port)),
        Address::V6(ip, port) => Ok(SocketAddr::new((*ip).into(), *port)),
        Address::Domain(domain, port) => {
            let host = String::from_utf8_lossy(domain).into_owned();

            let lookup = tokio::time::timeout(DIAL_TIMEOUT, net::lookup_host((host, *port)))
                .await
                .map_err(|_elapsed| REPLY_HOST_UNREACHABLE)?
                .map_err(|_e| REPLY_HOST_UNREACHABLE)?;

            lookup
                .into_iter()
                .next()
                .ok_or(REPLY_HOST_UNREACHABLE)
        }
    }
}

/// Map a failed-dial [`io::Error`] to a reply byte. Unmapped errno groups
/// fall through to the generic failure code, per the wire protocol.
fn classify(e: &io::Error) -> u8 {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
        io::ErrorKind::NetworkUnreachable => REPLY_NETWORK_UNREACHABLE,
        io::ErrorKind::HostUnreachable => REPLY_HOST_UNREACHABLE,
        io::ErrorKind::TimedOut => REPLY_GENERIC_FAILURE,
        _ => REPLY_GENERIC_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dials_a_listening_port() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let accept = tokio::spawn(async move { listener.accept().await });

        let address = Address::V4(Ipv4Addr::LOCALHOST, port);
        let stream = dial(&address).await;
        assert!(stream.is_ok());

        accept.await??;
        Ok(())
    }

    #[tokio::test]
    async fn refuses_an_unbound_port() -> anyhow::Result<()> {
        // Bind then immediately drop to get a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        drop(listener);

        let address = Address::V4(Ipv4Addr::LOCALHOST, port);
        let err = dial(&address).await.unwrap_err();
        assert_eq!(err, REPLY_CONNECTION_REFUSED);
        Ok(())
    }

    #[tokio::test]
    async fn dns_failure_is_host_unreachable() {
        let address = Address::Domain(b"nonexistent.invalid".to_vec(), 80);
        let err = dial(&address).await.unwrap_err();
        assert_eq!(err, REPLY_HOST_UNREACHABLE);
    }
}
