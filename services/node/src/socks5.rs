//! SOCKS5 proxy (RFC 1928) with username/password auth (RFC 1929).
//!
//! Only CONNECT is supported. Targets are dialed through the node's
//! [`Dialer`], so overlay peers are reachable by their overlay address.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::dialer::Dialer;
use crate::localapi::constant_time_eq;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;
const AUTH_OK: u8 = 0x00;
const AUTH_FAILED: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("invalid SOCKS version: {0}")]
    Version(u8),

    #[error("client does not offer username/password auth")]
    NoAcceptableMethod,

    #[error("invalid credentials")]
    BadCredentials,

    #[error("unsupported command: {0}")]
    Command(u8),

    #[error("unsupported address type: {0}")]
    AddressType(u8),

    #[error("dial {target}: {reason}")]
    Dial { target: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Requested destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// SOCKS5 server bound to one set of credentials.
pub struct Socks5Server {
    username: String,
    password: String,
    dialer: Arc<Dialer>,
}

impl Socks5Server {
    pub fn new(username: impl Into<String>, password: impl Into<String>, dialer: Arc<Dialer>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            dialer,
        }
    }

    /// Serve one client connection to completion.
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), Socks5Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.authenticate(&mut stream).await?;
        let target = read_request(&mut stream).await?;
        trace!(%target, "SOCKS5 CONNECT request parsed");

        let mut upstream = match self.dialer.dial("tcp", &target.to_string()).await {
            Ok(conn) => conn,
            Err(e) => {
                send_reply(&mut stream, REPLY_HOST_UNREACHABLE).await?;
                return Err(Socks5Error::Dial {
                    target: target.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        send_reply(&mut stream, REPLY_SUCCEEDED).await?;

        let (up, down) = copy_bidirectional(&mut stream, &mut upstream).await?;
        debug!(%target, bytes_up = up, bytes_down = down, "SOCKS5 relay finished");
        Ok(())
    }

    async fn authenticate<S>(&self, stream: &mut S) -> Result<(), Socks5Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // VER NMETHODS METHODS...
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(Socks5Error::Version(header[0]));
        }
        let mut methods = vec![0u8; header[1] as usize];
        stream.read_exact(&mut methods).await?;

        if !methods.contains(&AUTH_METHOD_PASSWORD) {
            stream
                .write_all(&[SOCKS5_VERSION, AUTH_METHOD_NO_ACCEPTABLE])
                .await?;
            return Err(Socks5Error::NoAcceptableMethod);
        }
        stream.write_all(&[SOCKS5_VERSION, AUTH_METHOD_PASSWORD]).await?;

        // VER ULEN UNAME PLEN PASSWD
        let mut ver = [0u8; 1];
        stream.read_exact(&mut ver).await?;
        if ver[0] != AUTH_PASSWORD_VERSION {
            return Err(Socks5Error::Version(ver[0]));
        }
        let username = read_short_string(stream).await?;
        let password = read_short_string(stream).await?;

        let user_ok = constant_time_eq(&username, self.username.as_bytes());
        let password_ok = constant_time_eq(&password, self.password.as_bytes());
        if !(user_ok && password_ok) {
            stream.write_all(&[AUTH_PASSWORD_VERSION, AUTH_FAILED]).await?;
            return Err(Socks5Error::BadCredentials);
        }
        stream.write_all(&[AUTH_PASSWORD_VERSION, AUTH_OK]).await?;
        Ok(())
    }
}

async fn read_short_string<S>(stream: &mut S) -> Result<Vec<u8>, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn read_request<S>(stream: &mut S) -> Result<TargetAddr, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // VER CMD RSV ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::Version(header[0]));
    }
    if header[1] != CMD_CONNECT {
        send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(Socks5Error::Command(header[1]));
    }

    let target = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        ATYP_DOMAIN => {
            let host = read_short_string(stream).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Domain(String::from_utf8_lossy(&host).into_owned(), port)
        }
        other => {
            send_reply(stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Err(Socks5Error::AddressType(other));
        }
    };
    Ok(target)
}

/// VER REP RSV ATYP BND.ADDR BND.PORT, with an unspecified bound address.
async fn send_reply<S>(stream: &mut S, reply: u8) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    let buf = [SOCKS5_VERSION, reply, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_request_domain() {
        let (mut client, mut server) = duplex(64);
        let mut req = vec![SOCKS5_VERSION, CMD_CONNECT, 0, ATYP_DOMAIN, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let target = read_request(&mut server).await.unwrap();
        assert_eq!(target, TargetAddr::Domain("example.com".into(), 443));
        assert_eq!(target.to_string(), "example.com:443");
    }

    #[tokio::test]
    async fn test_read_request_ipv6() {
        let (mut client, mut server) = duplex(64);
        let ip: Ipv6Addr = "fd7a:115c:a1e0::2".parse().unwrap();
        let mut req = vec![SOCKS5_VERSION, CMD_CONNECT, 0, ATYP_IPV6];
        req.extend_from_slice(&ip.octets());
        req.extend_from_slice(&22u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let target = read_request(&mut server).await.unwrap();
        assert_eq!(target, TargetAddr::Ip(SocketAddr::new(ip.into(), 22)));
        assert_eq!(target.to_string(), "[fd7a:115c:a1e0::2]:22");
    }

    #[tokio::test]
    async fn test_bind_command_rejected() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[SOCKS5_VERSION, 0x02, 0, ATYP_IPV4, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();

        let err = read_request(&mut server).await.unwrap_err();
        assert!(matches!(err, Socks5Error::Command(0x02)));

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_COMMAND_NOT_SUPPORTED);
    }
}
