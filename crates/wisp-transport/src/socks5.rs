//! SOCKS5 handshake for stream hosts (RFC 1928 subset).
//!
//! Only what bytestream establishment needs: no-auth method, CONNECT command,
//! domain-name destination carrying the session [`DstAddr`] with port 0.
//!
//! ```text
//! Client                              Server
//!   | -- 05 01 00 -------------------> |   greeting (no-auth)
//!   | <------------------- 05 00 ----- |   method selected
//!   | -- 05 01 00 03 len dst 00 00 --> |   CONNECT dst:0
//!   | <-- 05 00 00 03 len dst 00 00 -- |   reply echoes dst
//! ```

use crate::candidate::DstAddr;
use crate::error::{TransportError, TransportResult};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS protocol version
pub const SOCKS_VERSION: u8 = 0x05;
/// "No authentication required" method
pub const AUTH_NO_AUTH: u8 = 0x00;
/// "No acceptable methods" method
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;
/// IPv4 address type
pub const ADDR_IPV4: u8 = 0x01;
/// Domain name address type
pub const ADDR_DOMAIN: u8 = 0x03;
/// IPv6 address type
pub const ADDR_IPV6: u8 = 0x04;
/// Request granted
pub const REPLY_SUCCESS: u8 = 0x00;
/// General SOCKS server failure
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
/// Host unreachable (used for unknown destination addresses)
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
/// Command not supported
pub const REPLY_CMD_NOT_SUPPORTED: u8 = 0x07;
/// Address type not supported
pub const REPLY_ADDR_NOT_SUPPORTED: u8 = 0x08;

fn handshake_err(message: impl Into<String>) -> TransportError {
    TransportError::Handshake(message.into())
}

/// Run the client side of the handshake on an established connection.
///
/// Succeeds only if the server grants the CONNECT and its bound address
/// echoes `dst`.
pub async fn client_handshake<S>(stream: &mut S, dst: &DstAddr) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, 1, AUTH_NO_AUTH])
        .await?;

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method[0] != SOCKS_VERSION {
        return Err(handshake_err(format!(
            "unsupported SOCKS version: {}",
            method[0]
        )));
    }
    if method[1] != AUTH_NO_AUTH {
        return Err(handshake_err("server requires authentication"));
    }

    let mut request = Vec::with_capacity(7 + dst.as_str().len());
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ADDR_DOMAIN]);
    request.push(dst.as_str().len() as u8);
    request.extend_from_slice(dst.as_str().as_bytes());
    request.extend_from_slice(&0u16.to_be_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(handshake_err("invalid SOCKS version in reply"));
    }
    if head[1] != REPLY_SUCCESS {
        return Err(handshake_err(format!(
            "stream host refused CONNECT (reply {:#04x})",
            head[1]
        )));
    }

    let (bound, _port) = read_address(stream, head[3]).await?;
    if bound != dst.as_str() {
        return Err(handshake_err(format!(
            "bound address mismatch: expected {}, got {}",
            dst.short(),
            bound
        )));
    }

    Ok(())
}

/// Run the server side of the handshake up to (not including) the reply.
///
/// Returns the requested destination. Protocol violations are answered with
/// the matching failure reply before the error is returned; the caller sends
/// the final reply with [`send_reply`] once it has matched the destination.
pub async fn accept_request<S>(stream: &mut S) -> TransportResult<DstAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 1 version + 1 nmethods + 255 methods
    let mut buf = [0u8; 257];

    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(handshake_err(format!(
            "unsupported SOCKS version: {}",
            buf[0]
        )));
    }

    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;
    if !buf[..nmethods].contains(&AUTH_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(handshake_err("no acceptable authentication method"));
    }
    stream.write_all(&[SOCKS_VERSION, AUTH_NO_AUTH]).await?;

    stream.read_exact(&mut buf[..4]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(handshake_err("invalid SOCKS version in request"));
    }

    let cmd = buf[1];
    let atyp = buf[3];

    if cmd != CMD_CONNECT {
        send_reply(stream, REPLY_CMD_NOT_SUPPORTED, None).await?;
        return Err(handshake_err(format!("unsupported command: {cmd}")));
    }
    if atyp != ADDR_DOMAIN {
        send_reply(stream, REPLY_ADDR_NOT_SUPPORTED, None).await?;
        return Err(handshake_err(format!(
            "unsupported address type: {atyp}"
        )));
    }

    let (raw, _port) = read_address(stream, atyp).await?;
    match DstAddr::parse(&raw) {
        Some(dst) => Ok(dst),
        None => {
            send_reply(stream, REPLY_HOST_UNREACHABLE, None).await?;
            Err(handshake_err("destination is not a session address"))
        }
    }
}

/// Send a SOCKS5 reply.
///
/// Success replies echo `bound` as a domain address; everything else uses
/// `0.0.0.0:0`.
pub async fn send_reply<S>(stream: &mut S, reply: u8, bound: Option<&DstAddr>) -> TransportResult<()>
where
    S: AsyncWrite + Unpin,
{
    let mut response = vec![SOCKS_VERSION, reply, 0x00];
    match bound {
        Some(dst) => {
            response.push(ADDR_DOMAIN);
            response.push(dst.as_str().len() as u8);
            response.extend_from_slice(dst.as_str().as_bytes());
        }
        None => {
            response.push(ADDR_IPV4);
            response.extend_from_slice(&[0, 0, 0, 0]);
        }
    }
    response.extend_from_slice(&0u16.to_be_bytes());
    stream.write_all(&response).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_address<S>(stream: &mut S, atyp: u8) -> TransportResult<(String, u16)>
where
    S: AsyncRead + Unpin,
{
    let host = match atyp {
        ADDR_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ADDR_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| handshake_err("invalid domain name encoding"))?
        }
        other => return Err(handshake_err(format!("unsupported address type: {other}"))),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((host, u16::from_be_bytes(port)))
}
