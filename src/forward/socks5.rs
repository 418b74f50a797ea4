//! Minimal SOCKS5 subset for `Dynamic` forwarding (§4.6): greeting, then a
//! single `CONNECT` request. Every field read is "read exactly N bytes" so
//! fragmented TCP arrivals never corrupt the parse.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_OK: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_GENERAL_FAILURE: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_COMMAND_NOT_SUPPORTED: [u8; 10] = [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_ATYP_NOT_SUPPORTED: [u8; 10] = [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Runs the greeting and request phases. Returns the `host:port` the client
/// asked to reach, or `None` if the handshake was rejected (the rejection
/// reply has already been written and the caller should just close).
pub async fn negotiate<S>(stream: &mut S) -> io::Result<Option<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting_hdr = [0u8; 2];
    stream.read_exact(&mut greeting_hdr).await?;
    let (ver, nmethods) = (greeting_hdr[0], greeting_hdr[1] as usize);

    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if ver != VERSION || !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, 0xFF]).await?;
        return Ok(None);
    }
    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

    let mut request_hdr = [0u8; 4];
    stream.read_exact(&mut request_hdr).await?;
    let (rver, cmd, _rsv, atyp) = (
        request_hdr[0],
        request_hdr[1],
        request_hdr[2],
        request_hdr[3],
    );
    if rver != VERSION || cmd != CMD_CONNECT {
        stream.write_all(&REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Ok(None);
    }

    let addr = match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = read_port(stream).await?;
            format!("{}.{}.{}.{}:{port}", ip[0], ip[1], ip[2], ip[3])
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let port = read_port(stream).await?;
            format!("{}:{port}", String::from_utf8_lossy(&name))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = read_port(stream).await?;
            format!("[{}]:{port}", std::net::Ipv6Addr::from(ip))
        }
        _ => {
            stream.write_all(&REPLY_ATYP_NOT_SUPPORTED).await?;
            return Ok(None);
        }
    };

    Ok(Some(addr))
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

pub async fn reply_dial_failure<S: AsyncWrite + Unpin>(stream: &mut S) -> io::Result<()> {
    stream.write_all(&REPLY_GENERAL_FAILURE).await
}

pub async fn reply_success<S: AsyncWrite + Unpin>(stream: &mut S) -> io::Result<()> {
    stream.write_all(&REPLY_OK).await
}
