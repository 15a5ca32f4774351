//! CONNECT-IP negotiation codec.
//!
//! The request is the upgrade form carried over the first bidirectional
//! stream: a CONNECT line for `/vpn` plus the MASQUE headers, terminated by
//! a blank line. The response mirrors HTTP status semantics (200/400/401/
//! 500). After a 200 the server sends one length-prefixed JSON control
//! message (the session grant), and from then on the stream carries tunnel
//! packets.

use bauta_core::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Path every CONNECT-IP request must target.
pub const CONNECT_PATH: &str = "/vpn";
/// Largest accepted header block or control message.
const MAX_HEADER_BLOCK: usize = 8192;

/// Parsed CONNECT-IP request.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Request method (`CONNECT` for conforming clients).
    pub method: String,
    /// Request path.
    pub path: String,
    /// Headers with lowercased names.
    pub headers: Vec<(String, String)>,
}

impl ConnectRequest {
    /// A request is MASQUE when it carries the capsule-protocol marker or
    /// the masque upgrade token.
    pub fn is_masque(&self) -> bool {
        self.header("capsule-protocol")
            .is_some_and(|v| v.contains("?masque"))
            || self
                .header("upgrade")
                .is_some_and(|v| v.eq_ignore_ascii_case("masque"))
    }

    /// First header value by lowercased name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Server verdict on a CONNECT-IP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResponse {
    /// Negotiation succeeded; the stream turns into a packet tunnel.
    Ok,
    /// Missing or unknown client identity.
    Unauthorized,
    /// Not a MASQUE request.
    BadRequest,
    /// The address pool is exhausted.
    PoolExhausted,
}

impl ConnectResponse {
    pub fn status(self) -> u16 {
        match self {
            ConnectResponse::Ok => 200,
            ConnectResponse::Unauthorized => 401,
            ConnectResponse::BadRequest => 400,
            ConnectResponse::PoolExhausted => 500,
        }
    }

    fn reason(self) -> &'static str {
        match self {
            ConnectResponse::Ok => "OK",
            ConnectResponse::Unauthorized => "Unauthorized",
            ConnectResponse::BadRequest => "Bad Request",
            ConnectResponse::PoolExhausted => "Internal Server Error",
        }
    }
}

/// Assigned prefix and advertised routes, sent after a 200.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGrant {
    /// The client's /32 (or /128) host prefix.
    pub assigned: IpNet,
    /// The VPN gateway, used as next hop by the client's route shims.
    pub gateway: std::net::IpAddr,
    /// Networks to route through the tunnel, verbatim from server config.
    pub routes: Vec<IpNet>,
}

/// Write the CONNECT-IP upgrade request.
pub async fn write_request<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    let request = format!(
        "CONNECT {CONNECT_PATH} HTTP/3\r\n\
         capsule-protocol: ?masque\r\n\
         upgrade: masque\r\n\
         connection: Upgrade\r\n\
         \r\n"
    );
    w.write_all(request.as_bytes()).await?;
    Ok(())
}

/// Read and parse a CONNECT-IP request.
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<ConnectRequest> {
    let block = read_header_block(r).await?;
    let mut lines = block.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| Error::protocol("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::protocol("missing method"))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| Error::protocol("missing path"))?
        .to_string();

    let headers = parse_headers(lines)?;
    Ok(ConnectRequest {
        method,
        path,
        headers,
    })
}

/// Write the response headers for a verdict.
pub async fn write_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    response: ConnectResponse,
) -> Result<()> {
    let mut head = format!("HTTP/3 {} {}\r\n", response.status(), response.reason());
    if response == ConnectResponse::Ok {
        head.push_str("content-type: application/masque\r\n");
    }
    head.push_str("\r\n");
    w.write_all(head.as_bytes()).await?;
    Ok(())
}

/// Read the response headers and return the numeric status.
///
/// Only an exact status of 200 completes negotiation; the permissive
/// "contains OK" match some deployments used is intentionally not honoured.
pub async fn read_response<R: AsyncRead + Unpin>(r: &mut R) -> Result<u16> {
    let block = read_header_block(r).await?;
    let status_line = block
        .split("\r\n")
        .next()
        .ok_or_else(|| Error::protocol("empty response"))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|tok| tok.parse::<u16>().ok())
        .ok_or_else(|| Error::protocol(format!("malformed status line: {status_line}")))?;
    Ok(status)
}

/// Send the session grant as one length-prefixed JSON document.
pub async fn write_grant<W: AsyncWrite + Unpin>(w: &mut W, grant: &SessionGrant) -> Result<()> {
    let body =
        serde_json::to_vec(grant).map_err(|e| Error::protocol(format!("encode grant: {e}")))?;
    if body.len() > MAX_HEADER_BLOCK {
        return Err(Error::protocol("grant too large"));
    }
    w.write_u16(body.len() as u16).await?;
    w.write_all(&body).await?;
    Ok(())
}

/// Read the session grant.
pub async fn read_grant<R: AsyncRead + Unpin>(r: &mut R) -> Result<SessionGrant> {
    let len = r.read_u16().await? as usize;
    if len > MAX_HEADER_BLOCK {
        return Err(Error::protocol("grant too large"));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| Error::protocol(format!("decode grant: {e}")))
}

/// Read bytes until the blank line, one at a time so no tunnel bytes are
/// consumed past the header block.
async fn read_header_block<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let mut block = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !block.ends_with(b"\r\n\r\n") {
        if block.len() >= MAX_HEADER_BLOCK {
            return Err(Error::protocol("header block too large"));
        }
        r.read_exact(&mut byte).await?;
        block.push(byte[0]);
    }
    block.truncate(block.len() - 4);
    String::from_utf8(block).map_err(|_| Error::protocol("header block is not utf-8"))
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::protocol(format!("malformed header: {line}")))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }
    Ok(headers)
}
