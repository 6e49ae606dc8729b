//! The HTTP/1.1 upgrade handshake, server and client side.
//!
//! Both entry points run over any established bidirectional byte stream.
//! The server side validates the upgrade request, writes the `101 Switching
//! Protocols` response itself and keeps whatever bytes it over-read as the
//! prefix of the first frame. [`connect`] is a convenience that dials a
//! plain `ws://` URL with a tokio `TcpStream`; anything fancier (TLS, a
//! proxy) is the caller's business, hand the finished stream to [`client`].

use crate::connection::{Connection, Role};
use crate::error::Error;
use crate::extensions::{self, CompressionOptions};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use bytes::BytesMut;
use log::debug;
use rand::random;
use sha1::{Digest, Sha1};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use url::Url;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// Limits on the peer's HTTP head, so a connection that never finishes its
// handshake can't hold the socket or memory forever.
const MAX_HEAD_BYTES: usize = 16 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Computes the `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
pub fn generate_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

fn generate_websocket_key() -> String {
    let random_bytes: [u8; 16] = random();
    BASE64_STANDARD.encode(random_bytes)
}

/// Server-side handshake knobs.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// Subprotocols we speak, most preferred first. The first one the client
    /// also offered is selected.
    pub subprotocols: Vec<String>,
    /// Extra origins to allow besides the request's own host. `*` matches
    /// any run of characters, so `*.example.com` covers the subdomains.
    pub origin_patterns: Vec<String>,
    /// Skips origin checking entirely.
    pub insecure_skip_verify: bool,
    /// Enables permessage-deflate negotiation with these options as our
    /// side's demands.
    pub compression: Option<CompressionOptions>,
}

/// Client-side handshake knobs.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub subprotocols: Vec<String>,
    /// Sent as the `Origin` header when present.
    pub origin: Option<String>,
    /// Offers permessage-deflate with these options.
    pub compression: Option<CompressionOptions>,
}

/// Reads until the blank line ending the HTTP head, returning the head and
/// any bytes that arrived after it.
async fn read_head<S>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>), Error>
where
    S: AsyncRead + Unpin,
{
    let result = timeout(HANDSHAKE_TIMEOUT, async {
        let mut buf = BytesMut::with_capacity(1024);
        loop {
            if let Some(end) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
                let head = buf[..end + 4].to_vec();
                let leftover = buf[end + 4..].to_vec();
                return Ok((head, leftover));
            }
            if buf.len() > MAX_HEAD_BYTES {
                return Err(Error::OversizedHTTPMessage);
            }

            let mut tmp = [0u8; 1024];
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                return Err(Error::IncompleteHTTPMessage);
            }
            buf.extend_from_slice(&tmp[..n]);
        }
    })
    .await;

    match result {
        Ok(head) => head,
        Err(_) => Err(Error::IOError {
            source: io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"),
        }),
    }
}

fn header_value<'a>(headers: &[httparse::Header<'a>], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .and_then(|header| std::str::from_utf8(header.value).ok())
        .map(str::trim)
}

fn header_values<'a>(headers: &[httparse::Header<'a>], name: &str) -> Vec<&'a str> {
    headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case(name))
        .filter_map(|header| std::str::from_utf8(header.value).ok())
        .map(str::trim)
        .collect()
}

/// Whether any occurrence of a comma-separated header contains `token`.
fn header_contains_token(headers: &[httparse::Header<'_>], name: &str, token: &str) -> bool {
    header_values(headers, name)
        .iter()
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

/// Case-insensitive match where `*` covers any run of characters.
fn wildcard_match(pattern: &str, input: &str) -> bool {
    let pattern: Vec<u8> = pattern.to_ascii_lowercase().into_bytes();
    let input: Vec<u8> = input.to_ascii_lowercase().into_bytes();

    let (mut p, mut i) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while i < input.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, i));
            p += 1;
        } else if p < pattern.len() && pattern[p] == input[i] {
            p += 1;
            i += 1;
        } else if let Some((star_p, star_i)) = star {
            // Backtrack: let the last star swallow one more byte.
            p = star_p + 1;
            i = star_i + 1;
            star = Some((star_p, star_i + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

fn origin_allowed(origin: &str, host: Option<&str>, patterns: &[String]) -> bool {
    let authority = match Url::parse(origin) {
        Ok(url) => match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_owned(),
            _ => return false,
        },
        Err(_) => return false,
    };

    if let Some(host) = host {
        if authority.eq_ignore_ascii_case(host) {
            return true;
        }
    }
    patterns
        .iter()
        .any(|pattern| wildcard_match(pattern, &authority))
}

async fn reject<S>(stream: &mut S, status: &str, extra_headers: &str)
where
    S: AsyncWrite + Unpin,
{
    let response = format!("HTTP/1.1 {status}\r\n{extra_headers}Content-Length: 0\r\n\r\n");
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}

/// Accepts a WebSocket upgrade on an incoming stream with default options.
pub async fn accept<S>(stream: S) -> Result<Connection<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    accept_with_options(stream, AcceptOptions::default()).await
}

/// Accepts a WebSocket upgrade on an incoming stream.
///
/// Reads and validates the upgrade request and writes either the 101
/// response or an HTTP error before returning. The returned connection runs
/// in the server role over the same stream.
pub async fn accept_with_options<S>(
    mut stream: S,
    options: AcceptOptions,
) -> Result<Connection<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, leftover) = read_head(&mut stream).await?;
    let mut header_storage = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut header_storage);
    if request.parse(&head)?.is_partial() {
        reject(&mut stream, "400 Bad Request", "").await;
        return Err(Error::IncompleteHTTPMessage);
    }
    let headers = request.headers;

    // The upgrade is only defined for GET on HTTP/1.1 and later.
    if request.method != Some("GET") || request.version != Some(1) {
        reject(&mut stream, "400 Bad Request", "").await;
        return Err(Error::InvalidHTTPHandshake);
    }
    if !header_contains_token(headers, "Connection", "upgrade") {
        reject(&mut stream, "400 Bad Request", "").await;
        return Err(Error::NoConnectionHeaderPresent);
    }
    if !header_contains_token(headers, "Upgrade", "websocket") {
        reject(&mut stream, "400 Bad Request", "").await;
        return Err(Error::NoUpgradeHeaderPresent);
    }
    if header_value(headers, "Sec-WebSocket-Version") != Some("13") {
        reject(&mut stream, "400 Bad Request", "Sec-WebSocket-Version: 13\r\n").await;
        return Err(Error::UnsupportedWebsocketVersion);
    }
    let key = match header_value(headers, "Sec-WebSocket-Key") {
        Some(key) => key.to_owned(),
        None => {
            reject(&mut stream, "400 Bad Request", "").await;
            return Err(Error::NoSecWebsocketKey);
        }
    };

    // Browsers always send Origin; a mismatch against the request host means
    // some other site is scripting against us.
    if !options.insecure_skip_verify {
        if let Some(origin) = header_value(headers, "Origin") {
            let host = header_value(headers, "Host");
            if !origin_allowed(origin, host, &options.origin_patterns) {
                debug!("denied origin {origin}");
                reject(&mut stream, "403 Forbidden", "").await;
                return Err(Error::OriginNotAllowed(origin.to_owned()));
            }
        }
    }

    let client_protocols: Vec<String> = header_values(headers, "Sec-WebSocket-Protocol")
        .iter()
        .flat_map(|value| value.split(','))
        .map(|protocol| protocol.trim().to_owned())
        .collect();
    let subprotocol = options
        .subprotocols
        .iter()
        .find(|offered| {
            client_protocols
                .iter()
                .any(|requested| requested.eq_ignore_ascii_case(offered))
        })
        .cloned();

    let mut compression = None;
    let mut extensions_value = None;
    if let Some(server_options) = options.compression {
        let mut offers = Vec::new();
        for value in header_values(headers, "Sec-WebSocket-Extensions") {
            match extensions::parse_offers(value) {
                Ok(mut parsed) => offers.append(&mut parsed),
                Err(error) => {
                    reject(&mut stream, "400 Bad Request", "").await;
                    return Err(error);
                }
            }
        }
        if let Some((negotiated, value)) = extensions::negotiate(&offers, server_options) {
            compression = Some(negotiated);
            extensions_value = Some(value);
        }
    }

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        generate_accept_key(&key)
    );
    if let Some(protocol) = &subprotocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    if let Some(value) = &extensions_value {
        response.push_str(&format!("Sec-WebSocket-Extensions: {value}\r\n"));
    }
    response.push_str("\r\n");

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    debug!(
        "accepted websocket connection, subprotocol={subprotocol:?}, compression={}",
        compression.is_some()
    );
    Ok(Connection::new(
        stream,
        Role::Server,
        subprotocol,
        compression,
        leftover,
    ))
}

/// Performs the client side of the upgrade over an established stream with
/// default options. The URL supplies the request path and `Host` header.
pub async fn client<S>(stream: S, url: &str) -> Result<Connection<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    client_with_options(stream, url, ConnectOptions::default()).await
}

/// Performs the client side of the upgrade over an established stream.
pub async fn client_with_options<S>(
    mut stream: S,
    url: &str,
    options: ConnectOptions,
) -> Result<Connection<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let parsed = Url::parse(url)?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(Error::InvalidSchemeURL);
    }
    let host = parsed.host_str().ok_or(Error::URLNoHost)?;
    let host_field = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };
    let path = match parsed.query() {
        Some(query) => format!("{}?{}", parsed.path(), query),
        None => parsed.path().to_owned(),
    };

    let key = generate_websocket_key();
    let mut request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host_field}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {key}\r\n"
    );
    if let Some(origin) = &options.origin {
        request.push_str(&format!("Origin: {origin}\r\n"));
    }
    if !options.subprotocols.is_empty() {
        request.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            options.subprotocols.join(", ")
        ));
    }
    if let Some(requested) = options.compression {
        request.push_str(&format!(
            "Sec-WebSocket-Extensions: {}\r\n",
            extensions::format_params(requested)
        ));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let (head, leftover) = read_head(&mut stream).await?;
    let mut header_storage = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut header_storage);
    if response.parse(&head)?.is_partial() {
        return Err(Error::IncompleteHTTPMessage);
    }
    let headers = response.headers;

    if response.code != Some(101) {
        return Err(Error::NoUpgrade);
    }
    if !header_contains_token(headers, "Connection", "upgrade") {
        return Err(Error::NoConnectionHeaderPresent);
    }
    if !header_contains_token(headers, "Upgrade", "websocket") {
        return Err(Error::NoUpgradeHeaderPresent);
    }
    if header_value(headers, "Sec-WebSocket-Accept") != Some(generate_accept_key(&key).as_str()) {
        return Err(Error::InvalidAcceptKey);
    }

    let subprotocol = match header_value(headers, "Sec-WebSocket-Protocol") {
        Some(selected) => {
            if !options
                .subprotocols
                .iter()
                .any(|offered| offered.eq_ignore_ascii_case(selected))
            {
                return Err(Error::SubprotocolNotOffered(selected.to_owned()));
            }
            Some(selected.to_owned())
        }
        None => None,
    };

    let mut compression = None;
    if let Some(value) = header_value(headers, "Sec-WebSocket-Extensions") {
        let requested = match options.compression {
            Some(requested) => requested,
            None => return Err(Error::UnexpectedExtension(value.to_owned())),
        };
        compression = Some(extensions::parse_response(value, requested)?);
    }

    debug!(
        "websocket handshake complete, subprotocol={subprotocol:?}, compression={}",
        compression.is_some()
    );
    Ok(Connection::new(
        stream,
        Role::Client,
        subprotocol,
        compression,
        leftover,
    ))
}

/// Dials a plain `ws://` URL and performs the handshake with default
/// options.
pub async fn connect(url: &str) -> Result<Connection<TcpStream>, Error> {
    connect_with_options(url, ConnectOptions::default()).await
}

/// Dials a plain `ws://` URL and performs the handshake. For `wss` bring
/// your own TLS stream and use [`client_with_options`].
pub async fn connect_with_options(
    url: &str,
    options: ConnectOptions,
) -> Result<Connection<TcpStream>, Error> {
    let parsed = Url::parse(url)?;
    if parsed.scheme() != "ws" {
        return Err(Error::InvalidSchemeURL);
    }
    let host = parsed.host_str().ok_or(Error::URLNoHost)?;
    let port = parsed.port().unwrap_or(80);

    let stream = TcpStream::connect((host, port)).await?;
    client_with_options(stream, url, options).await
}
