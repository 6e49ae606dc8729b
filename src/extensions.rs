//! `Sec-WebSocket-Extensions` negotiation for permessage-deflate.
//!
//! Each side may ask the other to throw away its sliding window after every
//! message with the `client_no_context_takeover` and
//! `server_no_context_takeover` parameters. If either side asserts one, it is
//! honored. The `client_max_window_bits` and `server_max_window_bits`
//! parameters are accepted but not acted upon, since common deflate
//! implementations only operate with the full 15-bit window anyway. Anything
//! else inside a permessage-deflate offer fails the handshake.

use crate::error::Error;

pub(crate) const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

/// The context-takeover parameters fixed by the handshake.
///
/// `client_no_context_takeover` makes the client reset its compression
/// context after every message, which in turn makes the server reset its
/// decompression context. `server_no_context_takeover` is the mirror image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionOptions {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
}

/// One parsed permessage-deflate offer from an extensions header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DeflateOffer {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
}

/// Parses one `Sec-WebSocket-Extensions` header value, which may carry
/// several comma-separated offers. Offers for extensions we don't implement
/// are skipped; a recognized offer with an unknown parameter is an error.
pub(crate) fn parse_offers(value: &str) -> Result<Vec<DeflateOffer>, Error> {
    let mut offers = Vec::new();
    for offer_str in value.split(',') {
        let mut parts = offer_str.split(';').map(str::trim);
        let name = parts.next().unwrap_or_default();
        if !name.eq_ignore_ascii_case(PERMESSAGE_DEFLATE) {
            continue;
        }

        let mut offer = DeflateOffer::default();
        for param in parts {
            if param.is_empty() {
                continue;
            }
            let (key, _value) = match param.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim())),
                None => (param, None),
            };
            if key.eq_ignore_ascii_case(CLIENT_NO_CONTEXT_TAKEOVER) {
                offer.client_no_context_takeover = true;
            } else if key.eq_ignore_ascii_case(SERVER_NO_CONTEXT_TAKEOVER) {
                offer.server_no_context_takeover = true;
            } else if key.eq_ignore_ascii_case(CLIENT_MAX_WINDOW_BITS)
                || key.eq_ignore_ascii_case(SERVER_MAX_WINDOW_BITS)
            {
                // Accepted but ignored, we always run a 15-bit window.
            } else {
                return Err(Error::UnknownExtensionParameter(key.to_owned()));
            }
        }
        offers.push(offer);
    }
    Ok(offers)
}

/// Server-side negotiation: picks the first usable offer and merges it with
/// the locally configured options. Returns the negotiated options together
/// with the header value to echo back.
pub(crate) fn negotiate(
    offers: &[DeflateOffer],
    options: CompressionOptions,
) -> Option<(CompressionOptions, String)> {
    let offer = offers.first()?;
    let negotiated = CompressionOptions {
        client_no_context_takeover: offer.client_no_context_takeover
            || options.client_no_context_takeover,
        server_no_context_takeover: offer.server_no_context_takeover
            || options.server_no_context_takeover,
    };
    Some((negotiated, format_params(negotiated)))
}

/// The header value a client sends to offer compression, and a server sends
/// to confirm it.
pub(crate) fn format_params(options: CompressionOptions) -> String {
    let mut value = String::from(PERMESSAGE_DEFLATE);
    if options.client_no_context_takeover {
        value.push_str("; ");
        value.push_str(CLIENT_NO_CONTEXT_TAKEOVER);
    }
    if options.server_no_context_takeover {
        value.push_str("; ");
        value.push_str(SERVER_NO_CONTEXT_TAKEOVER);
    }
    value
}

/// Client-side validation of the server's `Sec-WebSocket-Extensions`
/// response. The server may assert takeover parameters we didn't ask for,
/// and we must honor them; any extension other than permessage-deflate is a
/// handshake failure.
pub(crate) fn parse_response(
    value: &str,
    requested: CompressionOptions,
) -> Result<CompressionOptions, Error> {
    let mut parts = value.split(';').map(str::trim);
    let name = parts.next().unwrap_or_default();
    if !name.eq_ignore_ascii_case(PERMESSAGE_DEFLATE) || value.contains(',') {
        return Err(Error::UnexpectedExtension(value.to_owned()));
    }

    let mut negotiated = requested;
    for param in parts {
        if param.is_empty() {
            continue;
        }
        let key = match param.split_once('=') {
            Some((key, _)) => key.trim(),
            None => param,
        };
        if key.eq_ignore_ascii_case(CLIENT_NO_CONTEXT_TAKEOVER) {
            negotiated.client_no_context_takeover = true;
        } else if key.eq_ignore_ascii_case(SERVER_NO_CONTEXT_TAKEOVER) {
            negotiated.server_no_context_takeover = true;
        } else if key.eq_ignore_ascii_case(CLIENT_MAX_WINDOW_BITS)
            || key.eq_ignore_ascii_case(SERVER_MAX_WINDOW_BITS)
        {
            // Accepted but ignored.
        } else {
            return Err(Error::UnknownExtensionParameter(key.to_owned()));
        }
    }
    Ok(negotiated)
}
