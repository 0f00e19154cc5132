use log::{info, warn};

use crate::error::{LifecycleError, ProtocolError, TransportError};

pub const HEADER_LOCATION: &str = "location";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_CONTENT_LENGTH: &str = "content-length";

pub type Headers<'a> = [(&'a str, &'a str)];

pub trait HttpResponse {
    fn status(&self) -> u16;
    /// Case-insensitive lookup.
    fn header(&self, name: &str) -> Option<String>;
    /// `Ok(0)` marks the end of the body.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// One GET request per call. Implementations must not follow redirects
/// themselves; [`open_following_redirects`] does that with a bounded hop count.
pub trait HttpTransport: Send {
    fn get(&self, url: &str, headers: &Headers<'_>) -> Result<Box<dyn HttpResponse>, TransportError>;
}

pub fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

pub fn content_length(response: &dyn HttpResponse) -> Option<u64> {
    response
        .header(HEADER_CONTENT_LENGTH)
        .and_then(|value| value.trim().parse::<u64>().ok())
}

/// Follows up to `max_redirects` hops and returns the first non-redirect
/// response, whatever its status.
pub fn open_following_redirects<T: HttpTransport + ?Sized>(
    transport: &T,
    url: &str,
    headers: &Headers<'_>,
    max_redirects: u8,
) -> Result<Box<dyn HttpResponse>, TransportError> {
    let mut current = url.to_string();
    let mut hops = 0_u8;

    loop {
        let response = transport.get(&current, headers)?;
        let status = response.status();
        if !is_redirect(status) {
            if hops > 0 {
                info!("followed {hops} redirect(s) to final HTTP {status}");
            }
            return Ok(response);
        }

        let Some(location) = response.header(HEADER_LOCATION) else {
            return Err(TransportError::MissingLocation {
                url: current,
                status,
            });
        };
        drop(response);

        if hops >= max_redirects {
            warn!("giving up on {url} after {hops} redirect(s)");
            return Err(TransportError::TooManyRedirects {
                url: url.to_string(),
                limit: max_redirects,
            });
        }
        hops += 1;
        current = resolve_location(&current, location.trim());
    }
}

pub fn resolve_location(base: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.to_string();
    }

    let (scheme, rest) = base.split_once("://").unwrap_or(("https", base));
    if let Some(stripped) = location.strip_prefix("//") {
        return format!("{scheme}://{stripped}");
    }

    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let origin = format!("{scheme}://{}", &rest[..authority_end]);
    if location.starts_with('/') {
        return format!("{origin}{location}");
    }

    let path = &rest[authority_end..];
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let dir = match path.rfind('/') {
        Some(idx) => &path[..=idx],
        None => "/",
    };
    format!("{origin}{dir}{location}")
}

/// Reads the whole body, failing once it grows past `limit` bytes.
pub fn read_body_bounded(
    response: &mut dyn HttpResponse,
    limit: usize,
) -> Result<Vec<u8>, LifecycleError> {
    let mut body = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let read = response.read(&mut chunk)?;
        if read == 0 {
            return Ok(body);
        }
        if body.len() + read > limit {
            return Err(ProtocolError::BodyTooLarge { limit }.into());
        }
        body.extend_from_slice(&chunk[..read]);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{ScriptedResponse, ScriptedTransport};

    #[test]
    fn resolves_absolute_and_relative_locations() {
        let base = "https://api.example.com/repos/acme/fw/releases/assets/1?x=y";
        assert_eq!(
            resolve_location(base, "https://cdn.example.net/blob"),
            "https://cdn.example.net/blob"
        );
        assert_eq!(
            resolve_location(base, "//cdn.example.net/blob"),
            "https://cdn.example.net/blob"
        );
        assert_eq!(
            resolve_location(base, "/download/main.bin"),
            "https://api.example.com/download/main.bin"
        );
        assert_eq!(
            resolve_location(base, "2"),
            "https://api.example.com/repos/acme/fw/releases/assets/2"
        );
        assert_eq!(
            resolve_location("http://host", "file"),
            "http://host/file"
        );
    }

    #[test]
    fn follows_redirect_chain_within_limit() {
        let transport = ScriptedTransport::new();
        transport.redirect_chain("https://a.test/0", 3, ScriptedResponse::ok(b"payload".to_vec()));

        let mut response =
            open_following_redirects(&transport, "https://a.test/0", &[], 5).unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(read_body_bounded(response.as_mut(), 64).unwrap(), b"payload");
        assert_eq!(transport.requests().len(), 4);
    }

    #[test]
    fn chain_longer_than_limit_is_a_transport_error() {
        let transport = ScriptedTransport::new();
        transport.redirect_chain("https://a.test/0", 6, ScriptedResponse::ok(b"payload".to_vec()));

        let result = open_following_redirects(&transport, "https://a.test/0", &[], 5);
        assert!(matches!(
            result.err(),
            Some(TransportError::TooManyRedirects { limit: 5, .. })
        ));
        assert_eq!(transport.requests().len(), 6);
    }

    #[test]
    fn redirect_without_location_is_rejected() {
        let transport = ScriptedTransport::new();
        transport.route("https://a.test/x", ScriptedResponse::status(302));
        let result = open_following_redirects(&transport, "https://a.test/x", &[], 5);
        assert!(matches!(
            result.err(),
            Some(TransportError::MissingLocation { status: 302, .. })
        ));
    }

    #[test]
    fn bounded_read_rejects_oversized_bodies() {
        let mut response = ScriptedResponse::ok(vec![7_u8; 2048]).into_response();
        assert_eq!(
            read_body_bounded(response.as_mut(), 1000),
            Err(LifecycleError::Protocol(ProtocolError::BodyTooLarge {
                limit: 1000
            }))
        );
    }
}
