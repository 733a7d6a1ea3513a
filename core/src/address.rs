//! Base URL validation and package path normalization.

use url::{ParseError, Position, Url};

use crate::error::{OpaError, Result};

/// Validate `input` and reduce it to scheme, authority and path.
///
/// A missing scheme is treated as `http`. Query string and fragment are
/// dropped. Returns the URL used as the join base for every request.
pub fn parse_base_url(input: &str) -> Result<Url> {
    let mut url = match Url::parse(input) {
        // "localhost:8181" parses with scheme "localhost" and path "8181".
        Ok(url) if looks_like_host_port(&url) => parse_with_http(input)?,
        Ok(url) => url,
        Err(ParseError::RelativeUrlWithoutBase) => parse_with_http(input)?,
        Err(err) => return Err(OpaError::InvalidUrl(format!("malformed URL `{input}`: {err}"))),
    };

    match url.host_str() {
        Some(host) if !host.is_empty() => {}
        _ => {
            return Err(OpaError::InvalidUrl(format!(
                "malformed URL `{input}`: missing hostname"
            )))
        }
    }
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(OpaError::InvalidUrl(format!(
            "invalid scheme '{}'",
            url.scheme()
        )));
    }

    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn looks_like_host_port(url: &Url) -> bool {
    url.cannot_be_a_base()
        && url
            .path()
            .split('/')
            .next()
            .is_some_and(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}

fn parse_with_http(input: &str) -> Result<Url> {
    Url::parse(&format!("http://{input}"))
        .map_err(|err| OpaError::InvalidUrl(format!("malformed URL `{input}`: {err}")))
}

/// Canonical text form of a base URL: `scheme://authority/path`, with the
/// lone root path omitted so `localhost` renders as `http://localhost`.
pub fn canonical(url: &Url) -> String {
    let text = &url[..Position::AfterPath];
    if url.path() == "/" {
        text.strip_suffix('/').unwrap_or(text).to_string()
    } else {
        text.to_string()
    }
}

/// Turn a dotted package (`a.b.c`) into a slash path (`a/b/c`).
pub fn package_path(package: &str) -> String {
    package.replace('.', "/").trim_start_matches('/').to_string()
}
