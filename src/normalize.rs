use url::Url;

/// normalize a relay URL: http(s) becomes ws(s), a missing scheme becomes wss (ws for local
/// addresses), the host is lowercased and trailing slashes are dropped from the path.
///
/// relays are keyed by the string form of this URL
pub fn normalize_url(url_str: &str) -> Result<Url, url::ParseError> {
    let url_str = url_str.trim();
    let url_str = match url_str.split_once("://") {
        Some((scheme, _))
            if scheme.eq_ignore_ascii_case("wss") || scheme.eq_ignore_ascii_case("ws") =>
        {
            url_str.to_string()
        }
        Some((scheme, rest))
            if scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("http") =>
        {
            let secure = scheme.len() == 5;
            format!("{}://{}", if secure { "wss" } else { "ws" }, rest)
        }
        Some(_) => return Err(url::ParseError::RelativeUrlWithoutBase),
        None => {
            if url_str.starts_with("localhost")
                || url_str.contains(".localhost")
                || url_str.starts_with("127.0.0.1")
            {
                format!("ws://{}", url_str)
            } else {
                format!("wss://{}", url_str)
            }
        }
    };
    let mut url = Url::parse(&url_str)?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(url::ParseError::EmptyHost);
    }

    // the url crate already lowercases domains, this covers the rest
    if let Some(host) = url.host_str() {
        let _ = url.set_host(Some(&host.to_lowercase()));
    }

    let path = url.path().trim_end_matches('/').to_owned();
    url.set_path(&path);
    url.set_fragment(None);

    Ok(url)
}

/// the machine-readable prefix of an OK/CLOSED message (`"rate-limited"` in
/// `"rate-limited: slow down"`), if it has one
pub fn ok_message_prefix(message: &str) -> Option<&str> {
    let (prefix, _) = message.split_once(": ")?;
    if prefix.is_empty() || prefix.contains(' ') {
        None
    } else {
        Some(prefix)
    }
}
