//! Proxy URL resolution
//!
//! Turns a configured proxy string into a structured descriptor the driver
//! can pass to the browser. Malformed input means "no proxy", never an error.

/// Structured proxy descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// `scheme://host:port`
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Parse `[scheme://][user:pass@]host:port`.
///
/// Scheme must be one of `http`, `https`, `socks5` and defaults to `http`
/// when omitted. Anything that does not fit the grammar yields `None`.
pub fn parse_proxy_url(raw: &str) -> Option<ProxyConfig> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let (scheme, rest) = match raw.split_once("://") {
        Some((s, rest)) if matches!(s, "http" | "https" | "socks5") => (s, rest),
        Some(_) => return None,
        None => ("http", raw),
    };

    let (creds, host_port) = match rest.rsplit_once('@') {
        Some((c, hp)) => (Some(c), hp),
        None => (None, rest),
    };

    let (host, port) = host_port.rsplit_once(':')?;
    if host.is_empty() || host.contains('/') {
        return None;
    }
    port.parse::<u16>().ok()?;

    let (username, password) = match creds {
        Some(c) => {
            let (user, pass) = c.split_once(':')?;
            if user.is_empty() || pass.is_empty() {
                return None;
            }
            (Some(user.to_string()), Some(pass.to_string()))
        }
        None => (None, None),
    };

    Some(ProxyConfig {
        server: format!("{}://{}:{}", scheme, host, port),
        username,
        password,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host_port_defaults_to_http() {
        let proxy = parse_proxy_url("1.2.3.4:8080").unwrap();
        assert_eq!(proxy.server, "http://1.2.3.4:8080");
        assert_eq!(proxy.username, None);
        assert_eq!(proxy.password, None);
    }

    #[test]
    fn test_credentials() {
        let proxy = parse_proxy_url("user:pass@1.2.3.4:8080").unwrap();
        assert_eq!(proxy.server, "http://1.2.3.4:8080");
        assert_eq!(proxy.username.as_deref(), Some("user"));
        assert_eq!(proxy.password.as_deref(), Some("pass"));
    }

    #[test]
    fn test_explicit_schemes() {
        let proxy = parse_proxy_url("socks5://proxy.example.com:1080").unwrap();
        assert_eq!(proxy.server, "socks5://proxy.example.com:1080");

        let proxy = parse_proxy_url("https://user:pw@proxy.example.com:443").unwrap();
        assert_eq!(proxy.server, "https://proxy.example.com:443");
        assert_eq!(proxy.username.as_deref(), Some("user"));
    }

    #[test]
    fn test_malformed_is_no_proxy() {
        assert_eq!(parse_proxy_url("not-a-proxy"), None);
        assert_eq!(parse_proxy_url(""), None);
        assert_eq!(parse_proxy_url("   "), None);
        assert_eq!(parse_proxy_url("ftp://1.2.3.4:21"), None);
        assert_eq!(parse_proxy_url("host:notaport"), None);
        assert_eq!(parse_proxy_url("host:99999"), None);
        assert_eq!(parse_proxy_url("useronly@host:8080"), None);
    }
}
