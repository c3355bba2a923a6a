//! Small helpers shared across modules.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

/// Quote `arg` for a POSIX shell.
///
/// - `"plain.txt"` → `"plain.txt"` (only safe characters, left alone)
/// - `"my file"` → `"'my file'"`
/// - `"it's"` → `"'it'\''s'"`
pub fn shell_quote(arg: &str) -> Cow<'_, str> {
    let safe = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"_-./=+,:@%".contains(&b));
    if safe {
        return Cow::Borrowed(arg);
    }
    Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
}

/// Last path component, for `Content-Disposition`.
pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(path)
}

/// Browser address as seen through a reverse proxy.
///
/// `X-Real-Ip` / `X-Real-Port` win, then the first `X-Forwarded-For` hop with
/// `X-Forwarded-Port`. Anything missing or unparseable falls back to the
/// socket peer address.
pub fn client_addr(headers: &HeaderMap, peer: SocketAddr) -> SocketAddr {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let ip = header("x-real-ip")
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
        .or_else(|| {
            header("x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .and_then(|v| v.trim().parse::<IpAddr>().ok())
        });
    let Some(ip) = ip else {
        return peer;
    };
    let port = header("x-real-port")
        .or_else(|| header("x-forwarded-port"))
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(peer.port());
    SocketAddr::new(ip, port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/a.txt"), "/tmp/a.txt");
        assert_eq!(shell_quote("my file"), "'my file'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("/var/log/syslog"), "syslog");
        assert_eq!(basename("notes.txt"), "notes.txt");
        assert_eq!(basename("/etc/"), "etc");
    }

    #[test]
    fn test_client_addr_prefers_real_ip() {
        let peer: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_addr(&headers, peer), peer);

        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 10.0.0.2"));
        assert_eq!(
            client_addr(&headers, peer),
            "1.2.3.4:4000".parse::<SocketAddr>().unwrap()
        );

        headers.insert("x-real-ip", HeaderValue::from_static("5.6.7.8"));
        headers.insert("x-real-port", HeaderValue::from_static("5555"));
        assert_eq!(
            client_addr(&headers, peer),
            "5.6.7.8:5555".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_client_addr_ignores_garbage() {
        let peer: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_addr(&headers, peer), peer);
    }
}
