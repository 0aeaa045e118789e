use axum::http::HeaderMap;
use std::net::SocketAddr;

/// Resolve the client address used to key rate limiters and PAKE attempt
/// counters. Proxy headers win over the socket peer so limits follow the
/// real client through a LAN reverse proxy.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    peer.ip().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.9:4321".parse().unwrap()
    }

    #[test]
    fn forwarded_for_takes_first_value() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "192.168.1.5, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "172.16.0.2".parse().unwrap());
        assert_eq!(client_ip(&headers, peer()), "192.168.1.5");
    }

    #[test]
    fn real_ip_beats_socket_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "172.16.0.2".parse().unwrap());
        assert_eq!(client_ip(&headers, peer()), "172.16.0.2");
    }

    #[test]
    fn falls_back_to_peer() {
        assert_eq!(client_ip(&HeaderMap::new(), peer()), "10.0.0.9");
    }
}
