use std::net::SocketAddr;

use axum::http::HeaderMap;

/// A short opaque string used only as an equality key for admission control.
/// Carries no semantic meaning beyond "same value means same caller".
pub type ClientId = String;

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

/// Derives a client identity from request headers in priority order: the
/// first non-empty of `X-Forwarded-For`, `X-Real-IP`, falling back to the
/// transport-level remote address. Pure function of its inputs.
pub fn identify(headers: &HeaderMap, remote: SocketAddr) -> ClientId {
	for name in [FORWARDED_FOR, REAL_IP] {
		if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
			// X-Forwarded-For may carry a comma-separated hop chain; the
			// first entry is the original client.
			let first = value.split(',').next().unwrap_or(value).trim();
			if !first.is_empty() {
				return first.to_string();
			}
		}
	}
	remote.to_string()
}

#[cfg(test)]
mod tests {
	use axum::http::HeaderValue;

	use super::*;

	fn addr() -> SocketAddr {
		"10.0.0.1:4000".parse().unwrap()
	}

	#[test]
	fn prefers_forwarded_for_over_everything() {
		let mut headers = HeaderMap::new();
		headers.insert(FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));
		headers.insert(REAL_IP, HeaderValue::from_static("5.6.7.8"));
		assert_eq!(identify(&headers, addr()), "1.2.3.4");
	}

	#[test]
	fn takes_first_hop_of_forwarded_chain() {
		let mut headers = HeaderMap::new();
		headers.insert(
			FORWARDED_FOR,
			HeaderValue::from_static("1.2.3.4, 9.9.9.9, 8.8.8.8"),
		);
		assert_eq!(identify(&headers, addr()), "1.2.3.4");
	}

	#[test]
	fn falls_back_to_real_ip() {
		let mut headers = HeaderMap::new();
		headers.insert(REAL_IP, HeaderValue::from_static("5.6.7.8"));
		assert_eq!(identify(&headers, addr()), "5.6.7.8");
	}

	#[test]
	fn empty_header_falls_through_to_remote_addr() {
		let mut headers = HeaderMap::new();
		headers.insert(FORWARDED_FOR, HeaderValue::from_static(""));
		assert_eq!(identify(&headers, addr()), addr().to_string());
	}

	#[test]
	fn falls_back_to_remote_addr() {
		let headers = HeaderMap::new();
		assert_eq!(identify(&headers, addr()), addr().to_string());
	}

	#[test]
	fn is_pure() {
		let mut headers = HeaderMap::new();
		headers.insert(FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));
		assert_eq!(identify(&headers, addr()), identify(&headers, addr()));
	}
}
