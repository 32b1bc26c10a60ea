#![forbid(unsafe_code)]

//! Listen addresses for `--bind` and the `*_bind` config keys.

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
	#[error("bind address must be non-empty")]
	Empty,

	#[error("only plain http listeners are supported: {0}")]
	Scheme(String),

	#[error("bind address cannot carry a path or query: {0}")]
	Path(String),

	#[error("bind address must be ip:port, hostnames are not resolved: {0}")]
	NotSocketAddr(String),

	#[error("bind port must be nonzero: {0}")]
	ZeroPort(String),
}

/// Accepts `ip:port` with an optional `http://` prefix and trailing slash.
pub fn parse_bind_addr(raw: &str) -> Result<SocketAddr, BindError> {
	let raw = raw.trim();
	if raw.is_empty() {
		return Err(BindError::Empty);
	}

	let addr = match raw.split_once("://") {
		Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") => rest,
		Some(_) => return Err(BindError::Scheme(raw.to_string())),
		None => raw,
	};
	let addr = addr.strip_suffix('/').unwrap_or(addr);
	if addr.contains(['/', '?', '#']) {
		return Err(BindError::Path(raw.to_string()));
	}

	let parsed: SocketAddr = addr.parse().map_err(|_| BindError::NotSocketAddr(raw.to_string()))?;
	if parsed.port() == 0 {
		return Err(BindError::ZeroPort(raw.to_string()));
	}
	Ok(parsed)
}
