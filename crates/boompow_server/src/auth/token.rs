#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::util::time::unix_secs_now;

/// Claims carried by bearer and reset-password tokens. `sub` is the account email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
	pub sub: String,
	pub exp: u64,
}

/// Verify a `v1.<payload>.<sig>` token and return its claims.
pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<TokenClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: TokenClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.exp <= unix_secs_now() {
		return Err(anyhow!("token expired"));
	}
	if claims.sub.trim().is_empty() {
		return Err(anyhow!("token subject is empty"));
	}

	Ok(claims)
}

/// Mint a token for `sub` valid for `ttl`.
#[cfg(test)]
pub fn issue_hmac_token(sub: &str, ttl: std::time::Duration, secret: &str) -> anyhow::Result<String> {
	let claims = TokenClaims {
		sub: sub.to_string(),
		exp: unix_secs_now().saturating_add(ttl.as_secs()),
	};
	let payload = serde_json::to_vec(&claims).context("encode token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig_b64 = URL_SAFE_NO_PAD.encode(sign(payload_b64.as_bytes(), secret.as_bytes()));
	Ok(format!("v1.{payload_b64}.{sig_b64}"))
}

/// Short, non-reversible token fingerprint for security logs.
pub fn fingerprint(token: &str) -> String {
	let digest = Sha256::digest(token.as_bytes());
	digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
