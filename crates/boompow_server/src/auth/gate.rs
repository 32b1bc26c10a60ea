#![forbid(unsafe_code)]

//! Capability checks over the resolved caller. No I/O.

use crate::auth::{AuthContext, TokenSource, TrustLevel};

fn with_trust(ctx: Option<&AuthContext>, trust: TrustLevel) -> Option<&AuthContext> {
	ctx.filter(|c| c.trust == trust)
}

/// Any interactively logged-in user.
pub fn authenticated_user(ctx: Option<&AuthContext>) -> Option<&AuthContext> {
	with_trust(ctx, TrustLevel::Jwt)
}

/// Verified provider, logged in interactively.
pub fn authorized_provider(ctx: Option<&AuthContext>) -> Option<&AuthContext> {
	with_trust(ctx, TrustLevel::Jwt)
		.filter(|c| c.identity.email_verified && c.identity.is_provider())
}

/// Verified requester allowed to submit work, logged in interactively.
pub fn authorized_requester(ctx: Option<&AuthContext>) -> Option<&AuthContext> {
	with_trust(ctx, TrustLevel::Jwt).filter(|c| can_submit_work(c))
}

/// Same business constraints as `authorized_requester`, but only for service tokens.
pub fn authorized_service_token(ctx: Option<&AuthContext>) -> Option<&AuthContext> {
	with_trust(ctx, TrustLevel::Token(TokenSource::Service)).filter(|c| can_submit_work(c))
}

/// Holder of a live password reset token. Service tokens never qualify.
pub fn authorized_change_password(ctx: Option<&AuthContext>) -> Option<&AuthContext> {
	with_trust(ctx, TrustLevel::Token(TokenSource::ResetPassword))
}

fn can_submit_work(ctx: &AuthContext) -> bool {
	ctx.identity.email_verified && ctx.identity.can_request_work && ctx.identity.is_requester()
}
