//! Normalized credential token

use serde::{Deserialize, Serialize};

/// Which authentication scheme a token drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    /// Bare JWT, sent as `Authorization: Bearer <jwt>`
    Access,
    /// Composite `user_id::jwt`, sent as the `WorkosCursorSessionToken` cookie
    Session,
}

/// Claims decoded from a JWT payload segment
///
/// Only the claims this pipeline acts on; everything else in the payload
/// is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct TokenClaims {
    pub sub: Option<String>,
    #[serde(rename = "type")]
    pub token_type: Option<String>,
    pub exp: Option<i64>,
}

/// A single canonical credential produced by the resolver
///
/// Exactly one kind is set. A `Session` token always has the form
/// `user_id::jwt`; when it was constructed locally from an access token it
/// is valid only for outbound API calls and must never be treated as a
/// server-issued session credential.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedToken {
    pub kind: TokenKind,
    /// The exact string used for outbound calls
    pub raw: String,
    /// Present when derivable from claims or the composite form
    pub user_id: Option<String>,
    /// Decoded payload, present for tokens that carry a parseable JWT
    pub claims: Option<TokenClaims>,
}

impl ResolvedToken {
    /// A bare-JWT access token
    pub fn access(raw: impl Into<String>, user_id: Option<String>, claims: TokenClaims) -> Self {
        Self {
            kind: TokenKind::Access,
            raw: raw.into(),
            user_id,
            claims: Some(claims),
        }
    }

    /// A composite session token, server-issued or locally constructed
    pub fn session(raw: impl Into<String>, user_id: Option<String>, claims: Option<TokenClaims>) -> Self {
        Self {
            kind: TokenKind::Session,
            raw: raw.into(),
            user_id,
            claims,
        }
    }

    /// The bare JWT portion, for either kind
    pub fn jwt(&self) -> &str {
        match self.kind {
            TokenKind::Access => &self.raw,
            TokenKind::Session => self
                .raw
                .split_once("::")
                .map(|(_, jwt)| jwt)
                .unwrap_or(&self.raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_jwt_extraction() {
        let token = ResolvedToken::session("user_123::eyJabc", Some("user_123".into()), None);
        assert_eq!(token.jwt(), "eyJabc");
    }

    #[test]
    fn test_access_jwt_is_raw() {
        let token = ResolvedToken::access("eyJabc", None, TokenClaims::default());
        assert_eq!(token.jwt(), "eyJabc");
    }
}
