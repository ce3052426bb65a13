//! Magic tokens: signed, turn-bound control signals.
//!
//! An agent ends every turn by emitting a token that says whether the host
//! loop should continue, stop, or abort. The host only trusts that signal if
//! the token verifies against the exact turn it was emitted in.
//!
//! Wire form: `<<MAGIC:v1.<claims>.<signature>>>`, where `<claims>` is the
//! URL-safe unpadded base64 of the JSON claims and `<signature>` the Ed25519
//! signature over the `<claims>` text.
//!
//! # Key scope
//!
//! Each [`MagicTokens`] owns one Ed25519 key pair generated from the OS RNG
//! when it is built, i.e. once per root interpreter. The key is never
//! persisted or exported: tokens bind a signal to one running session, they
//! are not identity credentials. Rotating the key means building a new root.

pub mod replay;

use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::TurnContext;
pub use replay::{ReplayCache, DEFAULT_REPLAY_CAPACITY};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

pub const TOKEN_PREFIX: &str = "<<MAGIC:";
pub const TOKEN_SUFFIX: &str = ">>";
const TOKEN_VERSION: u8 = 1;

/// Token kind the host loop accepts as a turn terminator.
pub const LOOP_KIND: &str = "loop";

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("turn output does not end with a control token")]
    Missing,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("bad signature")]
    BadSignature,
    #[error("token signed by unknown key '{0}'")]
    UnknownKey(String),
    #[error("token belongs to another session")]
    SessionMismatch,
    #[error("token minted for turn {found}, expected turn {expected}")]
    TurnMismatch { expected: u32, found: u32 },
    #[error("token nonce does not match this turn")]
    NonceMismatch,
    #[error("token expired")]
    Expired,
    #[error("token already consumed")]
    Replayed,
    #[error("unexpected token kind '{found}' (expected '{expected}')")]
    WrongKind { expected: String, found: String },
    #[error("missing required key '{0}'")]
    MissingKey(&'static str),
    #[error("key '{key}' must be a {expected}")]
    WrongType { key: &'static str, expected: &'static str },
    #[error("unknown action '{0}' (expected continue, done or abort)")]
    InvalidAction(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("no turn context bound; tokens can only be minted during a turn")]
    MissingTurnContext,
}

/// What the agent asks the host loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Continue,
    Done,
    Abort,
}

impl FromStr for ControlAction {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" => Ok(ControlAction::Continue),
            "done" => Ok(ControlAction::Done),
            "abort" => Ok(ControlAction::Abort),
            other => Err(TokenError::InvalidAction(other.to_string())),
        }
    }
}

/// The signed assertion carried by a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPayload {
    pub action: ControlAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Value>,
}

impl ControlPayload {
    pub fn new(action: ControlAction) -> Self {
        Self {
            action,
            request: None,
            telemetry: None,
        }
    }

    /// Builds a payload from the `params` map given to the minting tool.
    ///
    /// `action` is required and must be a string; `request` and `telemetry`
    /// are optional and taken as-is.
    pub fn from_params(params: &Value) -> Result<Self, TokenError> {
        let map = params.as_object().ok_or(TokenError::WrongType {
            key: "params",
            expected: "map",
        })?;
        let action = match map.get("action") {
            None | Some(Value::Null) => return Err(TokenError::MissingKey("action")),
            Some(Value::String(s)) => s.parse::<ControlAction>()?,
            Some(_) => {
                return Err(TokenError::WrongType {
                    key: "action",
                    expected: "string",
                })
            }
        };
        Ok(Self {
            action,
            request: map.get("request").cloned(),
            telemetry: map.get("telemetry").cloned(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    v: u8,
    kind: String,
    #[serde(flatten)]
    payload: ControlPayload,
    sid: String,
    turn: u32,
    nonce: String,
    kid: String,
    /// Issued-at, unix millis.
    iat: i64,
    /// Expiry, unix millis.
    exp: i64,
}

/// A token that passed every check.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedToken {
    pub kind: String,
    pub payload: ControlPayload,
    pub issued_at: i64,
    pub expires_at: i64,
}

/// Returns true if `line` has the outer shape of a token.
///
/// Used to strip tokens from turn output; says nothing about validity.
pub fn looks_like_token(line: &str) -> bool {
    let t = line.trim();
    t.starts_with(TOKEN_PREFIX)
        && t.ends_with(TOKEN_SUFFIX)
        && t.len() > TOKEN_PREFIX.len() + TOKEN_SUFFIX.len()
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Token minter and verifier for one root interpreter.
pub struct MagicTokens {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    key_id: String,
    ttl: Duration,
    replay: ReplayCache,
}

impl std::fmt::Debug for MagicTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MagicTokens")
            .field("key_id", &self.key_id)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl MagicTokens {
    /// Generates a fresh process-lifetime key pair.
    pub fn generate(ttl: Duration, replay_capacity: usize) -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();
        let key_id = hex::encode(&Sha256::digest(verifying_key.as_bytes())[..8]);
        debug!("Generated token signing key {key_id}");
        Self {
            signing_key,
            verifying_key,
            key_id,
            ttl,
            replay: ReplayCache::new(replay_capacity),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn replay_cache(&self) -> &ReplayCache {
        &self.replay
    }

    pub fn mint(
        &self,
        kind: &str,
        payload: &ControlPayload,
        ctx: &TurnContext,
    ) -> Result<String, TokenError> {
        self.mint_at(kind, payload, ctx, now_millis())
    }

    /// Mints a token as if the current time were `now` (unix millis).
    pub fn mint_at(
        &self,
        kind: &str,
        payload: &ControlPayload,
        ctx: &TurnContext,
        now: i64,
    ) -> Result<String, TokenError> {
        if ctx.key_id != self.key_id {
            return Err(TokenError::UnknownKey(ctx.key_id.clone()));
        }
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let claims = Claims {
            v: TOKEN_VERSION,
            kind: kind.to_string(),
            payload: payload.clone(),
            sid: ctx.session_id.clone(),
            turn: ctx.turn_index,
            nonce: ctx.turn_nonce.clone(),
            kid: self.key_id.clone(),
            iat: now,
            exp: now.saturating_add(ttl_ms),
        };
        let json = serde_json::to_vec(&claims).map_err(|e| TokenError::Signing(e.to_string()))?;
        let encoded = B64.encode(json);
        let signature = self.signing_key.sign(encoded.as_bytes());
        Ok(format!(
            "{TOKEN_PREFIX}v{TOKEN_VERSION}.{encoded}.{}{TOKEN_SUFFIX}",
            B64.encode(signature.to_bytes())
        ))
    }

    pub fn parse_and_verify(
        &self,
        text: &str,
        expected: &TurnContext,
    ) -> Result<VerifiedToken, TokenError> {
        self.verify_at(text, expected, now_millis())
    }

    /// Verifies a token as if the current time were `now` (unix millis).
    ///
    /// On success the token's binding is recorded in the replay cache, so a
    /// second verification of the same token fails.
    pub fn verify_at(
        &self,
        text: &str,
        expected: &TurnContext,
        now: i64,
    ) -> Result<VerifiedToken, TokenError> {
        let result = self.check(text, expected, now);
        if let Err(ref e) = result {
            warn!("Token rejected for {expected}: {e}");
        }
        result
    }

    fn check(
        &self,
        text: &str,
        expected: &TurnContext,
        now: i64,
    ) -> Result<VerifiedToken, TokenError> {
        let body = text
            .trim()
            .strip_prefix(TOKEN_PREFIX)
            .and_then(|t| t.strip_suffix(TOKEN_SUFFIX))
            .ok_or_else(|| TokenError::Malformed("missing token delimiters".to_string()))?;

        let mut parts = body.split('.');
        let (Some(version), Some(encoded), Some(sig_text), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed("expected three dot-separated parts".to_string()));
        };
        if version != format!("v{TOKEN_VERSION}") {
            return Err(TokenError::Malformed(format!("unsupported version '{version}'")));
        }

        let sig_bytes = B64
            .decode(sig_text)
            .map_err(|e| TokenError::Malformed(format!("signature encoding: {e}")))?;
        let sig_array: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| TokenError::Malformed("signature length".to_string()))?;
        let signature = Signature::from_bytes(&sig_array);
        self.verifying_key
            .verify(encoded.as_bytes(), &signature)
            .map_err(|_| TokenError::BadSignature)?;

        let json = B64
            .decode(encoded)
            .map_err(|e| TokenError::Malformed(format!("claims encoding: {e}")))?;
        let claims: Claims = serde_json::from_slice(&json)
            .map_err(|e| TokenError::Malformed(format!("claims: {e}")))?;

        if claims.v != TOKEN_VERSION {
            return Err(TokenError::Malformed(format!("claims version {}", claims.v)));
        }
        if claims.kid != self.key_id || claims.kid != expected.key_id {
            return Err(TokenError::UnknownKey(claims.kid));
        }
        if claims.sid != expected.session_id {
            return Err(TokenError::SessionMismatch);
        }
        if claims.turn != expected.turn_index {
            return Err(TokenError::TurnMismatch {
                expected: expected.turn_index,
                found: claims.turn,
            });
        }
        if claims.nonce != expected.turn_nonce {
            return Err(TokenError::NonceMismatch);
        }
        if now >= claims.exp {
            return Err(TokenError::Expired);
        }

        let replay_key = format!("{}:{}:{}", claims.sid, claims.turn, claims.nonce);
        if !self.replay.insert(&replay_key, now, claims.exp) {
            return Err(TokenError::Replayed);
        }

        debug!("Token verified for {expected}: {:?}", claims.payload.action);
        Ok(VerifiedToken {
            kind: claims.kind,
            payload: claims.payload,
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }
}
