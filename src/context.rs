//! Turn-scoped host context.
//!
//! Passed explicitly to everything that needs to know which turn it is
//! running in: tool dispatch, token minting, token verification.

use std::fmt;

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnContext {
    /// Stable across a whole `ask` call.
    pub session_id: String,
    /// Starts at 1, increases by one per turn.
    pub turn_index: u32,
    /// Fresh per turn; binds control tokens to this turn only.
    pub turn_nonce: String,
    /// Identifier of the key tokens are signed with.
    pub key_id: String,
}

impl TurnContext {
    pub fn new(session_id: &str, turn_index: u32, key_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            turn_index,
            turn_nonce: new_nonce(),
            key_id: key_id.to_string(),
        }
    }
}

impl fmt::Display for TurnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {} turn {}", self.session_id, self.turn_index)
    }
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn new_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}
