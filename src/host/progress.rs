//! Progress guard: halts a loop whose turns keep producing the same thing.

use sha2::{Digest, Sha256};

/// Smallest meaningful window; a window of one would trip on every turn.
const MIN_WINDOW: usize = 2;

#[derive(Debug)]
pub struct ProgressGuard {
    window: usize,
    last: Option<String>,
    repeats: usize,
}

impl ProgressGuard {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(MIN_WINDOW),
            last: None,
            repeats: 0,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Hex SHA-256 over a turn's clean output and scratchpad.
    pub fn digest(output: &str, scratchpad: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(output.as_bytes());
        hasher.update([0u8]);
        hasher.update(scratchpad.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Records one turn. Returns true once the same digest has been seen
    /// `window` times in a row.
    pub fn observe(&mut self, output: &str, scratchpad: &str) -> bool {
        let digest = Self::digest(output, scratchpad);
        if self.last.as_deref() == Some(digest.as_str()) {
            self.repeats += 1;
        } else {
            self.last = Some(digest);
            self.repeats = 1;
        }
        self.repeats >= self.window
    }
}
