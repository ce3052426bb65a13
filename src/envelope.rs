//! Envelope codec: the four-section message exchanged with the provider.
//!
//! ```text
//! <<<ENVELOPE>>>
//! <<<USERDATA>>>
//! {"question": "..."}
//! <<<ACTIONS>>>
//! command
//! emit "hello"
//! endcommand
//! <<<OUTPUT>>>
//! <<<SCRATCHPAD>>>
//! <<<END>>>
//! ```
//!
//! Marker lines are compared after trimming. Text before the start marker is
//! ignored (providers like to chat before answering); text after `<<<END>>>`
//! is handed back as trailing bytes.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

pub const START_MARKER: &str = "<<<ENVELOPE>>>";
pub const END_MARKER: &str = "<<<END>>>";

pub const COMMAND_OPEN: &str = "command";
pub const COMMAND_CLOSE: &str = "endcommand";

/// Named sections, in canonical wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Section {
    UserData,
    Actions,
    Output,
    Scratchpad,
}

impl Section {
    const ALL: [Section; 4] = [
        Section::UserData,
        Section::Actions,
        Section::Output,
        Section::Scratchpad,
    ];

    fn marker(self) -> &'static str {
        match self {
            Section::UserData => "<<<USERDATA>>>",
            Section::Actions => "<<<ACTIONS>>>",
            Section::Output => "<<<OUTPUT>>>",
            Section::Scratchpad => "<<<SCRATCHPAD>>>",
        }
    }

    fn from_marker(line: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.marker() == line)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Section::UserData => "USERDATA",
            Section::Actions => "ACTIONS",
            Section::Output => "OUTPUT",
            Section::Scratchpad => "SCRATCHPAD",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("no envelope found (missing <<<ENVELOPE>>> line)")]
    NotFound,

    #[error("malformed {section} section: {reason}")]
    Malformed { section: Section, reason: String },

    #[error("malformed envelope: {0}")]
    Structure(String),
}

impl EnvelopeError {
    fn malformed(section: Section, reason: impl Into<String>) -> Self {
        EnvelopeError::Malformed {
            section,
            reason: reason.into(),
        }
    }
}

/// One unit of exchange with the provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    /// Opaque JSON for the agent; `Null` when the section is empty.
    pub user_data: Value,
    /// Zero or one `command … endcommand` block.
    pub actions: String,
    pub output: String,
    pub scratchpad: String,
}

impl Envelope {
    /// Envelope carrying only user data, as sent on the first turn.
    pub fn from_user_data(user_data: Value) -> Self {
        Self {
            user_data,
            ..Self::default()
        }
    }

    /// Whether the ACTIONS section holds a command block.
    pub fn has_actions(&self) -> bool {
        !self.actions.trim().is_empty()
    }
}

fn is_marker_shaped(line: &str) -> bool {
    let t = line.trim();
    t.len() >= 6 && t.starts_with("<<<") && t.ends_with(">>>")
}

/// Escapes marker-shaped lines so `text` can be carried in a section body.
///
/// Such lines get a leading backslash and lose their indentation. Other
/// lines are left alone.
pub fn escape_markers(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            if is_marker_shaped(line) {
                format!("\\{}", line.trim_start())
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Checks that `actions` is blank or exactly one `command … endcommand` block.
pub fn validate_actions(actions: &str) -> Result<(), EnvelopeError> {
    let lines: Vec<&str> = actions
        .split('\n')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let Some((first, rest)) = lines.split_first() else {
        return Ok(());
    };
    if *first != COMMAND_OPEN {
        return Err(EnvelopeError::malformed(
            Section::Actions,
            format!("block must start with '{COMMAND_OPEN}', found '{first}'"),
        ));
    }
    let Some((last, body)) = rest.split_last() else {
        return Err(EnvelopeError::malformed(
            Section::Actions,
            format!("missing '{COMMAND_CLOSE}'"),
        ));
    };
    if *last != COMMAND_CLOSE {
        return Err(EnvelopeError::malformed(
            Section::Actions,
            format!("block must end with '{COMMAND_CLOSE}', found '{last}'"),
        ));
    }
    if let Some(extra) = body
        .iter()
        .find(|l| **l == COMMAND_OPEN || **l == COMMAND_CLOSE)
    {
        return Err(EnvelopeError::malformed(
            Section::Actions,
            format!("expected exactly one command block, found a nested '{extra}'"),
        ));
    }
    Ok(())
}

/// Parses the first envelope in `text`.
///
/// Returns the envelope and whatever follows the end marker (empty when the
/// end marker is absent and the envelope runs to the end of the text).
pub fn parse(text: &str) -> Result<(Envelope, &str), EnvelopeError> {
    // Walk lines keeping byte offsets so trailing text can be sliced out.
    let mut offset = 0usize;
    let mut lines = Vec::new();
    for raw in text.split_inclusive('\n') {
        lines.push((offset, raw));
        offset += raw.len();
    }

    let start = lines
        .iter()
        .position(|(_, l)| l.trim() == START_MARKER)
        .ok_or(EnvelopeError::NotFound)?;

    let mut sections: [Option<Vec<&str>>; 4] = [None, None, None, None];
    let mut current: Option<Section> = None;
    let mut trailing = "";

    for &(pos, raw) in &lines[start + 1..] {
        let line = raw.strip_suffix('\n').unwrap_or(raw);
        let trimmed = line.trim();

        if trimmed == END_MARKER {
            trailing = &text[pos + raw.len()..];
            break;
        }

        if is_marker_shaped(trimmed) {
            let Some(section) = Section::from_marker(trimmed) else {
                return Err(EnvelopeError::Structure(format!(
                    "unknown marker '{trimmed}'"
                )));
            };
            if sections[section as usize].is_some() {
                return Err(EnvelopeError::malformed(section, "section appears twice"));
            }
            if let Some(prev) = current {
                if section < prev {
                    return Err(EnvelopeError::malformed(
                        section,
                        format!("section must come before {prev}"),
                    ));
                }
            }
            sections[section as usize] = Some(Vec::new());
            current = Some(section);
            continue;
        }

        match current {
            Some(section) => {
                if let Some(body) = sections[section as usize].as_mut() {
                    body.push(line);
                }
            }
            None if trimmed.is_empty() => {}
            None => {
                return Err(EnvelopeError::Structure(
                    "text between the start marker and the first section".to_string(),
                ));
            }
        }
    }

    let content = |s: Section| -> String {
        sections[s as usize]
            .as_ref()
            .map(|lines| lines.join("\n"))
            .unwrap_or_default()
    };

    let user_data_text = content(Section::UserData);
    let user_data = if user_data_text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&user_data_text)
            .map_err(|e| EnvelopeError::malformed(Section::UserData, format!("invalid JSON: {e}")))?
    };

    let actions = content(Section::Actions);
    validate_actions(&actions)?;

    Ok((
        Envelope {
            user_data,
            actions,
            output: content(Section::Output),
            scratchpad: content(Section::Scratchpad),
        },
        trailing,
    ))
}

/// Serializes an envelope in canonical section order.
///
/// Fails when a section would not survive a round trip: marker-shaped lines
/// in any section, or an ACTIONS section that is not a single block.
pub fn compose(envelope: &Envelope) -> Result<String, EnvelopeError> {
    validate_actions(&envelope.actions)?;

    let user_data = match &envelope.user_data {
        Value::Null => String::new(),
        other => serde_json::to_string_pretty(other)
            .map_err(|e| EnvelopeError::malformed(Section::UserData, e.to_string()))?,
    };

    let bodies = [
        (Section::UserData, user_data.as_str()),
        (Section::Actions, envelope.actions.as_str()),
        (Section::Output, envelope.output.as_str()),
        (Section::Scratchpad, envelope.scratchpad.as_str()),
    ];

    let mut out = String::new();
    out.push_str(START_MARKER);
    out.push('\n');
    for (section, body) in bodies {
        if body.split('\n').any(is_marker_shaped) {
            return Err(EnvelopeError::malformed(
                section,
                "content contains a marker-shaped line",
            ));
        }
        out.push_str(section.marker());
        out.push('\n');
        if !body.is_empty() {
            out.push_str(body);
            out.push('\n');
        }
    }
    out.push_str(END_MARKER);
    out.push('\n');
    Ok(out)
}
