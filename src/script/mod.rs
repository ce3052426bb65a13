//! Parser for the action dialect run inside ACTIONS blocks.
//!
//! One statement per line; blank lines and `#` comments are skipped.
//!
//! ```text
//! emit <expr>                   append to the turn's output
//! whisper <expr>                append to the next turn's scratchpad
//! set <name> = <expr>           bind a variable
//! call <tool> [<json>] [-> v]   invoke a tool through the gate
//! run <procedure>               run a host-defined procedure
//! on error <statement>          install a handler for tool failures
//! ```
//!
//! An `<expr>` is a JSON string literal, a `$name` reference, or raw text
//! up to the end of the line. Inside call arguments, any JSON string of
//! the exact form `"$name"` is replaced by the variable's value.

use serde_json::{Map, Value};

use crate::envelope::{validate_actions, COMMAND_CLOSE, COMMAND_OPEN};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(String),
    Var(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Emit(Expr),
    Whisper(Expr),
    Set {
        name: String,
        value: Expr,
    },
    Call {
        tool: String,
        args: Value,
        bind: Option<String>,
    },
    Run(String),
    OnError(Box<Statement>),
}

/// A statement with its 1-based line number in the source it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub number: usize,
    pub statement: Statement,
}

/// Parses the contents of an ACTIONS section (`command` ... `endcommand`).
///
/// An empty block parses to no statements.
pub fn parse_block(block: &str) -> Result<Vec<Line>> {
    validate_actions(block)?;
    if block.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut lines = Vec::new();
    for (idx, raw) in block.lines().enumerate() {
        let text = raw.trim();
        if text == COMMAND_OPEN || text == COMMAND_CLOSE {
            continue;
        }
        if let Some(statement) = parse_line(text, idx + 1)? {
            lines.push(Line {
                number: idx + 1,
                statement,
            });
        }
    }
    Ok(lines)
}

/// Parses a bare sequence of statements, e.g. a procedure body.
pub fn parse_statements(source: &str) -> Result<Vec<Line>> {
    let mut lines = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        if let Some(statement) = parse_line(raw.trim(), idx + 1)? {
            lines.push(Line {
                number: idx + 1,
                statement,
            });
        }
    }
    Ok(lines)
}

fn script_error(line: usize, message: impl Into<String>) -> Error {
    Error::Script {
        line,
        message: message.into(),
    }
}

fn parse_line(text: &str, line: usize) -> Result<Option<Statement>> {
    if text.is_empty() || text.starts_with('#') {
        return Ok(None);
    }
    parse_statement(text, line).map(Some)
}

fn split_keyword(text: &str) -> (&str, &str) {
    match text.split_once(char::is_whitespace) {
        Some((kw, rest)) => (kw, rest.trim()),
        None => (text, ""),
    }
}

fn parse_statement(text: &str, line: usize) -> Result<Statement> {
    let (keyword, rest) = split_keyword(text);
    match keyword {
        "emit" => Ok(Statement::Emit(parse_expr(rest, line)?)),
        "whisper" => Ok(Statement::Whisper(parse_expr(rest, line)?)),
        "set" => {
            let (name, value) = rest
                .split_once('=')
                .ok_or_else(|| script_error(line, "expected 'set <name> = <value>'"))?;
            let name = name.trim();
            if !is_ident(name) {
                return Err(script_error(line, format!("invalid variable name '{name}'")));
            }
            Ok(Statement::Set {
                name: name.to_string(),
                value: parse_expr(value.trim(), line)?,
            })
        }
        "call" => parse_call(rest, line),
        "run" => {
            if !is_tool_name(rest) {
                return Err(script_error(line, format!("invalid procedure name '{rest}'")));
            }
            Ok(Statement::Run(rest.to_string()))
        }
        "on" => {
            let (event, inner) = split_keyword(rest);
            if event != "error" {
                return Err(script_error(line, format!("unknown event '{event}'")));
            }
            if inner.is_empty() {
                return Err(script_error(line, "'on error' needs a statement"));
            }
            let inner = parse_statement(inner, line)?;
            if matches!(inner, Statement::OnError(_)) {
                return Err(script_error(line, "handlers cannot be nested"));
            }
            Ok(Statement::OnError(Box::new(inner)))
        }
        other => Err(script_error(line, format!("unknown statement '{other}'"))),
    }
}

fn parse_call(rest: &str, line: usize) -> Result<Statement> {
    let (tool, tail) = split_keyword(rest);
    if !is_tool_name(tool) {
        return Err(script_error(line, format!("invalid tool name '{tool}'")));
    }

    let (json_part, bind) = match tail.rfind("->") {
        Some(pos) if is_ident(tail[pos + 2..].trim()) => {
            (tail[..pos].trim(), Some(tail[pos + 2..].trim().to_string()))
        }
        _ => (tail, None),
    };

    let args = if json_part.is_empty() {
        Value::Object(Map::new())
    } else {
        let value: Value = serde_json::from_str(json_part)
            .map_err(|e| script_error(line, format!("invalid arguments for {tool}: {e}")))?;
        if !value.is_object() {
            return Err(script_error(line, format!("arguments for {tool} must be a JSON object")));
        }
        value
    };

    Ok(Statement::Call {
        tool: tool.to_string(),
        args,
        bind,
    })
}

fn parse_expr(text: &str, line: usize) -> Result<Expr> {
    if text.starts_with('"') {
        let s: String = serde_json::from_str(text)
            .map_err(|e| script_error(line, format!("invalid string literal: {e}")))?;
        return Ok(Expr::Literal(s));
    }
    if let Some(name) = text.strip_prefix('$') {
        if is_ident(name) {
            return Ok(Expr::Var(name.to_string()));
        }
    }
    Ok(Expr::Literal(text.to_string()))
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_tool_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}
