//! Builtin tools: read and write files.
//!
//! Paths must be absolute and free of `..`. Symlinks are resolved before
//! the capability scope is declared, so the scope the gate matches against
//! is the file the tool actually touches.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::policy::{CapRequirement, ToolMeta, Usage};
use crate::tools::{required_str, Tool, ToolContext};

/// Maximum text returned to the agent (in characters).
const MAX_TEXT_OUTPUT: usize = 20_000;

/// Largest read reservation, and the one taken when the size is unknown.
const MAX_READ_BYTES: u64 = 1024 * 1024;

fn checked_path(params: &Value) -> anyhow::Result<&str> {
    let path = required_str(params, "path")?;
    let p = Path::new(path);
    if !p.is_absolute() {
        bail!("path must be absolute: {path}");
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        bail!("path must not contain '..': {path}");
    }
    Ok(path)
}

/// Canonical form of the `path` parameter.
///
/// The deepest existing ancestor is canonicalized and the missing tail is
/// appended, so paths that do not exist yet (writes) resolve too. A link
/// whose target is missing is refused.
fn resolved_path(params: &Value) -> anyhow::Result<PathBuf> {
    let path = checked_path(params)?;
    let mut existing = Path::new(path);
    let mut missing = Vec::new();
    let mut resolved = loop {
        match std::fs::canonicalize(existing) {
            Ok(canonical) => break canonical,
            Err(_) if existing.symlink_metadata().is_ok() => {
                bail!("{} is a link to a missing target", existing.display());
            }
            Err(_) => {
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    bail!("cannot resolve {path}");
                };
                missing.push(name);
                existing = parent;
            }
        }
    };
    resolved.extend(missing.iter().rev());
    Ok(resolved)
}

fn scope(path: &Path) -> anyhow::Result<&str> {
    path.to_str()
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}

/// Bytes a read of `path` reserves.
///
/// Regular files reserve their size, up to `limit`. Files that report no
/// size (procfs, pipes) reserve the whole `limit`. Missing files reserve
/// nothing and fail in execute.
fn read_reservation(path: &Path, limit: u64) -> u64 {
    match std::fs::metadata(path) {
        Ok(m) if m.is_file() && m.len() > 0 => m.len().min(limit),
        Ok(_) => limit,
        Err(_) => 0,
    }
}

pub struct FsReadTool;

#[async_trait]
impl Tool for FsReadTool {
    fn name(&self) -> &str {
        "fs.read"
    }

    fn description(&self) -> &str {
        "Read a text file. The path must be absolute. \
         At most 'max_bytes' bytes are read (default 1 MiB)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Absolute path of the file"},
                "max_bytes": {
                    "type": "integer",
                    "description": "Read at most this many bytes (default and maximum 1048576)"
                }
            },
            "required": ["path"]
        })
    }

    fn meta(&self, params: &Value) -> anyhow::Result<ToolMeta> {
        let path = resolved_path(params)?;
        let limit = match params.get("max_bytes") {
            None => MAX_READ_BYTES,
            Some(v) => match v.as_u64() {
                Some(n) if n > 0 => n.min(MAX_READ_BYTES),
                _ => bail!("'max_bytes' must be a positive integer"),
            },
        };
        Ok(ToolMeta {
            required_caps: vec![CapRequirement::new("fs", "read", scope(&path)?)],
            usage: Usage {
                fs_bytes: read_reservation(&path, limit),
                ..Usage::default()
            },
            ..ToolMeta::new(self.name())
        })
    }

    async fn execute(&self, params: Value, context: &ToolContext) -> anyhow::Result<String> {
        let path = resolved_path(&params)?;
        let reserved = context.reserved.fs_bytes;
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;

        // One byte past the reservation tells a cut-off read from an exact fit.
        let mut bytes = Vec::new();
        file.take(reserved.saturating_add(1))
            .read_to_end(&mut bytes)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        let stopped = bytes.len() as u64 > reserved;
        if stopped {
            bytes.truncate(reserved as usize);
        }
        debug!("fs.read {}: {} bytes", path.display(), bytes.len());

        let text = String::from_utf8_lossy(&bytes);
        let mut out = if text.chars().count() > MAX_TEXT_OUTPUT {
            let mut truncated: String = text.chars().take(MAX_TEXT_OUTPUT).collect();
            truncated.push_str(&format!("\n[Content truncated at {MAX_TEXT_OUTPUT} characters]"));
            truncated
        } else {
            text.into_owned()
        };
        if stopped {
            out.push_str(&format!("\n[Read stopped at {reserved} bytes]"));
        }
        Ok(out)
    }
}

pub struct FsWriteTool;

#[async_trait]
impl Tool for FsWriteTool {
    fn name(&self) -> &str {
        "fs.write"
    }

    fn description(&self) -> &str {
        "Write text to a file, replacing it unless 'append' is true. \
         The path must be absolute; parent directories are created."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Absolute path of the file"},
                "content": {"type": "string", "description": "Text to write"},
                "append": {"type": "boolean", "description": "Append instead of replacing"}
            },
            "required": ["path", "content"]
        })
    }

    fn meta(&self, params: &Value) -> anyhow::Result<ToolMeta> {
        let path = resolved_path(params)?;
        let content = required_str(params, "content")?;
        Ok(ToolMeta {
            required_caps: vec![CapRequirement::new("fs", "write", scope(&path)?)],
            usage: Usage {
                fs_bytes: content.len() as u64,
                ..Usage::default()
            },
            ..ToolMeta::new(self.name())
        })
    }

    async fn execute(&self, params: Value, _context: &ToolContext) -> anyhow::Result<String> {
        let path = resolved_path(&params)?;
        let content = required_str(&params, "content")?;
        let append = params["append"].as_bool().unwrap_or(false);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .await
            .with_context(|| format!("cannot open {}", path.display()))?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        debug!("fs.write {}: {} bytes (append={append})", path.display(), content.len());
        Ok(format!("Wrote {} bytes to {}", content.len(), path.display()))
    }
}
