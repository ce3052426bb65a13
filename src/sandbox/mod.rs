//! Execution sandbox for agent-written actions.
//!
//! The host owns one root [`Interpreter`]. Each turn runs in a fresh clone
//! made with [`Interpreter::clone_for_turn`]: the clone shares the catalogs
//! (tools, accounts, agent models, token keys), copies the root's
//! procedures and handlers, and starts with no variables. Whatever it
//! defines or captures is discarded with it.
//!
//! Every `call` goes through the clone's [`ExecPolicy`] before the tool
//! runs. Procedures run from an explicit frame stack, so nesting depth is
//! bounded by [`MAX_CALL_DEPTH`] rather than by the async stack.

pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::catalog::{AccountStore, AgentCatalog};
use crate::context::TurnContext;
use crate::error::{Error, Result};
use crate::policy::ExecPolicy;
use crate::script::{self, is_ident, Expr, Line, Statement};
use crate::token::MagicTokens;
use crate::tools::{ToolContext, ToolRegistry};
pub use registry::{CloneRecord, CloneRegistry, DEFAULT_CLONE_HISTORY, ROOT_ID};

/// Maximum nesting of procedure and handler frames.
pub const MAX_CALL_DEPTH: usize = 64;

/// Variable a failed tool call's message is bound to before handlers run.
pub const ERROR_VAR: &str = "error";

/// State every clone of a root shares by reference.
pub struct SharedCatalogs {
    pub tools: ToolRegistry,
    pub accounts: AccountStore,
    pub agents: Arc<AgentCatalog>,
    /// Policy template; each run gets its own copy with fresh counters.
    pub policy: Arc<ExecPolicy>,
    pub tokens: Arc<MagicTokens>,
}

/// What a run of actions produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capture {
    pub emitted: Vec<String>,
    pub whispers: Vec<String>,
}

impl Capture {
    pub fn output(&self) -> String {
        self.emitted.join("\n")
    }

    pub fn scratchpad(&self) -> String {
        self.whispers.join("\n")
    }
}

#[derive(Debug, Clone, Default)]
struct ExecState {
    vars: HashMap<String, String>,
    procedures: HashMap<String, Arc<Vec<Line>>>,
    handlers: Vec<Statement>,
    capture: Capture,
}

impl ExecState {
    /// Copy for a clone: definitions carry over, variables and output do not.
    fn fork(&self) -> Self {
        Self {
            vars: HashMap::new(),
            procedures: self.procedures.clone(),
            handlers: self.handlers.clone(),
            capture: Capture::default(),
        }
    }
}

struct Frame {
    name: String,
    lines: std::vec::IntoIter<Line>,
    handler: bool,
}

impl Frame {
    fn new(name: &str, lines: Vec<Line>, handler: bool) -> Self {
        Self {
            name: name.to_string(),
            lines: lines.into_iter(),
            handler,
        }
    }
}

fn script_error(line: usize, message: impl Into<String>) -> Error {
    Error::Script {
        line,
        message: message.into(),
    }
}

pub struct Interpreter {
    id: u64,
    parent: Option<u64>,
    shared: Arc<SharedCatalogs>,
    policy: Arc<ExecPolicy>,
    clones: Arc<CloneRegistry>,
    turn: Option<TurnContext>,
    state: ExecState,
}

impl Interpreter {
    pub fn new_root(shared: SharedCatalogs) -> Self {
        Self::with_clone_history(shared, DEFAULT_CLONE_HISTORY)
    }

    pub fn with_clone_history(shared: SharedCatalogs, history: usize) -> Self {
        let policy = Arc::clone(&shared.policy);
        Self {
            id: ROOT_ID,
            parent: None,
            shared: Arc::new(shared),
            policy,
            clones: Arc::new(CloneRegistry::new(history)),
            turn: None,
            state: ExecState::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent(&self) -> Option<u64> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn turn(&self) -> Option<&TurnContext> {
        self.turn.as_ref()
    }

    pub fn shared(&self) -> &SharedCatalogs {
        &self.shared
    }

    pub fn policy(&self) -> &Arc<ExecPolicy> {
        &self.policy
    }

    pub fn clones(&self) -> &CloneRegistry {
        &self.clones
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.state.vars.get(name).map(String::as_str)
    }

    pub fn set_var(&mut self, name: &str, value: impl Into<String>) {
        self.state.vars.insert(name.to_string(), value.into());
    }

    pub fn capture(&self) -> &Capture {
        &self.state.capture
    }

    pub fn take_capture(&mut self) -> Capture {
        std::mem::take(&mut self.state.capture)
    }

    /// Defines (or replaces) a procedure callable with `run <name>`.
    pub fn define_procedure(&mut self, name: &str, source: &str) -> Result<()> {
        if !is_ident(name) {
            return Err(Error::Internal(format!("invalid procedure name '{name}'")));
        }
        let body = script::parse_statements(source)?;
        debug!("Defined procedure '{name}' ({} statements)", body.len());
        self.state.procedures.insert(name.to_string(), Arc::new(body));
        Ok(())
    }

    pub fn has_procedure(&self, name: &str) -> bool {
        self.state.procedures.contains_key(name)
    }

    /// Installs a handler run when a tool call fails.
    pub fn on_error(&mut self, statement: &str) -> Result<()> {
        let mut lines = script::parse_statements(statement)?;
        if lines.len() != 1 {
            return Err(Error::Internal("an error handler is a single statement".to_string()));
        }
        let statement = lines.remove(0).statement;
        if matches!(statement, Statement::OnError(_)) {
            return Err(Error::Internal("handlers cannot be nested".to_string()));
        }
        self.state.handlers.push(statement);
        Ok(())
    }

    /// Replaces the policy calls are checked against.
    pub fn with_policy(mut self, policy: Arc<ExecPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// A fresh interpreter bound to `turn`, sharing this one's catalogs.
    pub fn clone_for_turn(&self, turn: TurnContext) -> Interpreter {
        let id = self.clones.allocate_id();
        self.clones.record(CloneRecord {
            id,
            parent: self.id,
            session_id: turn.session_id.clone(),
            turn_index: turn.turn_index,
            created_at: Utc::now(),
        });
        debug!("Cloned sandbox {id} from {} for {turn}", self.id);
        Interpreter {
            id,
            parent: Some(self.id),
            shared: Arc::clone(&self.shared),
            policy: Arc::clone(&self.policy),
            clones: Arc::clone(&self.clones),
            turn: Some(turn),
            state: self.state.fork(),
        }
    }

    /// Parses and runs an ACTIONS block.
    pub async fn execute_actions(&mut self, block: &str) -> Result<()> {
        let lines = script::parse_block(block)?;
        self.run(lines).await
    }

    /// Runs parsed statements to completion or first unhandled error.
    pub async fn run(&mut self, lines: Vec<Line>) -> Result<()> {
        let mut frames = vec![Frame::new("actions", lines, false)];

        loop {
            let Some(frame) = frames.last_mut() else {
                break;
            };
            let Some(line) = frame.lines.next() else {
                frames.pop();
                continue;
            };
            let number = line.number;
            let in_handler = frames.iter().any(|f| f.handler);

            match line.statement {
                Statement::Emit(expr) => {
                    let text = self.eval(&expr, number)?;
                    self.state.capture.emitted.push(text);
                }
                Statement::Whisper(expr) => {
                    let text = self.eval(&expr, number)?;
                    self.state.capture.whispers.push(text);
                }
                Statement::Set { name, value } => {
                    let text = self.eval(&value, number)?;
                    self.state.vars.insert(name, text);
                }
                Statement::Call { tool, args, bind } => {
                    let args = self.interpolate(args, number)?;
                    match self.call_tool(&tool, args).await {
                        Ok(result) => {
                            if let Some(name) = bind {
                                self.state.vars.insert(name, result);
                            }
                        }
                        Err(e @ Error::ToolFailed { .. })
                            if !in_handler && !self.state.handlers.is_empty() =>
                        {
                            warn!("Sandbox {}: {e}, running error handlers", self.id);
                            self.state.vars.insert(ERROR_VAR.to_string(), e.to_string());
                            let body = self
                                .state
                                .handlers
                                .iter()
                                .cloned()
                                .map(|statement| Line { number, statement })
                                .collect();
                            self.push_frame(&mut frames, "on error", body, true, number)?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Statement::Run(name) => {
                    let body = self
                        .state
                        .procedures
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| script_error(number, format!("unknown procedure '{name}'")))?;
                    self.push_frame(&mut frames, &name, body.as_ref().clone(), false, number)?;
                }
                Statement::OnError(statement) => {
                    self.state.handlers.push(*statement);
                }
            }
        }
        Ok(())
    }

    fn push_frame(
        &self,
        frames: &mut Vec<Frame>,
        name: &str,
        body: Vec<Line>,
        handler: bool,
        line: usize,
    ) -> Result<()> {
        if frames.len() >= MAX_CALL_DEPTH {
            return Err(script_error(
                line,
                format!("call depth exceeds {MAX_CALL_DEPTH} entering '{name}'"),
            ));
        }
        let caller = frames.last().map(|f| f.name.as_str()).unwrap_or_default();
        debug!("Sandbox {}: {caller} -> {name}", self.id);
        frames.push(Frame::new(name, body, handler));
        Ok(())
    }

    fn eval(&self, expr: &Expr, line: usize) -> Result<String> {
        match expr {
            Expr::Literal(text) => Ok(text.clone()),
            Expr::Var(name) => self
                .state
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| script_error(line, format!("undefined variable '{name}'"))),
        }
    }

    /// Replaces `"$name"` strings anywhere in `value` with variable values.
    fn interpolate(&self, value: Value, line: usize) -> Result<Value> {
        match value {
            Value::String(s) => match s.strip_prefix('$') {
                Some(name) if is_ident(name) => {
                    self.eval(&Expr::Var(name.to_string()), line).map(Value::String)
                }
                _ => Ok(Value::String(s)),
            },
            Value::Array(items) => items
                .into_iter()
                .map(|v| self.interpolate(v, line))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| Ok((k, self.interpolate(v, line)?)))
                .collect::<Result<Map<_, _>>>()
                .map(Value::Object),
            other => Ok(other),
        }
    }

    /// Gate, then execute one tool call.
    pub async fn call_tool(&self, name: &str, params: Value) -> Result<String> {
        let tools = &self.shared.tools;
        let tool = tools
            .get(name)
            .ok_or_else(|| Error::policy(name, "is not a registered tool"))?;

        if tool.requires_trust() {
            self.policy.require_trust(name)?;
        }
        let meta = tools
            .invocation_meta(tool, &params)
            .map_err(|source| Error::ToolFailed {
                tool: name.to_string(),
                source,
            })?;
        self.policy.can_call(&meta)?;

        let context = ToolContext {
            turn: self.turn.clone(),
            sandbox_id: self.id,
            trust: self.policy.context(),
            reserved: meta.usage,
        };
        info!("Sandbox {} calling {name}", self.id);
        tool.execute(params, &context)
            .await
            .map_err(|e| match e.downcast::<Error>() {
                Ok(err) => err,
                Err(source) => Error::ToolFailed {
                    tool: name.to_string(),
                    source,
                },
            })
    }
}
