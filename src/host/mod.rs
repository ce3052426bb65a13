//! Host loop: drives an agent model turn by turn.
//!
//! Each turn sends the current envelope to the agent's provider, parses the
//! reply, runs its ACTIONS in a fresh sandbox clone, and reads the signed
//! control token the actions emitted last. The token decides whether the
//! loop continues, and nothing else does: a turn without a token that
//! verifies for that exact turn fails the whole call.

pub mod progress;
pub mod prompt;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{AccountStore, AgentCatalog, AgentModel};
use crate::config::Config;
use crate::context::{new_session_id, TurnContext};
use crate::envelope::{self, Envelope, EnvelopeError};
use crate::error::{Error, Result};
use crate::llm::{AiRequest, ProviderCatalog};
use crate::policy::TrustContext;
use crate::sandbox::{Capture, Interpreter, SharedCatalogs};
use crate::token::{looks_like_token, ControlAction, MagicTokens, TokenError, LOOP_KIND};
use crate::tools::builtin::register_builtins;
use crate::tools::ToolRegistry;
use progress::ProgressGuard;

/// What to do when a provider reply is not a parseable envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeRecovery {
    /// Fail the call.
    #[default]
    Strict,
    /// Send the parse error back to the agent as the next turn's input.
    Diagnostic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOptions {
    pub hard_cap: u32,
    pub progress_window: usize,
    pub envelope_recovery: EnvelopeRecovery,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            hard_cap: 32,
            progress_window: 3,
            envelope_recovery: EnvelopeRecovery::Strict,
        }
    }
}

/// Why a loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Done,
    Aborted,
    MaxTurns,
    NoProgress,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::Done => "done",
            StopReason::Aborted => "aborted",
            StopReason::MaxTurns => "max turns reached",
            StopReason::NoProgress => "no progress",
        };
        f.write_str(text)
    }
}

/// One completed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRecord {
    pub turn: u32,
    /// `None` for a turn replaced by a diagnostic envelope.
    pub action: Option<ControlAction>,
    pub request: Option<Value>,
    pub telemetry: Option<Value>,
    /// Clean output, control tokens stripped.
    pub output: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AskOutcome {
    pub session_id: String,
    /// Last non-empty clean output of any turn.
    pub output: String,
    /// Provider calls made.
    pub turns: u32,
    pub stop: StopReason,
    pub records: Vec<TurnRecord>,
}

/// The host loop controller. Owns the root interpreter.
pub struct HostLoop {
    root: Interpreter,
    providers: ProviderCatalog,
    options: LoopOptions,
}

impl HostLoop {
    pub fn new(root: Interpreter, providers: ProviderCatalog, options: LoopOptions) -> Self {
        Self {
            root,
            providers,
            options,
        }
    }

    /// Builds the root interpreter, catalogs and providers from `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        let loop_cfg = &config.host_loop;

        let tokens = Arc::new(MagicTokens::generate(
            Duration::from_secs(loop_cfg.token_ttl_secs),
            loop_cfg.replay_capacity,
        ));
        let agents = Arc::new(AgentCatalog::new());

        let mut tools = ToolRegistry::new();
        register_builtins(&mut tools, Arc::clone(&tokens), Arc::clone(&agents));
        for (tool, cost) in &config.pricing {
            tools.set_price(tool, cost.clone());
        }
        info!("Tools: {}", tools.names().join(", "));

        let shared = SharedCatalogs {
            tools,
            accounts: AccountStore::new(config.accounts.clone()),
            agents: Arc::clone(&agents),
            policy: Arc::new(config.policy.build()),
            tokens,
        };
        let mut root = Interpreter::with_clone_history(shared, loop_cfg.clone_history);

        for agent in &config.agents {
            agents.register(TrustContext::Config, agent.clone())?;
        }
        for (name, source) in &config.procedures {
            root.define_procedure(name, source)?;
        }
        info!(
            "Loaded {} agent(s), {} procedure(s)",
            agents.len(),
            config.procedures.len()
        );

        Ok(Self::new(
            root,
            ProviderCatalog::from_config(&config.providers),
            loop_cfg.options(),
        ))
    }

    pub fn root(&self) -> &Interpreter {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Interpreter {
        &mut self.root
    }

    pub fn options(&self) -> &LoopOptions {
        &self.options
    }

    /// Runs the registered agent `agent_name` on `user_data`.
    pub async fn ask(
        &self,
        agent_name: &str,
        user_data: Value,
        cancel: &CancellationToken,
    ) -> Result<AskOutcome> {
        let agent = self
            .root
            .shared()
            .agents
            .get(agent_name)
            .ok_or_else(|| Error::policy(agent_name, "is not a registered agent"))?;
        self.run_agent(&agent, Envelope::from_user_data(user_data), cancel)
            .await
    }

    /// Runs `agent` starting from `initial`.
    pub async fn run_agent(
        &self,
        agent: &AgentModel,
        initial: Envelope,
        cancel: &CancellationToken,
    ) -> Result<AskOutcome> {
        let result = self.drive(agent, initial, cancel).await;
        if let Err(ref e) = result {
            error!("Agent '{}' failed: {e}", agent.name);
        }
        result
    }

    async fn drive(
        &self,
        agent: &AgentModel,
        initial: Envelope,
        cancel: &CancellationToken,
    ) -> Result<AskOutcome> {
        let shared = self.root.shared();
        let entry = self.providers.get(&agent.provider).ok_or_else(|| {
            Error::Internal(format!(
                "agent '{}' names unknown provider '{}'",
                agent.name, agent.provider
            ))
        })?;
        let api_key = if agent.account.is_empty() {
            String::new()
        } else {
            shared
                .accounts
                .api_key(&agent.account)
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "agent '{}' names unknown account '{}'",
                        agent.name, agent.account
                    ))
                })?
                .to_string()
        };

        let max_turns = agent.max_turns.clamp(1, self.options.hard_cap.max(1));
        let session_id = new_session_id();
        let run_policy = Arc::new(self.root.policy().fresh_run());
        let mut guard = ProgressGuard::new(self.options.progress_window);
        let mut current = initial;
        let mut last_output = String::new();
        let mut records = Vec::new();

        info!(
            "Session {session_id}: agent '{}' on {} ({}), up to {max_turns} turn(s)",
            agent.name,
            entry.provider.description(),
            agent.model
        );

        for turn_index in 1..=max_turns {
            let turn = TurnContext::new(&session_id, turn_index, shared.tokens.key_id());
            let request = AiRequest {
                model: agent.model.clone(),
                system: prompt::system_prompt(agent, &shared.tools, &turn, max_turns),
                prompt: envelope::compose(&current).map_err(|e| {
                    Error::Internal(format!("cannot compose envelope for {turn}: {e}"))
                })?,
                api_key: api_key.clone(),
                max_tokens: entry.max_tokens,
            };

            debug!("{turn}: calling provider");
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("{turn}: cancelled");
                    return Err(Error::Cancelled);
                }
                response = entry.provider.chat(&request) => response.map_err(Error::Provider)?,
            };

            let reply = match envelope::parse(&response.text_content) {
                Ok((reply, trailing)) => {
                    if !trailing.trim().is_empty() {
                        debug!("{turn}: ignoring {} bytes after the envelope", trailing.len());
                    }
                    reply
                }
                Err(e) if self.recovers(turn_index, max_turns) => {
                    warn!("{turn}: unparseable reply, sending diagnostic: {e}");
                    current = diagnostic_envelope(&current, &e);
                    records.push(TurnRecord {
                        turn: turn_index,
                        action: None,
                        request: None,
                        telemetry: None,
                        output: String::new(),
                    });
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let mut sandbox = self
                .root
                .clone_for_turn(turn.clone())
                .with_policy(Arc::clone(&run_policy));
            sandbox.execute_actions(&reply.actions).await?;
            let capture = sandbox.take_capture();

            let (clean, token_line) = split_token(&capture);
            let token_line = token_line.ok_or(TokenError::Missing)?;
            let verified = shared.tokens.parse_and_verify(&token_line, &turn)?;
            if verified.kind != LOOP_KIND {
                return Err(TokenError::WrongKind {
                    expected: LOOP_KIND.to_string(),
                    found: verified.kind,
                }
                .into());
            }
            let payload = verified.payload;
            if let Some(ref telemetry) = payload.telemetry {
                debug!("{turn}: telemetry {telemetry}");
            }

            if !clean.trim().is_empty() {
                last_output = clean.clone();
            }
            let scratchpad = capture.scratchpad();
            records.push(TurnRecord {
                turn: turn_index,
                action: Some(payload.action),
                request: payload.request,
                telemetry: payload.telemetry,
                output: clean.clone(),
            });
            info!("{turn}: {:?}", payload.action);

            let stop = match payload.action {
                ControlAction::Done => Some(StopReason::Done),
                ControlAction::Abort => Some(StopReason::Aborted),
                ControlAction::Continue => {
                    if !agent.tool_loop_permitted {
                        return Err(Error::policy(
                            &agent.name,
                            "asked to continue but is not permitted a tool loop",
                        ));
                    }
                    if guard.observe(&clean, &scratchpad) {
                        warn!(
                            "{turn}: same output {} turns in a row, halting",
                            guard.window()
                        );
                        Some(StopReason::NoProgress)
                    } else {
                        None
                    }
                }
            };
            if let Some(stop) = stop {
                return Ok(AskOutcome {
                    session_id,
                    output: last_output,
                    turns: turn_index,
                    stop,
                    records,
                });
            }

            current = Envelope {
                user_data: Value::String(clean.clone()),
                actions: String::new(),
                output: envelope::escape_markers(&clean),
                scratchpad: envelope::escape_markers(&scratchpad),
            };
        }

        info!("Session {session_id}: stopped after {max_turns} turn(s)");
        Ok(AskOutcome {
            session_id,
            output: last_output,
            turns: max_turns,
            stop: StopReason::MaxTurns,
            records,
        })
    }

    /// Diagnostic recovery needs a turn left to send the diagnostic in.
    fn recovers(&self, turn_index: u32, max_turns: u32) -> bool {
        self.options.envelope_recovery == EnvelopeRecovery::Diagnostic && turn_index < max_turns
    }
}

/// Splits captured output into clean text and the terminal token line.
///
/// The token is the last non-empty line, if it is token-shaped. Every
/// token-shaped line is dropped from the clean text.
fn split_token(capture: &Capture) -> (String, Option<String>) {
    let output = capture.output();
    let token = output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .filter(|line| looks_like_token(line))
        .map(|line| line.trim().to_string());
    let clean = output
        .lines()
        .filter(|line| !looks_like_token(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string();
    (clean, token)
}

/// Envelope telling the agent its last reply did not parse.
fn diagnostic_envelope(previous: &Envelope, error: &EnvelopeError) -> Envelope {
    Envelope {
        user_data: json!({
            "envelope_error": error.to_string(),
            "user_data": previous.user_data,
        }),
        actions: String::new(),
        output: String::new(),
        scratchpad: previous.scratchpad.clone(),
    }
}
