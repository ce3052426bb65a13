pub mod agents;
pub mod control;
pub mod fs;
pub mod net_fetch;

use std::sync::Arc;

use crate::catalog::AgentCatalog;
use crate::token::MagicTokens;
use crate::tools::ToolRegistry;

pub use agents::RegisterAgentTool;
pub use control::{MagicTokenTool, MAGIC_TOKEN_TOOL};
pub use fs::{FsReadTool, FsWriteTool};
pub use net_fetch::NetFetchTool;

/// Registers every builtin tool.
pub fn register_builtins(
    registry: &mut ToolRegistry,
    tokens: Arc<MagicTokens>,
    agents: Arc<AgentCatalog>,
) {
    registry.register(Box::new(MagicTokenTool::new(tokens)));
    registry.register(Box::new(FsReadTool));
    registry.register(Box::new(FsWriteTool));
    registry.register(Box::new(NetFetchTool::new()));
    registry.register(Box::new(RegisterAgentTool::new(agents)));
}
