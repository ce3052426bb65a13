//! System prompt sent with every turn.

use crate::catalog::AgentModel;
use crate::context::TurnContext;
use crate::envelope::{COMMAND_CLOSE, COMMAND_OPEN, END_MARKER, START_MARKER};
use crate::token::LOOP_KIND;
use crate::tools::builtin::MAGIC_TOKEN_TOOL;
use crate::tools::ToolRegistry;

/// Builds the system prompt for one turn of `agent`.
pub fn system_prompt(
    agent: &AgentModel,
    tools: &ToolRegistry,
    turn: &TurnContext,
    max_turns: u32,
) -> String {
    let mut prompt = format!(
        "You are {name}, an agent driven turn by turn by a host program.\n\
         This is turn {index} of at most {max_turns}.\n\n\
         Protocol:\n\
         - Every message you receive is an envelope. Reply with exactly one envelope:\n\
         {START_MARKER}\n\
         <<<USERDATA>>>\n\
         (optional JSON)\n\
         <<<ACTIONS>>>\n\
         {COMMAND_OPEN}\n\
         (one statement per line)\n\
         {COMMAND_CLOSE}\n\
         <<<OUTPUT>>>\n\
         <<<SCRATCHPAD>>>\n\
         {END_MARKER}\n\
         - Only ACTIONS is executed. Anything you write in OUTPUT or SCRATCHPAD is ignored; \
           use `emit` and `whisper` instead.\n\n\
         Statements:\n\
         - emit <text>                     append a line to your output\n\
         - whisper <text>                  note for your next turn (scratchpad)\n\
         - set <name> = <text>             bind a variable; use it later as $name\n\
         - call <tool> {{json}} -> <name>    call a tool, bind its result\n\
         - run <procedure>                 run a host-defined procedure\n\
         - on error <statement>            run <statement> if a tool fails ($error holds the message)\n\
         Variables do not survive between turns.\n\n\
         Ending the turn:\n\
         - Call {MAGIC_TOKEN_TOOL} with {{\"kind\": \"{LOOP_KIND}\", \"params\": {{\"action\": A}}}} \
           where A is \"done\", \"abort\" or \"continue\", bind the result, and emit it as \
           your LAST line. A turn without a valid token fails.\n",
        name = agent.name,
        index = turn.turn_index,
    );

    if agent.tool_loop_permitted {
        prompt.push_str(
            "- \"continue\" gives you another turn: your output becomes the next user data \
             and your whispers the next scratchpad.\n",
        );
    } else {
        prompt.push_str("- You have a single turn: \"continue\" is refused.\n");
    }

    let definitions = tools.tool_definitions();
    if !definitions.is_empty() {
        prompt.push_str("\nTools:\n");
        for def in definitions {
            prompt.push_str(&format!(
                "- {}: {}\n  parameters: {}\n",
                def.name, def.description, def.input_schema
            ));
        }
    }

    prompt
}
