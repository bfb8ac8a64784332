//! The orchestration loop of the recursive language-model runtime.
//!
//! The loop follows a **Prompt → Execute → Observe** cycle:
//!
//! 1. **Ask** the default model for the next step (through the router's
//!    in-process shortcut)
//! 2. **Extract** every ```` ```repl ```` block from the reply, in order
//! 3. **Execute** each block in the configured environment; code there may
//!    call back into the router with sub-queries
//! 4. **If a final answer** (`FINAL(...)` / `FINAL_VAR(...)`) is present:
//!    return it
//! 5. **Otherwise**: fold the reply and the block outputs into history and
//!    loop back to step 1
//!
//! The loop stops at a final answer or when the iteration budget is spent;
//! the latter yields a fallback answer, not an error.

pub mod parsing;
pub mod prompts;
pub mod rlm;
pub mod subcall;

#[cfg(test)]
mod test_helpers;

pub use parsing::{
    FinalAnswer, extract_code_blocks, find_final_answer, format_iteration, resolve_final_answer,
    truncate,
};
pub use prompts::{DEFAULT_SYSTEM_PROMPT, initial_history};
pub use rlm::{FALLBACK_ANSWER, MakeEnvironment, Rlm, RlmBuilder, RlmError, RlmOutcome, SUB_RLM_CLIENT};
pub use subcall::SubRlmClient;
