//! Role prompts and the structured output each role must return.

pub mod outputs;
pub mod parse;
pub mod prompts;

pub use outputs::{ArchitectOutput, DeveloperOutput, ReviewerOutput, RoleOutput};
pub use parse::{extract_json, parse_output, ParseFailure};
pub use prompts::{build_interactive_prompt, build_prompt, ContextEntry, COMPLETION_ACTION};
