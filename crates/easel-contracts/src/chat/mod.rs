mod command_registry;
mod intent_parser;
mod routing;

pub use command_registry::CHAT_HELP_COMMANDS;
pub use intent_parser::{parse_intent, Intent};
pub use routing::{is_edit_style_prompt, route_prompt};
