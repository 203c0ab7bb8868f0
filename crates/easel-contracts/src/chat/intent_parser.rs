use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, MULTI_PATH_COMMANDS, NO_ARG_COMMANDS, PROMPT_COMMANDS, RAW_ARG_COMMANDS,
    SINGLE_PATH_COMMANDS, TOGGLE_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub settings_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            settings_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
        }
    }
}

fn find_spec<'a>(command: &str, specs: &'a [CommandSpec]) -> Option<&'a CommandSpec> {
    specs.iter().find(|spec| spec.command == command)
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = parse_path_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

fn parse_toggle(arg: &str) -> Option<bool> {
    match arg.trim().to_ascii_lowercase().as_str() {
        "" | "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn unknown(text: &str, command: String, arg: &str) -> Intent {
    let mut intent = Intent::new("unknown", text);
    intent
        .command_args
        .insert("command".to_string(), Value::String(command));
    intent
        .command_args
        .insert("arg".to_string(), Value::String(arg.to_string()));
    intent
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let remainder = &slash_tail[command_len..];
            let arg = if remainder.is_empty() {
                ""
            } else {
                remainder.trim()
            };

            if let Some(spec) = find_spec(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(spec.action, text);
                intent
                    .command_args
                    .insert(spec.arg_key.to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if PROMPT_COMMANDS.iter().any(|value| *value == command) {
                let mut intent = Intent::new(&command, text);
                if !arg.is_empty() {
                    intent.prompt = Some(arg.to_string());
                }
                return intent;
            }

            if TOGGLE_COMMANDS.iter().any(|value| *value == command) {
                let Some(enabled) = parse_toggle(arg) else {
                    return unknown(text, command, arg);
                };
                let mut intent = Intent::new("update_settings", text);
                intent.settings_update.insert(command, Value::Bool(enabled));
                return intent;
            }

            if command == "multiplier" {
                let Ok(value) = arg.parse::<u64>() else {
                    return unknown(text, command, arg);
                };
                let mut intent = Intent::new("update_settings", text);
                intent
                    .settings_update
                    .insert("multiplier".to_string(), Value::Number(value.into()));
                return intent;
            }

            if let Some(spec) = find_spec(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(spec.action, text);
                intent.command_args.insert(
                    spec.arg_key.to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(spec) = find_spec(&command, MULTI_PATH_COMMANDS) {
                let mut intent = Intent::new(spec.action, text);
                intent.command_args.insert(
                    spec.arg_key.to_string(),
                    Value::Array(
                        parse_path_args(arg)
                            .into_iter()
                            .map(Value::String)
                            .collect(),
                    ),
                );
                return intent;
            }

            if let Some(spec) = find_spec(&command, NO_ARG_COMMANDS) {
                return Intent::new(spec.action, text);
            }

            return unknown(text, command, arg);
        }
    }

    let mut intent = Intent::new("prompt", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}
