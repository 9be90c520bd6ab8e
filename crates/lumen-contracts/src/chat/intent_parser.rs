use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, SettingSpec, NO_ARG_COMMANDS, PROMPT_COMMANDS, SETTING_COMMANDS,
    SINGLE_PATH_COMMANDS, THREAD_COMMAND,
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

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn find_setting(command: &str) -> Option<&'static SettingSpec> {
    SETTING_COMMANDS.iter().find(|spec| spec.command == command)
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

fn setting_intent(spec: &SettingSpec, arg: &str, text: &str) -> Intent {
    if arg.is_empty() {
        let mut intent = Intent::new("invalid_setting", text);
        intent
            .command_args
            .insert("setting".to_string(), Value::String(spec.key.to_string()));
        intent
            .command_args
            .insert("value".to_string(), Value::String(String::new()));
        return intent;
    }
    if spec.numeric {
        return match arg.parse::<u64>() {
            Ok(value) if value > 0 => {
                let mut intent = Intent::new("update_settings", text);
                intent
                    .settings_update
                    .insert(spec.key.to_string(), Value::Number(value.into()));
                intent
            }
            _ => {
                let mut intent = Intent::new("invalid_setting", text);
                intent
                    .command_args
                    .insert("setting".to_string(), Value::String(spec.key.to_string()));
                intent
                    .command_args
                    .insert("value".to_string(), Value::String(arg.to_string()));
                intent
            }
        };
    }
    let mut intent = Intent::new("update_settings", text);
    intent
        .settings_update
        .insert(spec.key.to_string(), Value::String(arg.to_string()));
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

            if let Some(action) = find_action(&command, PROMPT_COMMANDS) {
                let mut intent = Intent::new(action, text);
                if !arg.is_empty() {
                    intent.prompt = Some(arg.to_string());
                }
                return intent;
            }

            if let Some(spec) = find_setting(&command) {
                return setting_intent(spec, arg, text);
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "path".to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if command == THREAD_COMMAND.command {
                let mut intent = Intent::new(THREAD_COMMAND.action, text);
                intent
                    .command_args
                    .insert("thread_id".to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("generate_image", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}
