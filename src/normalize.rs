//! Turns loosely-shaped client payloads into one canonical chat completion request.
//!
//! Clients send `messages`, bare `prompt`/`input`/`content` strings, arrays of
//! fragments, or content parts in the OpenAI vision format. Everything is folded
//! into `{ model, messages: [{ role, content: String }], stream: false }` and the
//! remaining top-level fields are passed through untouched. Normalization never
//! fails: malformed input degrades to defaults.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::aliases::ModelAliasTable;

/// Top-level fields consulted, in order, when a payload carries no `messages`.
const TEXT_INPUT_FIELDS: [&str; 3] = ["prompt", "input", "content"];

/// Separator used when joining text fragments and content parts.
pub const JOIN_SEPARATOR: &str = " ";

pub const DEFAULT_MESSAGE: &str = "Hello!";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            extra: Map::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What to send when a payload carries no usable text at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmptyInputPolicy {
    /// Substitute a single user message with the configured default text.
    #[default]
    UseDefaultMessage,
    /// Forward an empty `messages` array and let the upstream reject it.
    PassEmpty,
}

#[derive(Clone, Debug)]
pub struct Normalizer {
    default_model: String,
    aliases: ModelAliasTable,
    on_empty_input: EmptyInputPolicy,
    default_message: String,
    provider_hint: Option<String>,
}

impl Normalizer {
    pub fn new(default_model: impl Into<String>, aliases: ModelAliasTable) -> Self {
        Self {
            default_model: default_model.into(),
            aliases,
            on_empty_input: EmptyInputPolicy::default(),
            default_message: DEFAULT_MESSAGE.to_string(),
            provider_hint: None,
        }
    }

    pub fn with_empty_input(
        mut self,
        policy: EmptyInputPolicy,
        default_message: impl Into<String>,
    ) -> Self {
        self.on_empty_input = policy;
        self.default_message = default_message.into();
        self
    }

    pub fn with_provider_hint(mut self, hint: Option<String>) -> Self {
        self.provider_hint = hint.filter(|h| !h.is_empty());
        self
    }

    pub fn aliases(&self) -> &ModelAliasTable {
        &self.aliases
    }

    /// The configured default model after alias resolution.
    pub fn default_model(&self) -> &str {
        self.aliases.resolve(&self.default_model)
    }

    pub fn normalize(&self, raw: Value) -> ChatRequest {
        let mut fields = match raw {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let mut messages = fields
            .remove("messages")
            .map(messages_from_value)
            .unwrap_or_default();

        if messages.is_empty() {
            if let Some(text) = take_text_input(&mut fields) {
                messages.push(ChatMessage::user(text));
            }
        }

        if messages.is_empty() && self.on_empty_input == EmptyInputPolicy::UseDefaultMessage {
            messages.push(ChatMessage::user(self.default_message.clone()));
        }

        let model = self.resolve_model(fields.remove("model"));

        // The relay buffers whole responses, so the outbound request never streams.
        fields.remove("stream");

        if let Some(hint) = &self.provider_hint {
            fields
                .entry("provider")
                .or_insert_with(|| json!({ "order": [hint] }));
        }

        ChatRequest {
            model,
            messages,
            stream: false,
            extra: fields,
        }
    }

    fn resolve_model(&self, requested: Option<Value>) -> String {
        let requested = requested
            .as_ref()
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());
        self.aliases.resolve(requested).to_string()
    }
}

fn take_text_input(fields: &mut Map<String, Value>) -> Option<String> {
    for key in TEXT_INPUT_FIELDS {
        let Some(value) = fields.get(key) else {
            continue;
        };
        let text = text_from_value(value);
        if !text.is_empty() {
            fields.remove(key);
            return Some(text);
        }
    }
    None
}

fn messages_from_value(value: Value) -> Vec<ChatMessage> {
    match value {
        Value::Array(items) => items.into_iter().filter_map(message_from_value).collect(),
        other => message_from_value(other).into_iter().collect(),
    }
}

fn message_from_value(value: Value) -> Option<ChatMessage> {
    match value {
        Value::Null => None,
        Value::Object(mut map) => {
            let role = map
                .remove("role")
                .and_then(|r| r.as_str().map(str::to_string))
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| "user".to_string());
            let content = map
                .remove("content")
                .map(|c| text_from_value(&c))
                .unwrap_or_default();
            Some(ChatMessage {
                role,
                content,
                extra: map,
            })
        }
        Value::String(s) => Some(ChatMessage::user(s)),
        other => Some(ChatMessage::user(other.to_string())),
    }
}

/// Coerces any JSON value into message text.
///
/// Arrays are treated as a list of fragments or content parts and joined with
/// [`JOIN_SEPARATOR`]; empty fragments are skipped.
fn text_from_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(text_from_value_part)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(JOIN_SEPARATOR),
        Value::Object(_) => text_from_value_part(value),
        other => other.to_string(),
    }
}

fn text_from_value_part(part: &Value) -> String {
    match part {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("text") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => part.to_string(),
            Some(other) => other.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> Normalizer {
        Normalizer::new("deepseek/deepseek-chat", ModelAliasTable::builtin())
    }

    #[test]
    fn prompt_string_becomes_single_user_message() {
        let req = normalizer().normalize(json!({ "prompt": "Say hi" }));
        assert_eq!(req.messages, vec![ChatMessage::user("Say hi")]);
        assert!(!req.extra.contains_key("prompt"));
    }

    #[test]
    fn prompt_sequence_is_joined_with_spaces() {
        let req = normalizer().normalize(json!({ "prompt": ["Say", "hi", 3] }));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, "user");
        assert_eq!(req.messages[0].content, "Say hi 3");
    }

    #[test]
    fn empty_prompt_falls_through_to_input() {
        let req = normalizer().normalize(json!({ "prompt": "", "input": "from input" }));
        assert_eq!(req.messages, vec![ChatMessage::user("from input")]);
        assert_eq!(req.extra.get("prompt"), Some(&json!("")));
    }

    #[test]
    fn top_level_content_is_used_as_last_resort() {
        let req = normalizer().normalize(json!({ "content": "lenient" }));
        assert_eq!(req.messages, vec![ChatMessage::user("lenient")]);
    }

    #[test]
    fn content_parts_are_flattened_into_text() {
        let req = normalizer().normalize(json!({
            "messages": [{ "role": "user", "content": [{ "text": "a" }, "b"] }]
        }));
        assert_eq!(req.messages[0].content, "a b");
    }

    #[test]
    fn content_part_without_text_uses_json_form() {
        let req = normalizer().normalize(json!({
            "messages": [{ "content": [{ "type": "image_url" }] }]
        }));
        assert_eq!(req.messages[0].content, r#"{"type":"image_url"}"#);
    }

    #[test]
    fn role_defaults_to_user_and_bare_strings_become_messages() {
        let req = normalizer().normalize(json!({
            "messages": ["plain", { "content": "no role" }, null]
        }));
        assert_eq!(
            req.messages,
            vec![ChatMessage::user("plain"), ChatMessage::user("no role")]
        );
    }

    #[test]
    fn message_passthrough_fields_are_preserved() {
        let req = normalizer().normalize(json!({
            "messages": [{ "role": "assistant", "content": null, "name": "bot" }]
        }));
        assert_eq!(req.messages[0].role, "assistant");
        assert_eq!(req.messages[0].content, "");
        assert_eq!(req.messages[0].extra.get("name"), Some(&json!("bot")));
    }

    #[test]
    fn empty_messages_array_falls_back_to_prompt() {
        let req = normalizer().normalize(json!({ "messages": [], "prompt": "hi" }));
        assert_eq!(req.messages, vec![ChatMessage::user("hi")]);
    }

    #[test]
    fn missing_text_uses_default_message() {
        let req = normalizer().normalize(json!({}));
        assert_eq!(req.messages, vec![ChatMessage::user(DEFAULT_MESSAGE)]);
    }

    #[test]
    fn missing_text_passes_empty_when_configured() {
        let req = normalizer()
            .with_empty_input(EmptyInputPolicy::PassEmpty, "unused")
            .normalize(json!({ "prompt": "" }));
        assert!(req.messages.is_empty());
    }

    #[test]
    fn non_object_input_degrades_to_defaults() {
        let req = normalizer().normalize(json!([1, 2, 3]));
        assert_eq!(req.model, "deepseek/deepseek-chat");
        assert_eq!(req.messages, vec![ChatMessage::user(DEFAULT_MESSAGE)]);
        assert!(req.extra.is_empty());
    }

    #[test]
    fn model_alias_is_resolved() {
        let req = normalizer().normalize(json!({ "model": "gpt-3.5-turbo", "prompt": "x" }));
        assert_eq!(req.model, "deepseek/deepseek-chat");
    }

    #[test]
    fn unknown_model_passes_through() {
        let req = normalizer().normalize(json!({ "model": "acme/unknown", "prompt": "x" }));
        assert_eq!(req.model, "acme/unknown");
    }

    #[test]
    fn missing_or_blank_model_uses_default() {
        let n = Normalizer::new("deepseek-r1", ModelAliasTable::builtin());
        assert_eq!(n.normalize(json!({})).model, "deepseek/deepseek-r1");
        assert_eq!(n.normalize(json!({ "model": "" })).model, "deepseek/deepseek-r1");
        assert_eq!(n.normalize(json!({ "model": 42 })).model, "deepseek/deepseek-r1");
        assert_eq!(n.default_model(), "deepseek/deepseek-r1");
    }

    #[test]
    fn stream_is_always_disabled() {
        for stream in [json!(true), json!(false), json!("yes"), Value::Null] {
            let req = normalizer().normalize(json!({ "prompt": "x", "stream": stream }));
            assert!(!req.stream);
            assert!(!req.extra.contains_key("stream"));

            let wire = serde_json::to_value(&req).unwrap();
            assert_eq!(wire["stream"], json!(false));
        }
    }

    #[test]
    fn passthrough_fields_survive_serialization() {
        let req = normalizer().normalize(json!({
            "prompt": "x",
            "temperature": 0.2,
            "max_tokens": 64
        }));
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(wire["temperature"], json!(0.2));
        assert_eq!(wire["max_tokens"], json!(64));
        assert_eq!(wire["messages"][0]["content"], json!("x"));
    }

    #[test]
    fn provider_hint_is_added_unless_caller_set_one() {
        let n = normalizer().with_provider_hint(Some("DeepInfra".to_string()));

        let req = n.normalize(json!({ "prompt": "x" }));
        assert_eq!(req.extra["provider"], json!({ "order": ["DeepInfra"] }));

        let req = n.normalize(json!({ "prompt": "x", "provider": { "order": ["Together"] } }));
        assert_eq!(req.extra["provider"], json!({ "order": ["Together"] }));
    }
}
