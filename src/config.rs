use std::net::SocketAddr;
use std::time::Duration;

use crate::aliases::ModelAliasTable;
use crate::dispatch::RetryPolicy;
use crate::normalize::{EmptyInputPolicy, DEFAULT_MESSAGE};

pub const DEFAULT_MODEL: &str = "deepseek/deepseek-chat";

/// Known-good models tried after the requested and default models.
pub const DEFAULT_FALLBACK_MODELS: [&str; 3] = [
    "deepseek/deepseek-chat",
    "deepseek/deepseek-coder",
    "deepseek/deepseek-r1",
];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub api_key: Option<String>,
    pub default_model: String,
    pub upstream_base_url: String,
    pub provider_hint: Option<String>,
    pub fallback_models: Vec<String>,
    pub model_aliases: ModelAliasTable,
    pub upstream_timeout: Duration,
    pub retry: RetryPolicy,
    pub on_empty_input: EmptyInputPolicy,
    pub default_message: String,
    pub http_referer: Option<String>,
    pub app_title: Option<String>,
    pub max_request_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            api_key: None,
            default_model: DEFAULT_MODEL.to_string(),
            upstream_base_url: "https://openrouter.ai/api".to_string(),
            provider_hint: None,
            fallback_models: DEFAULT_FALLBACK_MODELS.map(String::from).to_vec(),
            model_aliases: ModelAliasTable::builtin(),
            upstream_timeout: Duration::from_millis(60_000),
            retry: RetryPolicy::default(),
            on_empty_input: EmptyInputPolicy::default(),
            default_message: DEFAULT_MESSAGE.to_string(),
            http_referer: None,
            app_title: None,
            max_request_bytes: 1_048_576,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source. Unset or blank
    /// variables keep their defaults; malformed ones are errors.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let mut cfg = Self::default();

        if let Some(addr) = env.string("LISTEN_ADDR") {
            cfg.listen_addr = addr
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid LISTEN_ADDR {addr:?}: {e}"))?;
        } else if let Some(port) = env.parse::<u16>("PORT")? {
            cfg.listen_addr.set_port(port);
        }

        cfg.api_key = env.string("OPENROUTER_KEY");
        if let Some(model) = env.string("OPENROUTER_MODEL") {
            cfg.default_model = model;
        }
        if let Some(url) = env.string("OPENROUTER_BASE_URL") {
            cfg.upstream_base_url = url;
        }
        cfg.provider_hint = env.string("OPENROUTER_PROVIDER");

        if let Some(raw) = env.string("FALLBACK_MODELS") {
            cfg.fallback_models = parse_model_list(&raw);
        }
        if let Some(raw) = env.string("MODEL_ALIASES") {
            cfg.model_aliases =
                ModelAliasTable::builtin().with_overrides(parse_alias_overrides(&raw)?);
        }

        if let Some(ms) = env.parse::<u64>("UPSTREAM_TIMEOUT_MS")? {
            cfg.upstream_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = env.parse::<u32>("UPSTREAM_MAX_ATTEMPTS")? {
            if attempts == 0 {
                return Err(anyhow::anyhow!("UPSTREAM_MAX_ATTEMPTS must be at least 1"));
            }
            cfg.retry.max_attempts = attempts;
        }
        if let Some(ms) = env.parse::<u64>("UPSTREAM_BACKOFF_MS")? {
            cfg.retry.backoff_step = Duration::from_millis(ms);
        }
        if let Some(retry) = env.bool("RETRY_ON_429")? {
            cfg.retry.retry_rate_limited = retry;
        }

        if let Some(raw) = env.string("ON_EMPTY_INPUT") {
            cfg.on_empty_input = parse_empty_input_policy(&raw)?;
        }
        if let Some(message) = env.string("DEFAULT_MESSAGE") {
            cfg.default_message = message;
        }

        cfg.http_referer = env.string("HTTP_REFERER");
        cfg.app_title = env.string("X_TITLE");

        if let Some(value) = env.parse::<usize>("MAX_REQUEST_BYTES")? {
            cfg.max_request_bytes = value;
        }

        Ok(cfg)
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        let value = (self.0)(name)?;
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    fn parse<T>(&self, name: &str) -> anyhow::Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.string(name) else {
            return Ok(None);
        };
        raw.parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid value for {name}: {raw:?}: {e}"))
    }

    fn bool(&self, name: &str) -> anyhow::Result<Option<bool>> {
        let Some(raw) = self.string(name) else {
            return Ok(None);
        };

        let value = match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(anyhow::anyhow!(
                    "invalid boolean value for {name}: {raw:?} (expected true/false)"
                ));
            }
        };

        Ok(Some(value))
    }
}

fn parse_model_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses `alias=target` pairs separated by commas.
fn parse_alias_overrides(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((alias, target)) = pair.split_once('=') else {
            return Err(anyhow::anyhow!(
                "invalid entry in MODEL_ALIASES: {pair:?} (expected alias=target)"
            ));
        };
        let (alias, target) = (alias.trim(), target.trim());
        if alias.is_empty() || target.is_empty() {
            return Err(anyhow::anyhow!(
                "invalid entry in MODEL_ALIASES: {pair:?} (empty alias or target)"
            ));
        }
        out.push((alias.to_string(), target.to_string()));
    }
    Ok(out)
}

fn parse_empty_input_policy(raw: &str) -> anyhow::Result<EmptyInputPolicy> {
    match raw.to_ascii_lowercase().as_str() {
        "default_message" | "default" => Ok(EmptyInputPolicy::UseDefaultMessage),
        "pass_empty" | "empty" => Ok(EmptyInputPolicy::PassEmpty),
        _ => Err(anyhow::anyhow!(
            "invalid value for ON_EMPTY_INPUT: {raw:?} (expected default_message/pass_empty)"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn empty_environment_keeps_defaults() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.api_key, None);
        assert_eq!(cfg.default_model, DEFAULT_MODEL);
        assert_eq!(cfg.upstream_timeout, Duration::from_secs(60));
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.fallback_models.len(), 3);
    }

    #[test]
    fn blank_key_counts_as_missing() {
        let cfg = config_from(&[("OPENROUTER_KEY", "   ")]).unwrap();
        assert_eq!(cfg.api_key, None);
    }

    #[test]
    fn port_is_used_when_listen_addr_is_unset() {
        let cfg = config_from(&[("PORT", "10000")]).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:10000".parse().unwrap());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config_from(&[
            ("OPENROUTER_KEY", "sk-test"),
            ("OPENROUTER_MODEL", "deepseek-r1"),
            ("FALLBACK_MODELS", " a/b , ,c/d "),
            ("MODEL_ALIASES", "house=a/b, gpt-4o-mini = c/d"),
            ("UPSTREAM_TIMEOUT_MS", "20000"),
            ("UPSTREAM_MAX_ATTEMPTS", "2"),
            ("RETRY_ON_429", "off"),
            ("ON_EMPTY_INPUT", "pass_empty"),
        ])
        .unwrap();

        assert_eq!(cfg.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.default_model, "deepseek-r1");
        assert_eq!(cfg.fallback_models, vec!["a/b", "c/d"]);
        assert_eq!(cfg.model_aliases.resolve("house"), "a/b");
        assert_eq!(cfg.model_aliases.resolve("gpt-4o-mini"), "c/d");
        assert_eq!(cfg.model_aliases.resolve("deepseek-chat"), "deepseek/deepseek-chat");
        assert_eq!(cfg.upstream_timeout, Duration::from_secs(20));
        assert_eq!(cfg.retry.max_attempts, 2);
        assert!(!cfg.retry.retry_rate_limited);
        assert_eq!(cfg.on_empty_input, EmptyInputPolicy::PassEmpty);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(config_from(&[("UPSTREAM_TIMEOUT_MS", "soon")]).is_err());
        assert!(config_from(&[("RETRY_ON_429", "maybe")]).is_err());
        assert!(config_from(&[("MODEL_ALIASES", "no-equals-sign")]).is_err());
        assert!(config_from(&[("ON_EMPTY_INPUT", "shrug")]).is_err());
        assert!(config_from(&[("UPSTREAM_MAX_ATTEMPTS", "0")]).is_err());
    }
}
