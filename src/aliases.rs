use std::collections::HashMap;

/// Client-facing model names mapped to upstream model slugs.
///
/// Lookups are exact and case-sensitive. Unknown names pass through untouched,
/// so aliasing is best-effort rather than an allowlist.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelAliasTable {
    entries: HashMap<String, String>,
}

const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("deepseek/deepseek-chat:free", "deepseek/deepseek-chat"),
    ("deepseek-chat-v3-0324:free", "deepseek/deepseek-chat"),
    ("deepseek-chat-v3-0324", "deepseek/deepseek-chat"),
    ("deepseek-chat", "deepseek/deepseek-chat"),
    ("deepseek/deepseek-chat-v3-0324:free", "deepseek/deepseek-chat"),
    ("deepseek/deepseek-chat-v3-0324", "deepseek/deepseek-chat"),
    ("deepseek-coder", "deepseek/deepseek-coder"),
    ("deepseek/deepseek-coder:free", "deepseek/deepseek-coder"),
    ("deepseek-r1", "deepseek/deepseek-r1"),
    ("deepseek/deepseek-r1:free", "deepseek/deepseek-r1"),
    // OpenAI-style names clients send by default.
    ("gpt-3.5-turbo", "deepseek/deepseek-chat"),
    ("gpt-4o-mini", "deepseek/deepseek-chat"),
];

impl ModelAliasTable {
    pub fn builtin() -> Self {
        BUILTIN_ALIASES
            .iter()
            .map(|(alias, target)| (alias.to_string(), target.to_string()))
            .collect()
    }

    /// Adds or replaces entries; later pairs win.
    pub fn with_overrides<I>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.entries.extend(overrides);
        self
    }

    pub fn get(&self, alias: &str) -> Option<&str> {
        self.entries.get(alias).map(String::as_str)
    }

    /// Returns the mapped slug, or `model` itself when no alias matches.
    pub fn resolve<'a>(&'a self, model: &'a str) -> &'a str {
        self.get(model).unwrap_or(model)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for ModelAliasTable {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_maps_known_alias() {
        let table = ModelAliasTable::builtin();
        assert_eq!(table.resolve("gpt-4o-mini"), "deepseek/deepseek-chat");
        assert_eq!(table.resolve("deepseek-r1"), "deepseek/deepseek-r1");
    }

    #[test]
    fn resolve_passes_unknown_model_through() {
        let table = ModelAliasTable::builtin();
        assert_eq!(
            table.resolve("meta-llama/llama-3-8b-instruct"),
            "meta-llama/llama-3-8b-instruct"
        );
    }

    #[test]
    fn resolve_is_case_sensitive() {
        let table = ModelAliasTable::builtin();
        assert_eq!(table.resolve("GPT-4o-mini"), "GPT-4o-mini");
    }

    #[test]
    fn resolve_is_idempotent_for_builtin_table() {
        let table = ModelAliasTable::builtin();
        for (alias, _) in BUILTIN_ALIASES {
            let once = table.resolve(alias);
            assert_eq!(table.resolve(once), once, "alias {alias} is not stable");
        }
    }

    #[test]
    fn overrides_replace_builtin_entries() {
        let table = ModelAliasTable::builtin().with_overrides([
            ("gpt-4o-mini".to_string(), "openai/gpt-4o-mini".to_string()),
            ("house".to_string(), "mistralai/mistral-7b-instruct".to_string()),
        ]);

        assert_eq!(table.resolve("gpt-4o-mini"), "openai/gpt-4o-mini");
        assert_eq!(table.resolve("house"), "mistralai/mistral-7b-instruct");
        assert_eq!(table.len(), BUILTIN_ALIASES.len() + 1);
    }
}
