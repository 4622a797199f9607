use opendum_provider::ProviderKind;

/// One routable model: canonical id, quota family, supporting providers
/// and accepted aliases.
#[derive(Debug, Clone, Copy)]
pub struct ModelEntry {
    pub id: &'static str,
    pub family: &'static str,
    pub providers: &'static [ProviderKind],
    pub aliases: &'static [&'static str],
}

impl ModelEntry {
    pub fn supported_by(&self, provider: ProviderKind) -> bool {
        self.providers.contains(&provider)
    }
}

const CLAUDE: &[ProviderKind] = &[ProviderKind::Claude];
const CODEX: &[ProviderKind] = &[ProviderKind::Codex];
const GEMINI: &[ProviderKind] = &[ProviderKind::Gemini];

static MODELS: &[ModelEntry] = &[
    ModelEntry {
        id: "claude-opus-4-1",
        family: "claude",
        providers: CLAUDE,
        aliases: &["claude-opus-4-1-20250805"],
    },
    ModelEntry {
        id: "claude-sonnet-4-5",
        family: "claude",
        providers: CLAUDE,
        aliases: &["claude-sonnet-4-5-20250929", "claude-sonnet-4-latest"],
    },
    ModelEntry {
        id: "claude-haiku-4-5",
        family: "claude",
        providers: CLAUDE,
        aliases: &["claude-haiku-4-5-20251001"],
    },
    ModelEntry {
        id: "gpt-5",
        family: "gpt",
        providers: CODEX,
        aliases: &["gpt-5-latest"],
    },
    ModelEntry {
        id: "gpt-5-codex",
        family: "gpt",
        providers: CODEX,
        aliases: &["codex"],
    },
    ModelEntry {
        id: "codex-mini-latest",
        family: "gpt",
        providers: CODEX,
        aliases: &["codex-mini"],
    },
    ModelEntry {
        id: "gemini-2.5-pro",
        family: "gemini",
        providers: GEMINI,
        aliases: &["gemini-pro"],
    },
    ModelEntry {
        id: "gemini-2.5-flash",
        family: "gemini",
        providers: GEMINI,
        aliases: &["gemini-flash"],
    },
];

/// Static lookup over the routable model set. Alias resolution happens
/// here so the rest of the pipeline only ever sees canonical ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelTable;

impl ModelTable {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, name: &str) -> Option<&'static ModelEntry> {
        MODELS.iter().find(|entry| {
            entry.id == name || entry.aliases.iter().any(|alias| *alias == name)
        })
    }

    /// Quota partition key for a model id. Unknown models fall back to
    /// their own id so they never alias another family's cool-downs.
    pub fn scope<'a>(&self, model: &'a str) -> &'a str {
        match self.resolve(model) {
            Some(entry) => entry.family,
            None => model,
        }
    }

    pub fn entries(&self) -> &'static [ModelEntry] {
        MODELS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_canonical_ids() {
        let table = ModelTable::new();
        let entry = table.resolve("claude-sonnet-4-5-20250929").unwrap();
        assert_eq!(entry.id, "claude-sonnet-4-5");
        assert_eq!(table.resolve("claude-sonnet-4-5").unwrap().id, entry.id);
    }

    #[test]
    fn unknown_models_are_rejected() {
        assert!(ModelTable::new().resolve("made-up-model").is_none());
    }

    #[test]
    fn scope_groups_by_family() {
        let table = ModelTable::new();
        assert_eq!(table.scope("gpt-5"), "gpt");
        assert_eq!(table.scope("gpt-5-codex"), "gpt");
        assert_eq!(table.scope("claude-haiku-4-5"), "claude");
    }

    #[test]
    fn provider_support_is_exact() {
        let table = ModelTable::new();
        let entry = table.resolve("gemini-2.5-pro").unwrap();
        assert!(entry.supported_by(ProviderKind::Gemini));
        assert!(!entry.supported_by(ProviderKind::Claude));
    }
}
