use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ProviderSettings;
use crate::ordered::OrderedMap;
use crate::usage::UsageLedger;

use super::{Capability, ProviderConfig, ProviderKey};

/// Ranked provider configurations per capability.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    configs: HashMap<ProviderKey, Arc<ProviderConfig>>,
    order: Vec<ProviderKey>,
    candidates: HashMap<Capability, Vec<ProviderKey>>,
}

impl ProviderRegistry {
    /// Builds the registry and seeds a zero-valued usage record for every
    /// included pair the ledger does not know yet.
    pub fn load(
        providers: &OrderedMap<OrderedMap<ProviderSettings>>,
        ledger: &UsageLedger,
    ) -> Self {
        let registry = Self::from_settings(providers);
        for key in &registry.order {
            ledger.ensure(key);
        }
        info!(
            configs = registry.order.len(),
            text = registry.candidates(Capability::Text).len(),
            tts = registry.candidates(Capability::Speech).len(),
            image = registry.candidates(Capability::Image).len(),
            "provider registry loaded"
        );
        registry
    }

    pub fn from_settings(providers: &OrderedMap<OrderedMap<ProviderSettings>>) -> Self {
        let mut included = Vec::new();
        for (provider, configs) in providers.iter() {
            for (config_name, settings) in configs.iter() {
                let Some(config) = ProviderConfig::from_settings(provider, config_name, settings)
                else {
                    warn!(provider, config = config_name, "cannot determine provider kind; skipping");
                    continue;
                };
                if !config.has_credential() {
                    debug!(provider = %config.key, "no credential configured; skipping");
                    continue;
                }
                if !Capability::ALL.iter().any(|cap| config.serves(*cap)) {
                    debug!(provider = %config.key, "no usable capability; skipping");
                    continue;
                }
                included.push(Arc::new(config));
            }
        }

        let mut candidates = HashMap::new();
        for capability in Capability::ALL {
            let mut ranked: Vec<&Arc<ProviderConfig>> = included
                .iter()
                .filter(|config| config.serves(capability))
                .collect();
            // stable: equal priorities keep document order
            ranked.sort_by_key(|config| config.priority);
            candidates.insert(
                capability,
                ranked.into_iter().map(|config| config.key.clone()).collect(),
            );
        }

        let order = included.iter().map(|config| config.key.clone()).collect();
        let configs = included
            .into_iter()
            .map(|config| (config.key.clone(), config))
            .collect();
        Self {
            configs,
            order,
            candidates,
        }
    }

    /// Ranked keys for `capability`; empty when nothing can serve it.
    pub fn candidates(&self, capability: Capability) -> &[ProviderKey] {
        self.candidates
            .get(&capability)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn config(&self, key: &ProviderKey) -> Option<Arc<ProviderConfig>> {
        self.configs.get(key).cloned()
    }

    /// Included configurations in document order.
    pub fn configs(&self) -> impl Iterator<Item = &Arc<ProviderConfig>> {
        self.order.iter().filter_map(|key| self.configs.get(key))
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_studio_config;
    use crate::usage::{FixedClock, UsageStatus};
    use tempfile::tempdir;

    const PROVIDERS: &str = r#"
[providers.openai.late]
api_key = "k1"
model_text = "gpt"
priority = 5

[providers.gemini.first]
api_key = "k2"
model_text = "g"
model_tts = "g-tts"
priority = 5

[providers.gemini.keyless]
model_text = "g"
priority = 1

[providers.anthropic.top]
api_key = "k3"
model_text = "c"
model_tts = "ignored"
priority = 1

[providers.mystery.any]
api_key = "k4"
model_text = "m"

[providers.openai.unranked]
api_key = "k5"
model_image = "dall-e-3"
"#;

    fn names(keys: &[ProviderKey]) -> Vec<String> {
        keys.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn ranks_by_priority_with_stable_ties() {
        let config = parse_studio_config(PROVIDERS).unwrap();
        let registry = ProviderRegistry::from_settings(&config.providers);
        assert_eq!(
            names(registry.candidates(Capability::Text)),
            vec!["anthropic/top", "openai/late", "gemini/first"]
        );
        assert_eq!(
            names(registry.candidates(Capability::Speech)),
            vec!["gemini/first"]
        );
        assert_eq!(
            names(registry.candidates(Capability::Image)),
            vec!["openai/unranked"]
        );
        assert!(registry
            .config(&ProviderKey::new("gemini", "keyless"))
            .is_none());
        assert!(registry.config(&ProviderKey::new("mystery", "any")).is_none());
    }

    #[test]
    fn empty_capability_yields_no_candidates() {
        let config = parse_studio_config("").unwrap();
        let registry = ProviderRegistry::from_settings(&config.providers);
        assert!(registry.is_empty());
        assert!(registry.candidates(Capability::Image).is_empty());
    }

    #[test]
    fn load_seeds_ledger_records() {
        let dir = tempdir().unwrap();
        let ledger = UsageLedger::load(dir.path().join("usage.json"), Arc::new(FixedClock::default()));
        let config = parse_studio_config(PROVIDERS).unwrap();
        let registry = ProviderRegistry::load(&config.providers, &ledger);
        for key in registry.configs().map(|config| &config.key) {
            let record = ledger.snapshot(key).unwrap();
            assert_eq!(record.requests_today, 0);
            assert_eq!(record.status, UsageStatus::Active);
        }
        assert!(ledger.snapshot(&ProviderKey::new("gemini", "keyless")).is_none());
    }
}
