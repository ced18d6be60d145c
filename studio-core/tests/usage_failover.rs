use std::sync::Arc;
use std::time::Duration;

use studio_core::failover::{ClientFactory, FailoverExecutor, RetrySettings};
use studio_core::provider::{Capability, ProviderConfig, ProviderKey, ProviderRegistry, ProviderResult};
use studio_core::usage::{read_history, Clock, FixedClock, UsageLedger, UsageStatus};
use studio_core::{parse_studio_config, StudioConfig};

const PROVIDERS: &str = r#"
[providers.alpha.main]
kind = "gemini"
api_key = "a"
model_text = "gemini-2.5-pro"
priority = 1
daily_quota = 2
cost_per_request = 0.5

[providers.beta.main]
kind = "anthropic"
api_key = "b"
model_text = "claude-sonnet"
priority = 2
"#;

struct UnitFactory;

impl ClientFactory for UnitFactory {
    type Client = ();

    fn create(&self, _config: &Arc<ProviderConfig>) -> ProviderResult<()> {
        Ok(())
    }
}

fn executor(config: &StudioConfig, ledger: Arc<UsageLedger>) -> FailoverExecutor<UnitFactory> {
    let registry = Arc::new(ProviderRegistry::load(&config.providers, &ledger));
    let retry = RetrySettings {
        max_retries_per_provider: 1,
        delay: Duration::ZERO,
        jitter: Duration::ZERO,
    };
    FailoverExecutor::new(registry, ledger, UnitFactory, retry)
}

async fn served_by(executor: &FailoverExecutor<UnitFactory>) -> String {
    executor
        .execute(Capability::Text, |_client, config| async move {
            Ok(config.key.provider.clone())
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn quota_survives_restart_and_resets_next_day() {
    let dir = tempfile::tempdir().unwrap();
    let usage_file = dir.path().join("api_usage.json");
    let config = parse_studio_config(PROVIDERS).unwrap();
    let clock = Arc::new(FixedClock::at_date(2025, 3, 9));
    let alpha = ProviderKey::new("alpha", "main");

    {
        let ledger = Arc::new(UsageLedger::load(&usage_file, clock.clone()));
        let executor = executor(&config, Arc::clone(&ledger));
        assert_eq!(served_by(&executor).await, "alpha");
        assert_eq!(served_by(&executor).await, "alpha");
        assert_eq!(served_by(&executor).await, "beta");
        let record = ledger.snapshot(&alpha).unwrap();
        assert_eq!(record.status, UsageStatus::QuotaExceeded);
        assert_eq!(record.requests_today, 2);
        assert!((record.total_cost_today - 1.0).abs() < 1e-9);
    }

    let ledger = Arc::new(UsageLedger::load(&usage_file, clock.clone()));
    assert_eq!(ledger.status(&alpha), UsageStatus::QuotaExceeded);
    let executor = executor(&config, Arc::clone(&ledger));
    assert_eq!(served_by(&executor).await, "beta");

    clock.advance(chrono::Duration::days(1));
    assert_eq!(served_by(&executor).await, "alpha");
    assert_eq!(ledger.status(&alpha), UsageStatus::Active);
    assert_eq!(ledger.snapshot(&alpha).unwrap().requests_today, 1);

    let history = read_history(&usage_file).unwrap();
    assert_eq!(
        history.keys().cloned().collect::<Vec<_>>(),
        vec!["2025-03-09".to_string(), "2025-03-10".to_string()]
    );
    assert_eq!(history["2025-03-09"]["alpha_main"].requests_today, 2);
    assert_eq!(history["2025-03-09"]["beta_main"].requests_today, 2);
    assert_eq!(clock.today().to_string(), "2025-03-10");
}
