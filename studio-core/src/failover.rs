use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::FailoverSection;
use crate::provider::{
    Capability, GenerativeClient, ImageRequest, ProviderClient, ProviderConfig, ProviderKey,
    ProviderRegistry, ProviderResult, SpeechClip, SpeechRequest, TextRequest,
};
use crate::usage::{mentions_quota, UsageLedger, UsageOutcome};

#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("all {capability} providers exhausted (tried: {}){}", format_attempted(.attempted), format_last(.last_error))]
    AllProvidersExhausted {
        capability: Capability,
        attempted: Vec<String>,
        last_error: Option<String>,
    },
}

fn format_attempted(attempted: &[String]) -> String {
    if attempted.is_empty() {
        "none".to_string()
    } else {
        attempted.join(", ")
    }
}

fn format_last(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|error| format!("; last error: {error}"))
        .unwrap_or_default()
}

pub type FailoverResult<T> = std::result::Result<T, FailoverError>;

/// Creates the client handle for one provider configuration.
pub trait ClientFactory: Send + Sync {
    type Client: Send + Sync + 'static;

    fn create(&self, config: &Arc<ProviderConfig>) -> ProviderResult<Self::Client>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HttpClientFactory;

impl ClientFactory for HttpClientFactory {
    type Client = ProviderClient;

    fn create(&self, config: &Arc<ProviderConfig>) -> ProviderResult<Self::Client> {
        ProviderClient::new(Arc::clone(config))
    }
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_retries_per_provider: usize,
    pub delay: Duration,
    pub jitter: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries_per_provider: 3,
            delay: Duration::from_secs(5),
            jitter: Duration::ZERO,
        }
    }
}

impl RetrySettings {
    pub fn from_config(config: &FailoverSection) -> Self {
        Self {
            max_retries_per_provider: config.max_retry_per_api.max(1),
            delay: Duration::from_secs(config.retry_delay_seconds),
            jitter: Duration::from_secs(config.jitter_seconds),
        }
    }

    fn wait(&self) -> Duration {
        let mut wait = self.delay;
        if !self.jitter.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
            wait += Duration::from_millis(extra);
        }
        wait
    }
}

/// Routes a request across ranked providers, retrying each in place before
/// failing over to the next one.
pub struct FailoverExecutor<F: ClientFactory> {
    registry: Arc<ProviderRegistry>,
    ledger: Arc<UsageLedger>,
    factory: F,
    retry: RetrySettings,
    clients: Mutex<HashMap<ProviderKey, Arc<F::Client>>>,
}

impl<F: ClientFactory> FailoverExecutor<F> {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        ledger: Arc<UsageLedger>,
        factory: F,
        retry: RetrySettings,
    ) -> Self {
        Self {
            registry,
            ledger,
            factory,
            retry,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    pub fn retry_settings(&self) -> &RetrySettings {
        &self.retry
    }

    pub async fn execute<T, Op, Fut>(&self, capability: Capability, operation: Op) -> FailoverResult<T>
    where
        Op: FnMut(Arc<F::Client>, Arc<ProviderConfig>) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        self.execute_with(capability, self.retry.max_retries_per_provider, operation)
            .await
    }

    pub async fn execute_with<T, Op, Fut>(
        &self,
        capability: Capability,
        max_retries: usize,
        mut operation: Op,
    ) -> FailoverResult<T>
    where
        Op: FnMut(Arc<F::Client>, Arc<ProviderConfig>) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let attempts = max_retries.max(1);
        let mut attempted = Vec::new();
        let mut last_error = None;

        for key in self.registry.candidates(capability) {
            let Some(config) = self.registry.config(key) else {
                continue;
            };
            if !self.usable(&config) {
                debug!(provider = %key, %capability, "skipping provider for today");
                continue;
            }
            attempted.push(key.to_string());

            let client = match self.client_for(&config) {
                Ok(client) => client,
                Err(err) => {
                    let message = err.to_string();
                    warn!(provider = %key, %capability, error = %message, "cannot create provider client");
                    self.ledger.record(&config, UsageOutcome::Failure(&message));
                    last_error = Some(message);
                    continue;
                }
            };

            let mut attempt = 0;
            let outcome = loop {
                attempt += 1;
                match operation(Arc::clone(&client), Arc::clone(&config)).await {
                    Ok(value) => break Ok(value),
                    Err(err) => {
                        let message = err.to_string();
                        if mentions_quota(&message) || attempt >= attempts {
                            break Err(message);
                        }
                        let wait = self.retry.wait();
                        warn!(provider = %key, %capability, attempt, wait = ?wait, error = %message, "retrying provider request");
                        if !wait.is_zero() {
                            sleep(wait).await;
                        }
                    }
                }
            };

            match outcome {
                Ok(value) => {
                    self.ledger.record(&config, UsageOutcome::Success);
                    info!(provider = %key, %capability, attempts = attempt, "provider request succeeded");
                    return Ok(value);
                }
                Err(message) => {
                    warn!(provider = %key, %capability, attempts = attempt, error = %message, "provider failed; failing over");
                    self.ledger.record(&config, UsageOutcome::Failure(&message));
                    last_error = Some(message);
                }
            }
        }

        Err(FailoverError::AllProvidersExhausted {
            capability,
            attempted,
            last_error,
        })
    }

    fn usable(&self, config: &ProviderConfig) -> bool {
        if self.ledger.status(&config.key).blocks_requests() {
            return false;
        }
        if !self.ledger.is_within_quota(config) {
            self.ledger.mark_quota_exceeded(&config.key);
            return false;
        }
        true
    }

    fn client_for(&self, config: &Arc<ProviderConfig>) -> ProviderResult<Arc<F::Client>> {
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(&config.key) {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(self.factory.create(config)?);
        clients.insert(config.key.clone(), Arc::clone(&client));
        Ok(client)
    }
}

impl<F> FailoverExecutor<F>
where
    F: ClientFactory,
    F::Client: GenerativeClient,
{
    pub async fn generate_text(&self, request: TextRequest) -> FailoverResult<String> {
        self.execute(Capability::Text, move |client, _| {
            let request = request.clone();
            async move { client.generate_text(&request).await }
        })
        .await
    }

    pub async fn synthesize_speech(&self, request: SpeechRequest) -> FailoverResult<SpeechClip> {
        self.execute(Capability::Speech, move |client, _| {
            let request = request.clone();
            async move { client.synthesize_speech(&request).await }
        })
        .await
    }

    pub async fn generate_image(&self, request: ImageRequest) -> FailoverResult<Vec<u8>> {
        self.execute(Capability::Image, move |client, _| {
            let request = request.clone();
            async move { client.generate_image(&request).await }
        })
        .await
    }
}
