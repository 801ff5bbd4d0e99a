//! Bounded retry, credential rotation and model failover for provider calls.
//!
//! Each call runs as an explicit loop over
//! `ATTEMPT -> {SUCCESS, RETRY_SAME_KEY, ROTATE_KEY, SWITCH_MODEL, FATAL}`.
//! The decision table lives in [`OrchestratorSettings::transition`] and is a
//! pure function of the attempt outcome and the per-call counters.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::capabilities::CapabilityTable;
use crate::credentials::{Credential, CredentialRotator};
use crate::error::{Error, Result};
use crate::provider::{
    snippet, EmbeddingBatch, EmbeddingRequest, ProviderCall, ProviderResponse, ProviderTransport,
    TransportError,
};
use crate::rate_limit::{RateLimitAction, RateLimitDecision, RateLimitPolicy};

/// Tunables for the retry loop.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Upper bound for exponential backoff.
    pub max_backoff: Duration,
    /// Pause before retrying a rejected credential.
    pub auth_backoff: Duration,
    /// Pause after a client-side timeout.
    pub timeout_backoff: Duration,
    /// Pause after an unclassified failure.
    pub generic_backoff: Duration,
    /// Consecutive auth failures before a credential is rotated out.
    pub auth_failures_before_rotate: usize,
    /// Deadline for one whole call, including sleeps.
    pub call_timeout: Option<Duration>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_backoff: Duration::from_secs(32),
            auth_backoff: Duration::from_secs(2),
            timeout_backoff: Duration::from_secs(5),
            generic_backoff: Duration::from_secs(3),
            auth_failures_before_rotate: 3,
            call_timeout: None,
        }
    }
}

/// Classified result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 2xx with a parsed body, plus any exhausted quota from the headers.
    Completed(Option<RateLimitDecision>),
    /// 401 or 403.
    AuthFailed,
    /// 429.
    RateLimited,
    /// 5xx.
    ServerError,
    /// Connection-level failure.
    NetworkError,
    /// Client-side timeout.
    TimedOut,
    /// Any other status or transport failure.
    OtherError,
}

impl AttemptOutcome {
    /// Short name used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Completed(None) => "ok",
            AttemptOutcome::Completed(Some(_)) => "ok_quota_exhausted",
            AttemptOutcome::AuthFailed => "auth_failed",
            AttemptOutcome::RateLimited => "rate_limited",
            AttemptOutcome::ServerError => "server_error",
            AttemptOutcome::NetworkError => "network_error",
            AttemptOutcome::TimedOut => "timeout",
            AttemptOutcome::OtherError => "other_error",
        }
    }
}

/// Next step of the call loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Return the completed response after `wait`.
    Success {
        /// Quota reset wait before returning.
        wait: Duration,
    },
    /// Retry the same model with the same credential after `wait`.
    RetrySameKey {
        /// Backoff before the next attempt.
        wait: Duration,
    },
    /// Mark the credential failed and retry the same model with the next one.
    RotateKey,
    /// Move to the next model in the failover queue.
    SwitchModel,
    /// Stop and surface the last error.
    Fatal,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Success { .. } => f.write_str("success"),
            Transition::RetrySameKey { .. } => f.write_str("retry_same_key"),
            Transition::RotateKey => f.write_str("rotate_key"),
            Transition::SwitchModel => f.write_str("switch_model"),
            Transition::Fatal => f.write_str("fatal"),
        }
    }
}

/// Per-call state consulted by [`OrchestratorSettings::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptCounters {
    /// Attempts on the current (model, credential) pair, this one included.
    pub pair_attempts: usize,
    /// Consecutive auth failures on the current credential, this one included.
    pub auth_streak: usize,
    /// Some credential has not been tried on the current model yet.
    pub untried_keys: bool,
    /// Some credential has not been rejected for authentication.
    pub keys_left_for_auth: bool,
}

impl OrchestratorSettings {
    /// Decision table for one attempt. `bound` is the per-pair attempt limit
    /// of the call kind.
    pub fn transition(
        &self,
        outcome: AttemptOutcome,
        counters: AttemptCounters,
        bound: usize,
    ) -> Transition {
        let within_bound = counters.pair_attempts < bound;
        match outcome {
            AttemptOutcome::Completed(None) => Transition::Success {
                wait: Duration::ZERO,
            },
            AttemptOutcome::Completed(Some(decision)) => match decision.action {
                RateLimitAction::Sleep => Transition::Success {
                    wait: decision.wait,
                },
                RateLimitAction::RotateCredential if counters.untried_keys => {
                    Transition::RotateKey
                }
                RateLimitAction::RotateCredential => Transition::Success {
                    wait: Duration::ZERO,
                },
            },
            AttemptOutcome::AuthFailed => {
                if counters.auth_streak < self.auth_failures_before_rotate {
                    Transition::RetrySameKey {
                        wait: self.auth_backoff,
                    }
                } else if counters.keys_left_for_auth {
                    Transition::RotateKey
                } else {
                    Transition::Fatal
                }
            }
            AttemptOutcome::RateLimited => {
                if within_bound {
                    Transition::RetrySameKey {
                        wait: self.backoff(counters.pair_attempts),
                    }
                } else if counters.untried_keys {
                    Transition::RotateKey
                } else {
                    Transition::SwitchModel
                }
            }
            AttemptOutcome::ServerError | AttemptOutcome::NetworkError => {
                self.retry_or_switch(within_bound, self.backoff(counters.pair_attempts))
            }
            AttemptOutcome::TimedOut => self.retry_or_switch(within_bound, self.timeout_backoff),
            AttemptOutcome::OtherError => self.retry_or_switch(within_bound, self.generic_backoff),
        }
    }

    /// `2^(attempt-1)` seconds, capped at [`max_backoff`](Self::max_backoff).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as u32;
        Duration::from_secs(1u64 << exp).min(self.max_backoff)
    }

    fn retry_or_switch(&self, within_bound: bool, wait: Duration) -> Transition {
        if within_bound {
            Transition::RetrySameKey { wait }
        } else {
            Transition::SwitchModel
        }
    }
}

enum Attempt<T> {
    Completed {
        output: T,
        quota: Option<RateLimitDecision>,
    },
    Failed {
        outcome: AttemptOutcome,
        error: Error,
    },
}

/// Executes provider calls against a capability table with one shared
/// credential rotator.
#[derive(Clone)]
pub struct ProviderOrchestrator {
    transport: Arc<dyn ProviderTransport>,
    capabilities: Arc<CapabilityTable>,
    keys: Arc<Mutex<CredentialRotator>>,
    policy: RateLimitPolicy,
    settings: OrchestratorSettings,
}

impl ProviderOrchestrator {
    /// Builds an orchestrator with default policy and settings.
    pub fn new(
        transport: Arc<dyn ProviderTransport>,
        capabilities: Arc<CapabilityTable>,
        keys: CredentialRotator,
    ) -> Self {
        Self {
            transport,
            capabilities,
            keys: Arc::new(Mutex::new(keys)),
            policy: RateLimitPolicy::default(),
            settings: OrchestratorSettings::default(),
        }
    }

    /// Replaces the rate-limit policy.
    pub fn with_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the retry settings.
    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Capability table used to resolve labels.
    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    /// Runs `call` under `label` until it succeeds or a terminal error is reached.
    ///
    /// With [`OrchestratorSettings::call_timeout`] set, expiry aborts any
    /// in-flight request or sleep and returns [`Error::Cancelled`].
    pub async fn execute<C: ProviderCall>(&self, label: &str, call: &C) -> Result<C::Output> {
        let attempts = AtomicUsize::new(0);
        let started = Instant::now();
        let work = self.run(label, call, &attempts);
        let Some(limit) = self.settings.call_timeout else {
            return work.await;
        };
        match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => {
                let attempts = attempts.load(Ordering::Relaxed);
                tracing::warn!(
                    target: "fastrag::provider",
                    label,
                    kind = call.kind().as_str(),
                    attempts,
                    "provider call cancelled by deadline"
                );
                Err(Error::Cancelled {
                    elapsed: started.elapsed(),
                    attempts,
                })
            }
        }
    }

    /// Embeds `inputs` in one batch; an empty input returns an empty batch
    /// without calling the provider.
    pub async fn embed(&self, label: &str, inputs: &[String]) -> Result<EmbeddingBatch> {
        if inputs.is_empty() {
            return Ok(EmbeddingBatch {
                model: String::new(),
                vectors: Vec::new(),
            });
        }
        self.execute(label, &EmbeddingRequest::new(inputs.iter().cloned()))
            .await
    }

    async fn run<C: ProviderCall>(
        &self,
        label: &str,
        call: &C,
        attempts: &AtomicUsize,
    ) -> Result<C::Output> {
        let mut queue = self.capabilities.queue(label)?;
        let bound = call.max_attempts().max(1);
        let (mut credential, key_count) = {
            let mut keys = self.keys.lock().await;
            (keys.current(), keys.len())
        };
        let budget = bound * queue.len() * key_count + 1;

        let mut model = queue.current();
        let mut pair_attempts = 0usize;
        let mut auth_streak = 0usize;
        let mut tried: HashSet<Credential> = HashSet::from([credential.clone()]);
        let mut auth_rejected: HashSet<Credential> = HashSet::new();
        let mut last_error: Option<Error> = None;
        let mut total = 0usize;

        loop {
            if total >= budget {
                return Err(exhausted(label, model, &credential, total, last_error));
            }
            total += 1;
            pair_attempts += 1;
            attempts.store(total, Ordering::Relaxed);

            let started = Instant::now();
            let attempt = self.attempt(call, model, &credential, total).await?;
            let (outcome, output) = match attempt {
                Attempt::Completed { output, quota } => {
                    auth_streak = 0;
                    (AttemptOutcome::Completed(quota), Some(output))
                }
                Attempt::Failed { outcome, error } => {
                    if outcome == AttemptOutcome::AuthFailed {
                        auth_streak += 1;
                        if auth_streak >= self.settings.auth_failures_before_rotate {
                            auth_rejected.insert(credential.clone());
                        }
                    } else {
                        auth_streak = 0;
                    }
                    last_error = Some(error);
                    (outcome, None)
                }
            };
            let counters = AttemptCounters {
                pair_attempts,
                auth_streak,
                untried_keys: tried.len() < key_count,
                keys_left_for_auth: auth_rejected.len() < key_count,
            };
            let transition = self.settings.transition(outcome, counters, bound);
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match outcome {
                AttemptOutcome::Completed(_) => tracing::debug!(
                    target: "fastrag::provider",
                    label,
                    kind = call.kind().as_str(),
                    model,
                    key = %credential,
                    attempt = pair_attempts,
                    total,
                    outcome = outcome.as_str(),
                    transition = %transition,
                    elapsed_ms,
                    "provider attempt"
                ),
                _ => tracing::warn!(
                    target: "fastrag::provider",
                    label,
                    kind = call.kind().as_str(),
                    model,
                    key = %credential,
                    attempt = pair_attempts,
                    total,
                    outcome = outcome.as_str(),
                    transition = %transition,
                    elapsed_ms,
                    error = %last_error.as_ref().map(ToString::to_string).unwrap_or_default(),
                    "provider attempt"
                ),
            }

            match transition {
                Transition::Success { wait } => {
                    let Some(output) = output else {
                        continue;
                    };
                    if !wait.is_zero() {
                        tracing::info!(
                            target: "fastrag::provider",
                            model,
                            key = %credential,
                            wait_ms = wait.as_millis() as u64,
                            "quota exhausted, waiting for reset"
                        );
                        tokio::time::sleep(wait).await;
                    }
                    return Ok(output);
                }
                Transition::RetrySameKey { wait } => {
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }
                Transition::RotateKey => {
                    credential = self.keys.lock().await.fail_over(&credential);
                    tried.insert(credential.clone());
                    pair_attempts = 0;
                    auth_streak = 0;
                }
                Transition::SwitchModel => {
                    let Some(next) = queue.next() else {
                        return Err(exhausted(label, model, &credential, total, last_error));
                    };
                    tracing::info!(
                        target: "fastrag::provider",
                        label,
                        from = model,
                        to = next,
                        "switching model"
                    );
                    model = next;
                    credential = self.keys.lock().await.current();
                    tried.clear();
                    tried.insert(credential.clone());
                    pair_attempts = 0;
                    auth_streak = 0;
                }
                Transition::Fatal => {
                    return Err(last_error.unwrap_or_else(|| {
                        exhausted(label, model, &credential, total, None)
                    }));
                }
            }
        }
    }

    async fn attempt<C: ProviderCall>(
        &self,
        call: &C,
        model: &str,
        credential: &Credential,
        total: usize,
    ) -> Result<Attempt<C::Output>> {
        let request = call.request(model)?;
        let response = match self.transport.send(&request, credential).await {
            Ok(response) => response,
            Err(err) => {
                let model = model.to_string();
                let key_prefix = credential.prefix().to_string();
                let (outcome, error) = match err {
                    TransportError::Timeout => (
                        AttemptOutcome::TimedOut,
                        Error::Timeout {
                            model,
                            key_prefix,
                            attempts: total,
                        },
                    ),
                    TransportError::Network(message) => (
                        AttemptOutcome::NetworkError,
                        Error::Network {
                            model,
                            key_prefix,
                            attempts: total,
                            message,
                        },
                    ),
                    TransportError::Other(message) => (
                        AttemptOutcome::OtherError,
                        Error::Request {
                            model,
                            key_prefix,
                            attempts: total,
                            message,
                        },
                    ),
                };
                return Ok(Attempt::Failed { outcome, error });
            }
        };

        if (200..300).contains(&response.status) {
            let output = call.parse(model, &response).map_err(|err| {
                tracing::error!(
                    target: "fastrag::provider",
                    model,
                    key = %credential,
                    error = %err,
                    "provider returned a malformed payload"
                );
                err
            })?;
            return Ok(Attempt::Completed {
                output,
                quota: self.policy.decide(&response.headers),
            });
        }
        Ok(self.classify_status(model, credential, total, &response))
    }

    fn classify_status<T>(
        &self,
        model: &str,
        credential: &Credential,
        total: usize,
        response: &ProviderResponse,
    ) -> Attempt<T> {
        let model = model.to_string();
        let (outcome, error) = match response.status {
            401 | 403 => (
                AttemptOutcome::AuthFailed,
                Error::Auth {
                    model,
                    key_prefix: credential.prefix().to_string(),
                    attempts: total,
                },
            ),
            429 => (
                AttemptOutcome::RateLimited,
                Error::RateLimited {
                    model,
                    key_prefix: credential.prefix().to_string(),
                    attempts: total,
                    retry_after: retry_after(&self.policy, response),
                },
            ),
            status @ 500..=599 => (
                AttemptOutcome::ServerError,
                Error::Server {
                    status,
                    model,
                    key_prefix: credential.prefix().to_string(),
                    attempts: total,
                    body: snippet(&response.body),
                },
            ),
            status => (
                AttemptOutcome::OtherError,
                Error::Http {
                    status,
                    model,
                    key_prefix: credential.prefix().to_string(),
                    attempts: total,
                    body: snippet(&response.body),
                },
            ),
        };
        Attempt::Failed { outcome, error }
    }
}

impl fmt::Debug for ProviderOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderOrchestrator")
            .field("labels", &self.capabilities.labels().count())
            .field("policy", &self.policy)
            .field("settings", &self.settings)
            .finish()
    }
}

fn retry_after(policy: &RateLimitPolicy, response: &ProviderResponse) -> Option<Duration> {
    response
        .headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .or_else(|| policy.decide(&response.headers).map(|decision| decision.wait))
}

fn exhausted(
    label: &str,
    model: &str,
    credential: &Credential,
    attempts: usize,
    last_error: Option<Error>,
) -> Error {
    let last_error = last_error.unwrap_or_else(|| Error::RateLimited {
        model: model.to_string(),
        key_prefix: credential.prefix().to_string(),
        attempts,
        retry_after: None,
    });
    Error::CapabilityExhausted {
        label: label.to_string(),
        last_model: model.to_string(),
        key_prefix: credential.prefix().to_string(),
        attempts,
        last_error: Box::new(last_error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitScope;
    use pretty_assertions::assert_eq;

    fn counters(pair_attempts: usize) -> AttemptCounters {
        AttemptCounters {
            pair_attempts,
            auth_streak: 0,
            untried_keys: true,
            keys_left_for_auth: true,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = OrchestratorSettings::default();
        assert_eq!(settings.backoff(1), Duration::from_secs(1));
        assert_eq!(settings.backoff(3), Duration::from_secs(4));
        assert_eq!(settings.backoff(6), Duration::from_secs(32));
        assert_eq!(settings.backoff(40), Duration::from_secs(32));
    }

    #[test]
    fn header_sleep_scope_still_succeeds() {
        let settings = OrchestratorSettings::default();
        let decision = RateLimitDecision {
            scope: RateLimitScope::Minute,
            action: RateLimitAction::Sleep,
            wait: Duration::from_secs(7),
        };
        assert_eq!(
            settings.transition(AttemptOutcome::Completed(Some(decision)), counters(1), 3),
            Transition::Success {
                wait: Duration::from_secs(7)
            }
        );
    }

    #[test]
    fn header_rotate_scope_rotates_until_keys_run_out() {
        let settings = OrchestratorSettings::default();
        let decision = RateLimitDecision {
            scope: RateLimitScope::Day,
            action: RateLimitAction::RotateCredential,
            wait: Duration::from_secs(3600),
        };
        let outcome = AttemptOutcome::Completed(Some(decision));
        assert_eq!(
            settings.transition(outcome, counters(1), 3),
            Transition::RotateKey
        );
        let exhausted = AttemptCounters {
            untried_keys: false,
            ..counters(1)
        };
        assert_eq!(
            settings.transition(outcome, exhausted, 3),
            Transition::Success {
                wait: Duration::ZERO
            }
        );
    }

    #[test]
    fn auth_rotates_after_three_consecutive_failures() {
        let settings = OrchestratorSettings::default();
        let mut state = counters(1);
        state.auth_streak = 2;
        assert_eq!(
            settings.transition(AttemptOutcome::AuthFailed, state, 3),
            Transition::RetrySameKey {
                wait: Duration::from_secs(2)
            }
        );
        state.auth_streak = 3;
        assert_eq!(
            settings.transition(AttemptOutcome::AuthFailed, state, 3),
            Transition::RotateKey
        );
        state.keys_left_for_auth = false;
        assert_eq!(
            settings.transition(AttemptOutcome::AuthFailed, state, 3),
            Transition::Fatal
        );
    }

    #[test]
    fn rate_limit_retries_then_rotates_then_switches() {
        let settings = OrchestratorSettings::default();
        assert_eq!(
            settings.transition(AttemptOutcome::RateLimited, counters(2), 3),
            Transition::RetrySameKey {
                wait: Duration::from_secs(2)
            }
        );
        assert_eq!(
            settings.transition(AttemptOutcome::RateLimited, counters(3), 3),
            Transition::RotateKey
        );
        let no_keys = AttemptCounters {
            untried_keys: false,
            ..counters(3)
        };
        assert_eq!(
            settings.transition(AttemptOutcome::RateLimited, no_keys, 3),
            Transition::SwitchModel
        );
    }

    #[test]
    fn transient_failures_use_their_own_backoff() {
        let settings = OrchestratorSettings::default();
        assert_eq!(
            settings.transition(AttemptOutcome::TimedOut, counters(4), 5),
            Transition::RetrySameKey {
                wait: Duration::from_secs(5)
            }
        );
        assert_eq!(
            settings.transition(AttemptOutcome::OtherError, counters(1), 5),
            Transition::RetrySameKey {
                wait: Duration::from_secs(3)
            }
        );
        assert_eq!(
            settings.transition(AttemptOutcome::ServerError, counters(5), 5),
            Transition::SwitchModel
        );
        assert_eq!(
            settings.transition(AttemptOutcome::NetworkError, counters(5), 5),
            Transition::SwitchModel
        );
    }
}
