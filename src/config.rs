//! Command-line and environment configuration shared by the binaries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::capabilities::CapabilityTable;
use crate::credentials::CredentialRotator;
use crate::error::{Error, Result};
use crate::orchestrator::{OrchestratorSettings, ProviderOrchestrator};
use crate::provider::HttpTransport;
use crate::store::{DocumentStore, PgStore};

/// Default OpenAI-compatible endpoint.
pub const DEFAULT_BASE_URL: &str = "https://chat-ai.academiccloud.de/v1";

/// Provider connection and retry knobs.
#[derive(Args, Debug, Clone)]
pub struct ProviderArgs {
    /// Base URL of the OpenAI-compatible API
    #[arg(long, env = "FASTRAG_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// API keys, comma separated, tried in order
    #[arg(long, env = "FASTRAG_API_KEYS", hide_env_values = true)]
    pub api_keys: String,

    /// Per-request timeout in seconds
    #[arg(long, env = "FASTRAG_REQUEST_TIMEOUT", default_value_t = 60)]
    pub request_timeout_secs: u64,

    /// Seconds before a failed key is tried again
    #[arg(long, env = "FASTRAG_KEY_COOLDOWN", default_value_t = 300)]
    pub key_cooldown_secs: u64,

    /// Upper bound for exponential backoff in seconds
    #[arg(long, env = "FASTRAG_MAX_BACKOFF", default_value_t = 32)]
    pub max_backoff_secs: u64,

    /// Deadline for a whole provider call in seconds, sleeps included
    #[arg(long, env = "FASTRAG_CALL_TIMEOUT")]
    pub call_timeout_secs: Option<u64>,

    /// TOML file with extra or replacement capability labels
    #[arg(long, env = "FASTRAG_CAPABILITIES")]
    pub capabilities: Option<PathBuf>,
}

impl ProviderArgs {
    /// Non-empty keys from `--api-keys`.
    pub fn keys(&self) -> Vec<String> {
        self.api_keys
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Retry settings derived from the flags.
    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_backoff: Duration::from_secs(self.max_backoff_secs.max(1)),
            call_timeout: self.call_timeout_secs.map(Duration::from_secs),
            ..OrchestratorSettings::default()
        }
    }

    /// Capability table from `--capabilities`, or the built-in defaults.
    pub fn capability_table(&self) -> Result<CapabilityTable> {
        match &self.capabilities {
            Some(path) => CapabilityTable::from_path(path),
            None => Ok(CapabilityTable::default()),
        }
    }

    /// Wires transport, capabilities and credentials into an orchestrator.
    pub fn build_orchestrator(&self) -> Result<ProviderOrchestrator> {
        let transport = HttpTransport::new(
            &self.base_url,
            Duration::from_secs(self.request_timeout_secs.max(1)),
        )?;
        let keys = CredentialRotator::with_cooldown(
            self.keys(),
            Duration::from_secs(self.key_cooldown_secs),
        )?;
        Ok(ProviderOrchestrator::new(
            Arc::new(transport),
            Arc::new(self.capability_table()?),
            keys,
        )
        .with_settings(self.settings()))
    }
}

/// Document store location.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Schema holding the fastrag tables
    #[arg(long, env = "FASTRAG_SCHEMA", default_value = "public")]
    pub schema: String,
}

impl StoreArgs {
    /// Connects and makes sure the tables exist.
    pub async fn connect(&self) -> Result<Arc<dyn DocumentStore>> {
        let store = PgStore::connect(&self.database_url, &self.schema).await?;
        store.ensure_schema().await?;
        Ok(Arc::new(store))
    }
}

/// Log output format.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Parses a `--level-order` style list.
pub fn parse_levels(raw: &str) -> Result<Vec<String>> {
    let levels: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if levels.is_empty() {
        return Err(Error::Config("level order must name at least one level".into()));
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[derive(Parser, Debug)]
    struct Harness {
        #[command(flatten)]
        provider: ProviderArgs,
    }

    #[test]
    fn provider_flags_parse() {
        let cli = Harness::parse_from([
            "test",
            "--api-keys",
            " k1, ,k2 ",
            "--max-backoff-secs",
            "8",
            "--call-timeout-secs",
            "30",
        ]);
        assert_eq!(cli.provider.keys(), vec!["k1", "k2"]);
        let settings = cli.provider.settings();
        assert_eq!(settings.max_backoff, Duration::from_secs(8));
        assert_eq!(settings.call_timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.auth_failures_before_rotate, 3);
    }

    #[test]
    fn orchestrator_needs_a_key() {
        let cli = Harness::parse_from(["test", "--api-keys", ","]);
        assert!(matches!(
            cli.provider.build_orchestrator(),
            Err(Error::NoCredentials)
        ));
    }

    #[test]
    fn level_lists_are_trimmed() {
        assert_eq!(
            parse_levels("book, chapter ,page").expect("levels"),
            vec!["book", "chapter", "page"]
        );
        assert!(parse_levels(" , ").is_err());
    }
}
