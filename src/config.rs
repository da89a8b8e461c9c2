//! Configuration for Alfred.
//!
//! Secrets come from environment variables at runtime; the source tree
//! contains none. Everything else lives in a JSON gateway document that is
//! hot-reloadable: snapshots are immutable and swapped copy-on-write under a
//! version counter, so in-flight requests keep the view they started with.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use crate::pricing::PricingTable;
use crate::providers::AdapterRegistry;

/// Process-level configuration, read once at startup.
#[derive(Clone)]
pub struct Config {
    /// Port to listen on (default: 9100)
    pub port: u16,

    /// Path to the gateway document (providers, rules, wallets, cache)
    pub gateway_config_path: PathBuf,

    /// Append-only journal file; unset keeps the ledger in memory only
    pub journal_path: Option<PathBuf>,

    /// USD per credit, used only to decorate responses
    pub usd_per_credit: f64,

    /// Seconds between gateway-document mtime checks (default: 15)
    pub reload_poll_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            port: std::env::var("ALFRED_PORT")
                .unwrap_or_else(|_| "9100".to_string())
                .parse()
                .context("Invalid ALFRED_PORT")?,

            gateway_config_path: std::env::var("ALFRED_CONFIG_PATH")
                .unwrap_or_else(|_| "alfred.json".to_string())
                .into(),

            journal_path: std::env::var("ALFRED_JOURNAL_PATH").ok().map(Into::into),

            usd_per_credit: std::env::var("ALFRED_USD_PER_CREDIT")
                .unwrap_or_else(|_| "1.0".to_string())
                .parse()
                .context("Invalid ALFRED_USD_PER_CREDIT")?,

            reload_poll_secs: std::env::var("ALFRED_RELOAD_POLL_SECS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .context("Invalid ALFRED_RELOAD_POLL_SECS")?,
        })
    }
}

// =============================================================================
// Gateway document
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    /// Self-hosted or third-party endpoints speaking the OpenAI wire schema
    /// (Azure, vLLM, Ollama, ...).
    OpenAiCompatible,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    /// Capability family tag ("frontier_reasoning", "fast_chat", ...)
    pub family: String,
    /// Credits per 1K prompt tokens
    pub in_rate: f64,
    /// Credits per 1K completion tokens
    pub out_rate: f64,
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Ordered "provider/model" alternatives tried on transient failure
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

fn default_tokenizer() -> String {
    "heuristic".to_string()
}

fn default_max_output_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    /// Override for self-hosted or regional endpoints
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key; never the key itself
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

fn default_timeout_secs() -> u64 {
    300 // total wall-clock bound, long enough for slow completions
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_idle_per_host() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletDefaults {
    #[serde(default = "default_org_limit")]
    pub org_limit: f64,
    #[serde(default = "default_team_limit")]
    pub team_limit: f64,
    #[serde(default = "default_user_limit")]
    pub user_limit: f64,
    #[serde(default = "default_project_limit")]
    pub project_limit: f64,
    #[serde(default)]
    pub overdraft_bps: u32,
    #[serde(default = "default_true")]
    pub hard_cap: bool,
    #[serde(default = "default_cycle_days")]
    pub cycle_days: u32,
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,
    /// Percentage of unused leaf balance swept to the org reserve at cycle end
    #[serde(default)]
    pub rollover_pct: u32,
    #[serde(default = "default_transfer_daily_cap")]
    pub transfer_daily_cap: f64,
    #[serde(default = "default_transfer_cooldown_secs")]
    pub transfer_cooldown_secs: u64,
}

fn default_org_limit() -> f64 {
    1000.0
}
fn default_team_limit() -> f64 {
    250.0
}
fn default_user_limit() -> f64 {
    50.0
}
fn default_project_limit() -> f64 {
    25.0
}
fn default_true() -> bool {
    true
}
fn default_cycle_days() -> u32 {
    30
}
fn default_reservation_ttl_secs() -> u64 {
    300
}
fn default_transfer_daily_cap() -> f64 {
    100.0
}
fn default_transfer_cooldown_secs() -> u64 {
    60
}

impl Default for WalletDefaults {
    fn default() -> Self {
        serde_json::from_str("{}").expect("wallet defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// Policy ceiling on completion tokens, clamping client requests
    #[serde(default = "default_policy_cap")]
    pub policy_max_output_tokens: u32,
    /// Harder ceiling applied while a wallet is running on transferred credits
    #[serde(default = "default_transfer_funded_cap")]
    pub transfer_funded_max_output_tokens: u32,
    /// Characters of trailing output kept for loop detection
    #[serde(default = "default_loop_window")]
    pub loop_window_chars: usize,
    /// Length of the trailing n-gram checked for repetition
    #[serde(default = "default_loop_ngram")]
    pub loop_ngram_chars: usize,
    /// Occurrences of the trailing n-gram that trip the filter
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: u32,
    /// Total response bytes forwarded before the stream is cut
    #[serde(default = "default_byte_budget")]
    pub byte_budget: usize,
    /// Silence between upstream events before the stream is treated as dead
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
}

fn default_policy_cap() -> u32 {
    4096
}
fn default_transfer_funded_cap() -> u32 {
    1024
}
fn default_loop_window() -> usize {
    2048
}
fn default_loop_ngram() -> usize {
    32
}
fn default_loop_threshold() -> u32 {
    3
}
fn default_byte_budget() -> usize {
    1_048_576
}
fn default_stream_idle_timeout_secs() -> u64 {
    30
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("guardrail defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_tenant_byte_budget")]
    pub tenant_byte_budget: usize,
    /// Flat fee charged on a cache hit instead of the full model cost
    #[serde(default = "default_access_fee")]
    pub access_fee_credits: f64,
    #[serde(default)]
    pub embeddings_provider: Option<String>,
    #[serde(default)]
    pub embeddings_model: Option<String>,
    #[serde(default = "default_embed_timeout_ms")]
    pub embed_timeout_ms: u64,
}

fn default_similarity_threshold() -> f32 {
    0.95
}
fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_tenant_byte_budget() -> usize {
    4_194_304
}
fn default_access_fee() -> f64 {
    0.01
}
fn default_embed_timeout_ms() -> u64 {
    200
}

impl Default for CacheConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("cache defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sustained requests per minute per (tenant, endpoint)
    #[serde(default = "default_rpm")]
    pub requests_per_minute: f64,
    #[serde(default = "default_burst")]
    pub burst: f64,
}

fn default_rpm() -> f64 {
    600.0
}
fn default_burst() -> f64 {
    60.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("rate limit defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures: u32,
    #[serde(default = "default_error_rate")]
    pub error_rate_threshold: f64,
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

fn default_consecutive_failures() -> u32 {
    5
}
fn default_error_rate() -> f64 {
    0.5
}
fn default_window() -> usize {
    20
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_half_open_successes() -> u32 {
    3
}
fn default_probe_interval_secs() -> u64 {
    15
}

impl Default for BreakerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("breaker defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Fallback alternatives tried after the primary (distinct providers)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Hard ceiling on total added retry latency
    #[serde(default = "default_backoff_total_ms")]
    pub backoff_total_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    100
}
fn default_backoff_total_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("retry defaults")
    }
}

/// Maps a bearer token to its tenant scope and privacy posture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub token: String,
    pub tenant_id: String,
    pub user_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub privacy_strict: bool,
    /// Data-residency region pinned to this credential, if any
    #[serde(default)]
    pub residency_region: Option<String>,
}

// -----------------------------------------------------------------------------
// Routing rules
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    FamilyIs { family: String },
    TenantIs { tenant_id: String },
    TeamIs { team_id: String },
    PrivacyStrict,
    PriorityCritical,
    ResidencyIs { region: String },
    BalanceBelow { credits: f64 },
    HourBetween { start_hour: u8, end_hour: u8 },
    HasRole { role: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    RouteTo { provider: String, model: String },
    RerouteCapability { family: String },
    Block { reason: String },
    RequireMfa,
    Tag { project: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRuleConfig {
    /// Lower fires first; document order breaks ties
    pub priority: i32,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    pub action: RuleAction,
}

/// The full hot-reloadable gateway document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub wallet: WalletDefaults,
    #[serde(default)]
    pub rules: Vec<RoutingRuleConfig>,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading gateway config {}", path.display()))?;
        let mut config: GatewayConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing gateway config {}", path.display()))?;
        // Stable evaluation order: priority ascending, document order on ties.
        config.rules.sort_by_key(|r| r.priority);
        Ok(config)
    }
}

// =============================================================================
// Copy-on-write snapshots
// =============================================================================

/// One immutable view of the gateway document plus the tables derived from
/// it. Requests grab an `Arc<Snapshot>` once and keep it for their lifetime.
pub struct Snapshot {
    pub version: u64,
    pub config: GatewayConfig,
    pub pricing: PricingTable,
    pub adapters: AdapterRegistry,
}

pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<Snapshot>>,
    version: AtomicU64,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigStore {
    pub fn load(path: &Path) -> Result<Self> {
        let config = GatewayConfig::from_file(path)?;
        let snapshot = Self::build_snapshot(config, 1)?;
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        Ok(Self {
            path: path.to_path_buf(),
            current: RwLock::new(Arc::new(snapshot)),
            version: AtomicU64::new(1),
            last_modified: Mutex::new(modified),
        })
    }

    fn build_snapshot(config: GatewayConfig, version: u64) -> Result<Snapshot> {
        let pricing = PricingTable::from_config(&config);
        let adapters = AdapterRegistry::from_config(&config)?;
        Ok(Snapshot {
            version,
            config,
            pricing,
            adapters,
        })
    }

    /// Current snapshot; callers hold the `Arc` for the whole request.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.read().expect("config store poisoned").clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Re-read the document if its mtime advanced and swap in a new
    /// snapshot. A parse failure keeps the previous snapshot live.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        {
            let mut last = self.last_modified.lock().expect("mtime lock poisoned");
            if *last == modified {
                return Ok(false);
            }
            *last = modified;
        }

        let config = GatewayConfig::from_file(&self.path)?;
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = Self::build_snapshot(config, version)?;
        *self.current.write().expect("config store poisoned") = Arc::new(snapshot);
        tracing::info!(version, "gateway config reloaded");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert!(config.wallet.hard_cap);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.guardrails.loop_threshold, 3);
        assert_eq!(config.cache.embed_timeout_ms, 200);
    }

    #[test]
    fn test_rules_sorted_by_priority() {
        let raw = serde_json::json!({
            "rules": [
                { "priority": 20, "action": { "type": "block", "reason": "late" } },
                { "priority": 10, "action": { "type": "require_mfa" } },
            ]
        });
        let mut config: GatewayConfig = serde_json::from_value(raw).unwrap();
        config.rules.sort_by_key(|r| r.priority);
        assert!(matches!(config.rules[0].action, RuleAction::RequireMfa));
    }

    #[test]
    fn test_provider_config_parses() {
        let raw = serde_json::json!({
            "name": "openai",
            "kind": "open_ai",
            "api_key_env": "OPENAI_API_KEY",
            "models": [
                { "id": "gpt-4o", "family": "frontier", "in_rate": 2.5, "out_rate": 10.0,
                  "tokenizer": "o200k", "fallbacks": ["anthropic/claude-sonnet"] }
            ]
        });
        let provider: ProviderConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(provider.kind, ProviderKind::OpenAi);
        assert_eq!(provider.models[0].fallbacks.len(), 1);
        assert_eq!(provider.timeout_secs, 300);
    }
}
