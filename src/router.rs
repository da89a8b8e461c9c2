//! Policy router.
//!
//! Rules are evaluated in ascending priority (document order breaks ties);
//! the first matching `route_to`/`reroute_capability`/`block` decides.
//! `require_mfa` and `tag` are gates that let evaluation continue. When no
//! rule fires, the request falls back to its capability family's configured
//! default chain. Every request ends in a decision.

use chrono::{DateTime, Timelike, Utc};
use std::time::Duration;

use crate::canonical::CanonicalRequest;
use crate::config::{RetryConfig, RuleAction, RuleCondition, Snapshot};
use crate::credits::Credits;
use crate::error::GatewayError;
use crate::pricing::ModelRef;

/// Tenant and wallet facts a policy decision may consult.
#[derive(Debug, Clone)]
pub struct RequestFacts<'a> {
    pub tenant_id: &'a str,
    pub team_id: Option<&'a str>,
    pub roles: &'a [String],
    pub privacy_strict: bool,
    pub priority_critical: bool,
    pub residency_region: Option<&'a str>,
    pub mfa_verified: bool,
    /// Available credits on the charge wallet at decision time
    pub available: Credits,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Failover order: primary first, then configured alternatives
    pub candidates: Vec<ModelRef>,
    /// Project tag attached by a `tag` rule, audited with the request
    pub project_tag: Option<String>,
}

fn condition_matches(
    condition: &RuleCondition,
    request: &CanonicalRequest,
    facts: &RequestFacts<'_>,
    now: DateTime<Utc>,
) -> bool {
    match condition {
        RuleCondition::FamilyIs { family } => request.model_family == *family,
        RuleCondition::TenantIs { tenant_id } => facts.tenant_id == tenant_id,
        RuleCondition::TeamIs { team_id } => facts.team_id == Some(team_id.as_str()),
        RuleCondition::PrivacyStrict => facts.privacy_strict,
        RuleCondition::PriorityCritical => facts.priority_critical,
        RuleCondition::ResidencyIs { region } => {
            facts.residency_region == Some(region.as_str())
        }
        RuleCondition::BalanceBelow { credits } => {
            facts.available < Credits::from_decimal(*credits)
        }
        RuleCondition::HourBetween {
            start_hour,
            end_hour,
        } => {
            let hour = now.hour() as u8;
            if start_hour <= end_hour {
                hour >= *start_hour && hour < *end_hour
            } else {
                // Window wraps midnight.
                hour >= *start_hour || hour < *end_hour
            }
        }
        RuleCondition::HasRole { role } => facts.roles.iter().any(|r| r == role),
    }
}

/// Candidate list for a capability family: the configured entries in order,
/// with the primary's fallback chain spliced in after it, deduplicated.
fn family_chain(snapshot: &Snapshot, family: &str) -> Vec<ModelRef> {
    let mut chain: Vec<ModelRef> = Vec::new();
    let candidates = snapshot.pricing.family_candidates(family);
    if let Some(primary) = candidates.first() {
        for entry in snapshot.pricing.failover_chain(&primary.model_ref()) {
            let model_ref = entry.model_ref();
            if !chain.contains(&model_ref) {
                chain.push(model_ref);
            }
        }
    }
    for entry in candidates {
        let model_ref = entry.model_ref();
        if !chain.contains(&model_ref) {
            chain.push(model_ref);
        }
    }
    chain
}

/// Evaluate the rule set and produce a total decision.
pub fn decide(
    snapshot: &Snapshot,
    request: &CanonicalRequest,
    facts: &RequestFacts<'_>,
    now: DateTime<Utc>,
) -> Result<RouteDecision, GatewayError> {
    let mut project_tag = request.metadata.project_id.clone();

    for rule in &snapshot.config.rules {
        let matches = rule
            .conditions
            .iter()
            .all(|c| condition_matches(c, request, facts, now));
        if !matches {
            continue;
        }

        match &rule.action {
            RuleAction::RouteTo { provider, model } => {
                let primary = ModelRef::new(provider.clone(), model.clone());
                if snapshot.pricing.get_ref(&primary).is_none() {
                    tracing::warn!(target = %primary, "routing rule targets unknown model; skipping");
                    continue;
                }
                let candidates = snapshot
                    .pricing
                    .failover_chain(&primary)
                    .iter()
                    .map(|e| e.model_ref())
                    .collect();
                return Ok(RouteDecision {
                    candidates,
                    project_tag,
                });
            }
            RuleAction::RerouteCapability { family } => {
                let candidates = family_chain(snapshot, family);
                if candidates.is_empty() {
                    return Err(GatewayError::InvalidRequest(format!(
                        "no models configured for capability family '{family}'"
                    )));
                }
                return Ok(RouteDecision {
                    candidates,
                    project_tag,
                });
            }
            RuleAction::Block { reason } => {
                return Err(GatewayError::Forbidden(reason.clone()));
            }
            RuleAction::RequireMfa => {
                if !facts.mfa_verified {
                    return Err(GatewayError::Forbidden(
                        "multi-factor verification required for this request".to_string(),
                    ));
                }
                // Gate passed; evaluation continues.
            }
            RuleAction::Tag { project } => {
                project_tag = Some(project.clone());
            }
        }
    }

    // No rule fired: default capability map. Clients may also name a
    // concrete "provider/model" pair directly.
    let mut candidates = family_chain(snapshot, &request.model_family);
    if candidates.is_empty() {
        if let Some(exact) = ModelRef::parse(&request.model_family) {
            candidates = snapshot
                .pricing
                .failover_chain(&exact)
                .iter()
                .map(|e| e.model_ref())
                .collect();
        }
    }
    if candidates.is_empty() {
        return Err(GatewayError::InvalidRequest(format!(
            "unknown model or capability family '{}'",
            request.model_family
        )));
    }
    Ok(RouteDecision {
        candidates,
        project_tag,
    })
}

/// Jittered exponential backoff before retry `retry_index` (0-based),
/// clamped so the total added latency never exceeds the configured ceiling.
/// Returns `None` when the budget is exhausted.
pub fn backoff_delay(
    retry_index: u32,
    spent: Duration,
    config: &RetryConfig,
) -> Option<Duration> {
    let total = Duration::from_millis(config.backoff_total_ms);
    if spent >= total {
        return None;
    }
    let base = config.backoff_base_ms << retry_index.min(4);
    let jitter = fastrand::u64(0..=config.backoff_base_ms / 2);
    let delay = Duration::from_millis(base + jitter);
    Some(delay.min(total - spent))
}
