//! Final report assembly: condenses a run's attempt history into a
//! machine-usable description of the page and how to extract from it.

use crate::coordinator::{RunFailure, ScrapeAttempt, ScrapeOutcome};
use crate::expansion::ExpansionAttemptRecord;
use crate::monitor::ActivityLevel;
use crate::protection::ProtectionSignature;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub url: String,
    pub final_url: String,
    pub title: String,
}

/// Headline counts from the final structural snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureAnalysis {
    pub interactive_elements: usize,
    pub expandable_elements: usize,
    pub content_areas: usize,
}

/// Outcome counts over the expansion pass, including nested discoveries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionSummary {
    pub total_interactions: usize,
    pub successful_interactions: usize,
    pub content_changes_detected: usize,
    pub depth_limited: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicBehavior {
    pub mutations_detected: usize,
    pub api_calls_made: usize,
    pub activity_level: ActivityLevel,
}

/// The run report handed to callers and serialized by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeReport {
    pub page_info: PageInfo,
    pub structure_analysis: StructureAnalysis,
    pub interaction_summary: InteractionSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_behavior: Option<DynamicBehavior>,
    pub recommendations: Vec<String>,
    pub attempts_made: usize,
    pub stealth_mode_used: bool,
    /// Whole-run wall time, first open to completion.
    pub elapsed_ms: u64,
    /// A challenge cleared during the passive bypass wait.
    pub bypass_used: bool,
    /// Every protection verdict seen on the completing attempt.
    pub protection_history: Vec<ProtectionSignature>,
    pub completed_at: DateTime<Utc>,
    /// The attempt that completed.
    pub final_attempt: ScrapeAttempt,
    /// Failed attempts that preceded it, in order.
    pub prior_failures: Vec<ScrapeAttempt>,
}

/// Build the report for a completed run.
pub fn build(outcome: ScrapeOutcome, stealth_mode_used: bool) -> ScrapeReport {
    let final_attempt = &outcome.attempt;

    let structure_analysis = final_attempt
        .final_snapshot
        .as_ref()
        .map(|snapshot| StructureAnalysis {
            interactive_elements: snapshot.interactive_elements.len(),
            expandable_elements: snapshot
                .interactive_elements
                .iter()
                .filter(|el| el.interaction_type == "expandable")
                .count(),
            content_areas: snapshot.content_areas.len(),
        })
        .unwrap_or_default();

    let mut interaction_summary = InteractionSummary::default();
    for record in final_attempt.expansion.values() {
        tally(record, &mut interaction_summary);
    }

    let dynamic_behavior = final_attempt.monitoring.as_ref().map(|m| DynamicBehavior {
        mutations_detected: m.summary.total_mutations,
        api_calls_made: m.summary.api_call_count,
        activity_level: m.summary.activity,
    });

    let recommendations = recommend(
        &structure_analysis,
        &interaction_summary,
        dynamic_behavior.as_ref(),
    );

    ScrapeReport {
        page_info: PageInfo {
            url: outcome.url.clone(),
            final_url: outcome.final_url.clone(),
            title: outcome.title.clone(),
        },
        structure_analysis,
        interaction_summary,
        dynamic_behavior,
        recommendations,
        attempts_made: outcome.prior_failures.len() + 1,
        stealth_mode_used,
        elapsed_ms: outcome.elapsed_ms,
        bypass_used: outcome.attempt.bypass_used,
        protection_history: outcome.attempt.protection_history.clone(),
        completed_at: outcome.completed_at,
        final_attempt: outcome.attempt,
        prior_failures: outcome.prior_failures,
    }
}

/// Document emitted for a run that exhausted its budget. The error tag is
/// authoritative; `attempts` carries whatever partial fields each attempt
/// populated before failing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub url: String,
    pub error: String,
    pub attempts_made: usize,
    pub elapsed_ms: u64,
    pub completed_at: DateTime<Utc>,
    pub attempts: Vec<ScrapeAttempt>,
}

/// Build the failure document for an exhausted or fatally failed run.
pub fn build_failure(url: &str, failure: RunFailure) -> FailureReport {
    FailureReport {
        url: url.to_string(),
        error: failure.error.to_string(),
        attempts_made: failure.attempts.len(),
        elapsed_ms: failure.elapsed_ms,
        completed_at: Utc::now(),
        attempts: failure.attempts,
    }
}

fn tally(record: &ExpansionAttemptRecord, summary: &mut InteractionSummary) {
    if record.depth_limited {
        summary.depth_limited += 1;
        return;
    }
    summary.total_interactions += 1;
    if record.succeeded {
        summary.successful_interactions += 1;
    }
    if record.content_changed {
        summary.content_changes_detected += 1;
    }
    for nested in record.nested.values() {
        tally(nested, summary);
    }
}

fn recommend(
    structure: &StructureAnalysis,
    interactions: &InteractionSummary,
    dynamic: Option<&DynamicBehavior>,
) -> Vec<String> {
    let mut recommendations = Vec::new();

    if interactions.total_interactions > 0 {
        let success_rate =
            interactions.successful_interactions as f64 / interactions.total_interactions as f64;
        if success_rate < 0.7 {
            recommendations
                .push("Consider implementing robust error handling for interactions".to_string());
        }
    }
    if dynamic.is_some_and(|d| d.activity_level == ActivityLevel::High) {
        recommendations.push("Use longer wait times due to high dynamic activity".to_string());
    }
    if structure.expandable_elements > 5 {
        recommendations.push(
            "Implement systematic expansion strategy for multiple expandable elements".to_string(),
        );
    }
    if interactions.depth_limited > 0 {
        recommendations.push(format!(
            "Increase expansion depth: {} nested elements were left unexplored",
            interactions.depth_limited
        ));
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementDescriptor;
    use std::collections::BTreeMap;

    fn record(succeeded: bool, changed: bool) -> ExpansionAttemptRecord {
        ExpansionAttemptRecord {
            descriptor: ElementDescriptor::default(),
            depth: 0,
            collapsed_content: None,
            expanded_content: None,
            succeeded,
            strategy: None,
            content_changed: changed,
            error: None,
            nested: BTreeMap::new(),
            depth_limited: false,
        }
    }

    #[test]
    fn test_tally_walks_nested_records() {
        let mut parent = record(true, true);
        parent
            .nested
            .insert(crate::element::Signature("id:child".into()), record(false, false));
        let mut summary = InteractionSummary::default();
        tally(&parent, &mut summary);
        assert_eq!(summary.total_interactions, 2);
        assert_eq!(summary.successful_interactions, 1);
        assert_eq!(summary.content_changes_detected, 1);
    }

    #[test]
    fn test_depth_limited_records_do_not_count_as_interactions() {
        let sentinel = ExpansionAttemptRecord {
            depth_limited: true,
            ..record(false, false)
        };
        let mut summary = InteractionSummary::default();
        tally(&sentinel, &mut summary);
        assert_eq!(summary.total_interactions, 0);
        assert_eq!(summary.depth_limited, 1);
    }

    #[test]
    fn test_low_success_rate_triggers_recommendation() {
        let interactions = InteractionSummary {
            total_interactions: 10,
            successful_interactions: 6,
            ..InteractionSummary::default()
        };
        let recs = recommend(&StructureAnalysis::default(), &interactions, None);
        assert!(recs.iter().any(|r| r.contains("error handling")));
    }

    #[test]
    fn test_quiet_page_yields_no_recommendations() {
        let interactions = InteractionSummary {
            total_interactions: 4,
            successful_interactions: 4,
            ..InteractionSummary::default()
        };
        let dynamic = DynamicBehavior {
            mutations_detected: 2,
            api_calls_made: 0,
            activity_level: ActivityLevel::Low,
        };
        let recs = recommend(
            &StructureAnalysis {
                expandable_elements: 3,
                ..StructureAnalysis::default()
            },
            &interactions,
            Some(&dynamic),
        );
        assert!(recs.is_empty());
    }
}
