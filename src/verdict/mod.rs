//! Verdict Generator (C7): evaluates a completed assignment's artifacts
//! against its working spec's gates and produces a pass/fail/waiver
//! decision with a weighted quality score. No hidden heuristics — every
//! gate's inputs and outcome are recorded in `gate_results`.

use crate::config::{GateWeights, VerdictConfig};
use crate::models::{Artifacts, Decision, GateResult, RiskTier, TaskBudget, Verdict, WorkingSpec};

const GATE_COVERAGE: &str = "coverage";
const GATE_BUDGET: &str = "budget";
const GATE_ACCEPTANCE: &str = "acceptance";
const GATE_NON_FUNCTIONAL: &str = "non_functional";

fn coverage_threshold(config: &VerdictConfig, tier: RiskTier) -> f64 {
    match tier {
        RiskTier::Tier1 => config.tier1_coverage_threshold,
        RiskTier::Tier2 => config.tier2_coverage_threshold,
        RiskTier::Tier3 => config.tier3_coverage_threshold,
    }
}

fn weights_for(config: &VerdictConfig, tier: RiskTier) -> &GateWeights {
    match tier {
        RiskTier::Tier1 => &config.tier1_weights,
        RiskTier::Tier2 => &config.tier2_weights,
        RiskTier::Tier3 => &config.tier3_weights,
    }
}

fn weight_for(weights: &GateWeights, gate: &str) -> f64 {
    match gate {
        GATE_COVERAGE => weights.coverage,
        GATE_BUDGET => weights.budget,
        GATE_ACCEPTANCE => weights.acceptance,
        GATE_NON_FUNCTIONAL => weights.non_functional,
        _ => 0.0,
    }
}

fn coverage_gate(config: &VerdictConfig, weights: &GateWeights, spec: &WorkingSpec, artifacts: &Artifacts) -> GateResult {
    let threshold = coverage_threshold(config, spec.risk_tier);
    match artifacts.coverage {
        Some(coverage) => {
            let pass = coverage >= threshold;
            GateResult {
                gate: GATE_COVERAGE.into(),
                pass,
                contribution: if pass { 1.0 } else { 0.0 },
                weight: weight_for(weights, GATE_COVERAGE),
                detail: format!("coverage {coverage:.3} vs threshold {threshold:.2}"),
            }
        }
        None => GateResult {
            gate: GATE_COVERAGE.into(),
            pass: false,
            contribution: config.fallback_score,
            weight: weight_for(weights, GATE_COVERAGE),
            detail: "coverage not measured, using configured fallback score".into(),
        },
    }
}

fn budget_gate(weights: &GateWeights, budget: &TaskBudget, artifacts: &Artifacts) -> GateResult {
    let files_ratio = match budget.max_files {
        Some(max) if max > 0 => artifacts.files_touched as f64 / max as f64,
        _ => 0.0,
    };
    let loc_ratio = match budget.max_loc {
        Some(max) if max > 0 => artifacts.loc_touched as f64 / max as f64,
        _ => 0.0,
    };
    let pass = files_ratio <= 1.0 && loc_ratio <= 1.0;
    GateResult {
        gate: GATE_BUDGET.into(),
        pass,
        contribution: if pass { 1.0 } else { 0.0 },
        weight: weight_for(weights, GATE_BUDGET),
        detail: format!("files {files_ratio:.2}x, loc {loc_ratio:.2}x of ceiling"),
    }
}

fn acceptance_gate(weights: &GateWeights, spec: &WorkingSpec, artifacts: &Artifacts) -> GateResult {
    let total = spec.acceptance.len();
    let failed: Vec<&str> = artifacts
        .acceptance_results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.criterion_id.as_str())
        .collect();
    let pass = failed.is_empty();
    GateResult {
        gate: GATE_ACCEPTANCE.into(),
        pass,
        contribution: if pass { 1.0 } else { 0.0 },
        weight: weight_for(weights, GATE_ACCEPTANCE),
        detail: if pass {
            format!("{total} acceptance criteria, none failed")
        } else {
            format!("failed criteria: {}", failed.join(", "))
        },
    }
}

fn non_functional_gate(weights: &GateWeights, spec: &WorkingSpec, artifacts: &Artifacts) -> GateResult {
    match (spec.non_functional.p95_latency_ms, artifacts.measured_p95_latency_ms) {
        (Some(target), Some(measured)) => {
            let pass = measured <= target;
            GateResult {
                gate: GATE_NON_FUNCTIONAL.into(),
                pass,
                contribution: if pass { 1.0 } else { 0.0 },
                weight: weight_for(weights, GATE_NON_FUNCTIONAL),
                detail: format!("measured p95 {measured:.1}ms vs target {target:.1}ms"),
            }
        }
        _ => GateResult {
            gate: GATE_NON_FUNCTIONAL.into(),
            pass: true,
            contribution: 1.0,
            weight: weight_for(weights, GATE_NON_FUNCTIONAL),
            detail: "no non-functional target declared or not measured".into(),
        },
    }
}

/// The budget gate and acceptance gate are critical: no waiver can paper
/// over a budget overrun or a failed acceptance criterion. Coverage and
/// non-functional gates can be waived.
fn is_critical(gate: &str) -> bool {
    matches!(gate, GATE_BUDGET | GATE_ACCEPTANCE)
}

pub struct VerdictGenerator<'a> {
    config: &'a VerdictConfig,
}

impl<'a> VerdictGenerator<'a> {
    pub fn new(config: &'a VerdictConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, spec: &WorkingSpec, budget: &TaskBudget, artifacts: &Artifacts, produced_by: &str) -> Verdict {
        let weights = weights_for(self.config, spec.risk_tier);
        let gate_results = vec![
            coverage_gate(self.config, weights, spec, artifacts),
            budget_gate(weights, budget, artifacts),
            acceptance_gate(weights, spec, artifacts),
            non_functional_gate(weights, spec, artifacts),
        ];

        let weight_sum: f64 = gate_results.iter().map(|g| g.weight).sum();
        let quality_score = if weight_sum > 0.0 {
            gate_results.iter().map(|g| g.contribution * g.weight).sum::<f64>() / weight_sum
        } else {
            0.0
        };

        let failing: Vec<&GateResult> = gate_results.iter().filter(|g| !g.pass).collect();
        let now = chrono::Utc::now();
        let waiver_applicable = !failing.is_empty()
            && failing.iter().all(|g| !is_critical(&g.gate))
            && spec.waiver.as_ref().is_some_and(|w| w.is_valid(now));

        let decision = if failing.is_empty() {
            Decision::Pass
        } else if waiver_applicable {
            Decision::Waiver
        } else {
            Decision::Fail
        };

        let reasons = failing.iter().map(|g| format!("{}: {}", g.gate, g.detail)).collect();

        Verdict {
            decision,
            quality_score,
            gate_results,
            reasons,
            produced_by: produced_by.to_string(),
            produced_at: now,
            waiver_reason: if matches!(decision, Decision::Waiver) {
                spec.waiver.as_ref().map(|w| w.reason.clone())
            } else {
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AcceptanceResult, Scope, Waiver};

    fn spec(tier: RiskTier) -> WorkingSpec {
        WorkingSpec {
            id: "spec-1".into(),
            risk_tier: tier,
            mode: "default".into(),
            blast_radius: "low".into(),
            scope: Scope::default(),
            invariants: vec![],
            acceptance: vec![],
            non_functional: crate::models::NonFunctionalTarget::default(),
            contracts: vec![],
            waiver: None,
        }
    }

    #[test]
    fn passes_when_all_gates_pass() {
        let config = VerdictConfig::default();
        let artifacts = Artifacts {
            coverage: Some(0.95),
            acceptance_results: vec![],
            ..Artifacts::default()
        };
        let verdict = VerdictGenerator::new(&config).evaluate(&spec(RiskTier::Tier1), &TaskBudget::default(), &artifacts, "test");
        assert_eq!(verdict.decision, Decision::Pass);
    }

    #[test]
    fn fails_when_coverage_below_tier_threshold() {
        let config = VerdictConfig::default();
        let artifacts = Artifacts {
            coverage: Some(0.5),
            ..Artifacts::default()
        };
        let verdict = VerdictGenerator::new(&config).evaluate(&spec(RiskTier::Tier1), &TaskBudget::default(), &artifacts, "test");
        assert_eq!(verdict.decision, Decision::Fail);
        assert!(verdict.reasons.iter().any(|r| r.starts_with("coverage")));
    }

    #[test]
    fn acceptance_failure_is_critical_never_waived() {
        let config = VerdictConfig::default();
        let mut working_spec = spec(RiskTier::Tier3);
        working_spec.waiver = Some(Waiver {
            reason: "known flake".into(),
            approved_by: "admin".into(),
            expires_at: chrono::Utc::now() + chrono::Duration::days(1),
            signature: "sig".into(),
        });
        let artifacts = Artifacts {
            coverage: Some(0.9),
            acceptance_results: vec![AcceptanceResult {
                criterion_id: "ac-1".into(),
                passed: false,
            }],
            ..Artifacts::default()
        };
        let verdict = VerdictGenerator::new(&config).evaluate(&working_spec, &TaskBudget::default(), &artifacts, "test");
        assert_eq!(verdict.decision, Decision::Fail);
    }

    #[test]
    fn valid_waiver_covers_non_critical_failure() {
        let config = VerdictConfig::default();
        let mut working_spec = spec(RiskTier::Tier3);
        working_spec.waiver = Some(Waiver {
            reason: "accepted risk".into(),
            approved_by: "admin".into(),
            expires_at: chrono::Utc::now() + chrono::Duration::days(1),
            signature: "sig".into(),
        });
        let artifacts = Artifacts {
            coverage: Some(0.1),
            ..Artifacts::default()
        };
        let verdict = VerdictGenerator::new(&config).evaluate(&working_spec, &TaskBudget::default(), &artifacts, "test");
        assert_eq!(verdict.decision, Decision::Waiver);
        assert_eq!(verdict.waiver_reason.as_deref(), Some("accepted risk"));
    }

    #[test]
    fn expired_waiver_does_not_cover_failure() {
        let config = VerdictConfig::default();
        let mut working_spec = spec(RiskTier::Tier3);
        working_spec.waiver = Some(Waiver {
            reason: "accepted risk".into(),
            approved_by: "admin".into(),
            expires_at: chrono::Utc::now() - chrono::Duration::days(1),
            signature: "sig".into(),
        });
        let artifacts = Artifacts {
            coverage: Some(0.1),
            ..Artifacts::default()
        };
        let verdict = VerdictGenerator::new(&config).evaluate(&working_spec, &TaskBudget::default(), &artifacts, "test");
        assert_eq!(verdict.decision, Decision::Fail);
    }
}
