//! Voting Coordinator.
//!
//! Combines the Signal Agent's alerts/opportunities with the Strategy
//! Agent's scored candidates into one [`Decision`]. Weighted consensus
//! blends several signals into one bounded score rather than picking a
//! single winner outright.

use chrono::{DateTime, Utc};

use crate::config::VotingConfig;
use crate::model::{Decision, DecisionAction, Signal, SignalKind, StrategyScore};

pub struct VotingCoordinator {
    config: VotingConfig,
}

impl VotingCoordinator {
    pub fn new(config: VotingConfig) -> Self {
        Self { config }
    }

    /// Reduces this cycle's signals and scored candidates to a single
    /// decision. Deterministic for the same inputs: no RNG, no
    /// wall-clock branching besides the `reached_at` timestamp field.
    ///
    /// Per candidate: `signal_support` is the fraction of `opportunity`
    /// signals whose `(from_chain, to_chain, token)` matches the
    /// candidate's first step, and `combined_score = signal_weight *
    /// signal_support + strategy_weight * strategy_score` where
    /// `strategy_score` is risk-derived. The candidate with the highest
    /// `combined_score` wins; ties break on higher confidence, then lower
    /// aggregate risk, then lexicographic `(from_chain, to_chain,
    /// target_pool_address)`.
    pub fn decide(&self, signals: &[Signal], candidates: &[StrategyScore], now: DateTime<Utc>) -> Decision {
        if let Some(emergency) = self.emergency_signal(signals) {
            return self.emergency_exit(emergency, now);
        }

        if candidates.is_empty() {
            return Decision::hold(vec!["no candidate cleared cost threshold".to_string()], now);
        }

        let opportunities: Vec<&Signal> = signals.iter().filter(|s| s.kind == SignalKind::Opportunity).collect();

        let scored: Vec<(f64, &StrategyScore)> = candidates
            .iter()
            .map(|c| (self.combined_score(c, &opportunities), c))
            .collect();

        let best = scored
            .iter()
            .max_by(|(score_a, a), (score_b, b)| Self::rank(*score_a, a, *score_b, b))
            .map(|(score, candidate)| (*score, *candidate))
            .expect("candidates is non-empty");

        let (combined_score, best) = best;
        let consensus_ppm = (combined_score.clamp(0.0, 1.0) * 1_000_000.0) as u32;

        if best.confidence_ppm < self.config.min_confidence_ppm {
            return Decision::hold(
                vec![format!(
                    "best candidate confidence {}ppm below minimum {}ppm",
                    best.confidence_ppm, self.config.min_confidence_ppm
                )],
                now,
            );
        }

        if combined_score < self.config.consensus_threshold {
            return Decision::hold(
                vec![format!(
                    "consensus {consensus_ppm}ppm below threshold {}ppm",
                    (self.config.consensus_threshold * 1_000_000.0) as u32
                )],
                now,
            );
        }

        Decision {
            id: uuid::Uuid::new_v4().to_string(),
            action: DecisionAction::Rebalance,
            steps: best.candidate.clone(),
            confidence_ppm: best.confidence_ppm,
            consensus_ppm,
            reasoning: vec![format!(
                "expected gain {}bps cleared consensus {consensus_ppm}ppm",
                best.expected_gain_bps
            )],
            reached_at: now,
        }
    }

    fn combined_score(&self, candidate: &StrategyScore, opportunities: &[&Signal]) -> f64 {
        let signal_support = Self::signal_support(candidate, opportunities);
        let strategy_score = (1.0 - (candidate.risk_bps as f64 / 10_000.0)).max(0.0);
        self.config.signal_weight * signal_support + self.config.strategy_weight * strategy_score
    }

    /// Fraction of `opportunities` whose `(from_chain, to_chain, token)`
    /// matches this candidate's first step. `0.0` when there are no
    /// opportunity signals this cycle.
    fn signal_support(candidate: &StrategyScore, opportunities: &[&Signal]) -> f64 {
        if opportunities.is_empty() {
            return 0.0;
        }
        let Some(step) = candidate.candidate.first() else {
            return 0.0;
        };
        let matching = opportunities
            .iter()
            .filter(|s| s.chain == step.from_chain && s.to_chain == step.to_chain && s.token == step.token)
            .count();
        matching as f64 / opportunities.len() as f64
    }

    /// Orders two scored candidates so the "greater" one wins: higher
    /// `combined_score`, then higher confidence, then lower aggregate
    /// risk, then lexicographic `(from_chain, to_chain,
    /// target_pool_address)` — each later key only breaks ties left by
    /// the one before it.
    fn rank(score_a: f64, a: &StrategyScore, score_b: f64, b: &StrategyScore) -> std::cmp::Ordering {
        use std::cmp::Ordering;

        score_a
            .partial_cmp(&score_b)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.confidence_ppm.cmp(&b.confidence_ppm))
            .then_with(|| b.risk_bps.cmp(&a.risk_bps))
            .then_with(|| {
                let key = |c: &StrategyScore| {
                    c.candidate
                        .first()
                        .map(|s| (s.from_chain, s.to_chain, s.target_pool_address.clone()))
                };
                key(b).cmp(&key(a))
            })
    }

    fn emergency_signal<'a>(&self, signals: &'a [Signal]) -> Option<&'a Signal> {
        signals.iter().find(|s| {
            s.kind == SignalKind::Alert && s.confidence_ppm >= self.config.emergency_threshold_ppm
        })
    }

    /// Emergency exit routes the full position to the configured safe
    /// pool rather than attempting to re-optimize under duress (spec
    /// §4.6, §8 emergency-exit scenario).
    fn emergency_exit(&self, trigger: &Signal, now: DateTime<Utc>) -> Decision {
        use crate::model::ReallocationStep;

        let step = ReallocationStep {
            from_chain: trigger.chain,
            to_chain: self.config.safe_pool_chain,
            token: trigger.token.clone(),
            amount_smallest_unit: 0,
            target_pool_address: self.config.safe_pool_address.clone(),
            expected_apy_bps: 0,
        };

        Decision {
            id: uuid::Uuid::new_v4().to_string(),
            action: DecisionAction::EmergencyExit,
            steps: vec![step],
            confidence_ppm: trigger.confidence_ppm,
            consensus_ppm: 1_000_000,
            reasoning: vec![format!("emergency trigger: {}", trigger.message)],
            reached_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Protocol, ReallocationStep};

    fn candidate(confidence_ppm: u32, risk_bps: u32, gain_bps: i32) -> StrategyScore {
        StrategyScore {
            candidate: vec![ReallocationStep {
                from_chain: 1,
                to_chain: 2,
                token: "USDC".into(),
                amount_smallest_unit: 1_000_000,
                target_pool_address: "0xdest".into(),
                expected_apy_bps: 900,
            }],
            expected_gain_bps: gain_bps,
            risk_bps,
            confidence_ppm,
        }
    }

    fn opportunity_signal(chain: u64, to_chain: u64, token: &str) -> Signal {
        Signal {
            kind: SignalKind::Opportunity,
            chain,
            to_chain,
            protocol: Protocol::Aave,
            token: token.to_string(),
            magnitude_bps: 200,
            confidence_ppm: 1_000_000,
            message: "apr gap".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn holds_with_no_candidates() {
        let coordinator = VotingCoordinator::new(VotingConfig::default());
        let decision = coordinator.decide(&[], &[], Utc::now());
        assert_eq!(decision.action, DecisionAction::Hold);
        assert!(decision.is_consistent());
    }

    #[test]
    fn rebalances_when_consensus_clears_threshold() {
        let coordinator = VotingCoordinator::new(VotingConfig::default());
        let signals = vec![opportunity_signal(1, 2, "USDC")];
        let candidates = vec![candidate(950_000, 100, 500)];
        let decision = coordinator.decide(&signals, &candidates, Utc::now());
        assert_eq!(decision.action, DecisionAction::Rebalance);
        assert!(decision.is_consistent());
    }

    #[test]
    fn holds_when_no_matching_opportunity_signal_backs_the_candidate() {
        let coordinator = VotingCoordinator::new(VotingConfig::default());
        // Opportunity signal doesn't match the candidate's (from, to, token),
        // so signal_support is 0 and strategy_score alone can't clear
        // consensus_threshold with the default weights.
        let signals = vec![opportunity_signal(3, 4, "DAI")];
        let candidates = vec![candidate(950_000, 100, 500)];
        let decision = coordinator.decide(&signals, &candidates, Utc::now());
        assert_eq!(decision.action, DecisionAction::Hold);
    }

    #[test]
    fn higher_combined_score_candidate_wins() {
        let coordinator = VotingCoordinator::new(VotingConfig::default());
        let signals = vec![opportunity_signal(1, 2, "USDC")];
        let weak = candidate(950_000, 100, 500);
        let mut strong = candidate(950_000, 50, 400);
        strong.candidate[0].target_pool_address = "0xstrong".to_string();
        let candidates = vec![weak, strong];
        let decision = coordinator.decide(&signals, &candidates, Utc::now());
        assert_eq!(decision.action, DecisionAction::Rebalance);
        assert_eq!(decision.steps[0].target_pool_address, "0xstrong");
    }

    #[test]
    fn ties_break_on_lexicographic_pool_when_confidence_and_risk_match() {
        let coordinator = VotingCoordinator::new(VotingConfig::default());
        let signals = vec![opportunity_signal(1, 2, "USDC")];
        let mut first = candidate(950_000, 100, 500);
        first.candidate[0].target_pool_address = "0xzzz".to_string();
        let mut second = candidate(950_000, 100, 500);
        second.candidate[0].target_pool_address = "0xaaa".to_string();
        let candidates = vec![first, second];
        let decision = coordinator.decide(&signals, &candidates, Utc::now());
        assert_eq!(decision.steps[0].target_pool_address, "0xaaa");
    }

    #[test]
    fn holds_when_confidence_below_minimum() {
        let coordinator = VotingCoordinator::new(VotingConfig::default());
        let candidates = vec![candidate(100_000, 100, 500)];
        let decision = coordinator.decide(&[], &candidates, Utc::now());
        assert_eq!(decision.action, DecisionAction::Hold);
    }

    #[test]
    fn emergency_signal_triggers_exit_regardless_of_candidates() {
        let coordinator = VotingCoordinator::new(VotingConfig::default());
        let signals = vec![Signal {
            kind: SignalKind::Alert,
            chain: 1,
            to_chain: 1,
            protocol: Protocol::Aave,
            token: String::new(),
            magnitude_bps: 0,
            confidence_ppm: 950_000,
            message: "gas spike".into(),
            created_at: Utc::now(),
        }];
        let candidates = vec![candidate(950_000, 100, 500)];
        let decision = coordinator.decide(&signals, &candidates, Utc::now());
        assert_eq!(decision.action, DecisionAction::EmergencyExit);
        assert!(decision.is_consistent());
    }
}
