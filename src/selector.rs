//! Rotation selector: round-robin / random / smart (SPEC_FULL.md §4.4).
//!
//! Grounded on `auth/config.rs`'s `resolve_account` (pick the first healthy
//! account), `rate_limit_account` (demote + mark unhealthy-until) and
//! `rotate_first`, generalized from a boolean healthy/unhealthy flag into a
//! continuous score with explanatory reasons. RNG injection is grounded on
//! `zeroai-proxy/src/doctor.rs`'s `rand::seq::IndexedRandom` usage, turned
//! into a parameter instead of an internally-constructed `rand::rng()` so
//! tests can assert exact outcomes.

use crate::error::{CaamError, Result};
use crate::events::EventStore;
use crate::provider::Provider;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RoundRobin,
    Random,
    Smart,
}

#[derive(Debug, Clone)]
pub struct Reason {
    pub text: String,
    pub positive: bool,
}

#[derive(Debug, Clone)]
pub struct Alternative {
    pub name: String,
    pub score: f64,
    pub reasons: Vec<Reason>,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub selected: String,
    pub algorithm: Algorithm,
    pub alternatives: Vec<Alternative>,
}

const COOLDOWN_SCORE: f64 = -10_000.0;
const COOLDOWN_FLOOR: f64 = -9_000.0;
const MAX_RECENCY_PENALTY: f64 = 500.0;
const NEVER_ACTIVATED_BONUS: f64 = 10.0;

pub struct SelectorConfig {
    pub avoid_recent: Duration,
    pub jitter: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self { avoid_recent: Duration::from_secs(30 * 60), jitter: 0.0 }
    }
}

fn ensure_non_empty(candidates: &[String]) -> Result<()> {
    if candidates.is_empty() {
        return Err(CaamError::validation("candidates", "candidate profile list must not be empty"));
    }
    Ok(())
}

/// Round-robin: sort by name, pick the one after `current` (wrapping). No
/// event-store reads, fully deterministic.
pub fn select_round_robin(candidates: &[String], current: Option<&str>) -> Result<Selection> {
    ensure_non_empty(candidates)?;
    let mut sorted = candidates.to_vec();
    sorted.sort();

    let idx = match current.and_then(|c| sorted.iter().position(|n| n == c)) {
        Some(pos) => (pos + 1) % sorted.len(),
        None => 0,
    };

    let alternatives = sorted
        .iter()
        .map(|name| Alternative { name: name.clone(), score: if *name == sorted[idx] { 1.0 } else { 0.0 }, reasons: Vec::new() })
        .collect();

    Ok(Selection { selected: sorted[idx].clone(), algorithm: Algorithm::RoundRobin, alternatives })
}

/// Random: uniform over candidates not currently in cooldown.
pub fn select_random(
    candidates: &[String],
    provider: Provider,
    events: &EventStore,
    now: i64,
    rng: &mut impl Rng,
) -> Result<Selection> {
    ensure_non_empty(candidates)?;
    let mut eligible = Vec::new();
    for name in candidates {
        if events.active_cooldown(provider, name, now)?.is_none() {
            eligible.push(name.clone());
        }
    }
    if eligible.is_empty() {
        return Err(CaamError::conflict("all candidates are on cooldown"));
    }
    let idx = rng.random_range(0..eligible.len());
    let selected = eligible[idx].clone();

    let alternatives = candidates
        .iter()
        .map(|name| Alternative { name: name.clone(), score: if *name == selected { 1.0 } else { 0.0 }, reasons: Vec::new() })
        .collect();

    Ok(Selection { selected, algorithm: Algorithm::Random, alternatives })
}

fn recency_penalty(elapsed: Duration, avoid_recent: Duration) -> f64 {
    if elapsed >= avoid_recent {
        return 0.0;
    }
    let fraction = elapsed.as_secs_f64() / avoid_recent.as_secs_f64().max(f64::EPSILON);
    (MAX_RECENCY_PENALTY * (1.0 - fraction)).clamp(0.0, MAX_RECENCY_PENALTY)
}

/// Smart: score every candidate, pick arg-max. Fails with
/// `AllCandidatesOnCooldown` (a `ConflictRequiresForce`) if every score is at
/// or below the cooldown floor.
pub fn select_smart(
    candidates: &[String],
    provider: Provider,
    events: &EventStore,
    now: i64,
    config: &SelectorConfig,
    rng: &mut impl Rng,
) -> Result<Selection> {
    ensure_non_empty(candidates)?;

    let mut alternatives = Vec::new();
    for name in candidates {
        let mut score = 0.0f64;
        let mut reasons = Vec::new();

        if let Some(cooldown) = events.active_cooldown(provider, name, now)? {
            let until = cooldown.timestamp + cooldown.cooldown_duration_secs.unwrap_or(0);
            score = COOLDOWN_SCORE;
            reasons.push(Reason { text: format!("in cooldown until {until}"), positive: false });
        } else {
            match events.last_activation(provider, name)? {
                Some(last) if now >= last => {
                    let elapsed = Duration::from_secs((now - last).max(0) as u64);
                    if elapsed < config.avoid_recent {
                        let penalty = recency_penalty(elapsed, config.avoid_recent);
                        score -= penalty;
                        reasons.push(Reason { text: "used recently".into(), positive: false });
                    }
                }
                None => {
                    score += NEVER_ACTIVATED_BONUS;
                    reasons.push(Reason { text: "never activated".into(), positive: true });
                }
                _ => {}
            }

            if config.jitter > 0.0 {
                score += rng.random_range(-config.jitter..=config.jitter);
            }
        }

        alternatives.push(Alternative { name: name.clone(), score, reasons });
    }

    let best = alternatives
        .iter()
        .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
        .expect("non-empty candidates checked above");

    if best.score <= COOLDOWN_FLOOR {
        return Err(CaamError::conflict("all candidates are on cooldown"));
    }

    let selected = best.name.clone();
    tracing::debug!(provider = %provider, selected, score = best.score, "selector: smart pick");
    Ok(Selection { selected, algorithm: Algorithm::Smart, alternatives })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn round_robin_loops_through_in_order() {
        let candidates = names(&["p1", "p2", "p3"]);
        let s1 = select_round_robin(&candidates, None).unwrap();
        assert_eq!(s1.selected, "p1");
        let s2 = select_round_robin(&candidates, Some(&s1.selected)).unwrap();
        assert_eq!(s2.selected, "p2");
        let s3 = select_round_robin(&candidates, Some(&s2.selected)).unwrap();
        assert_eq!(s3.selected, "p3");
        let s4 = select_round_robin(&candidates, Some(&s3.selected)).unwrap();
        assert_eq!(s4.selected, "p1");
    }

    #[test]
    fn round_robin_rejects_empty_candidates() {
        assert!(select_round_robin(&[], None).is_err());
    }

    #[test]
    fn smart_demotes_cooldown_profile() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventStore::new(dir.path());
        events.log(Event::cooldown_set(Provider::Claude, "p1", 1000, 3600, "rate limited")).unwrap();

        let candidates = names(&["p1", "p2"]);
        let mut rng = StdRng::seed_from_u64(1);
        let selection = select_smart(&candidates, Provider::Claude, &events, 1001, &SelectorConfig::default(), &mut rng).unwrap();
        assert_eq!(selection.selected, "p2");

        let p1_alt = selection.alternatives.iter().find(|a| a.name == "p1").unwrap();
        assert!(p1_alt.score <= -9000.0);

        events.clear_cooldown(Provider::Claude, "p1", 1002).unwrap();
        let mut rng2 = StdRng::seed_from_u64(1);
        let selection2 = select_smart(&["p1".to_string()], Provider::Claude, &events, 1003, &SelectorConfig::default(), &mut rng2).unwrap();
        assert_eq!(selection2.selected, "p1");
    }

    #[test]
    fn smart_all_cooldown_is_conflict_error() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventStore::new(dir.path());
        events.log(Event::cooldown_set(Provider::Codex, "p1", 1000, 3600, "rl")).unwrap();
        events.log(Event::cooldown_set(Provider::Codex, "p2", 1000, 3600, "rl")).unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let err = select_smart(&names(&["p1", "p2"]), Provider::Codex, &events, 1001, &SelectorConfig::default(), &mut rng).unwrap_err();
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn random_excludes_cooldown_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventStore::new(dir.path());
        events.log(Event::cooldown_set(Provider::Gemini, "p1", 1000, 3600, "rl")).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let selection = select_random(&names(&["p1", "p2"]), Provider::Gemini, &events, 1001, &mut rng).unwrap();
            assert_eq!(selection.selected, "p2");
        }
    }

    #[test]
    fn recency_penalty_decays_to_zero_at_window_edge() {
        let window = Duration::from_secs(1800);
        assert!(recency_penalty(Duration::from_secs(0), window) > recency_penalty(Duration::from_secs(900), window));
        assert_eq!(recency_penalty(Duration::from_secs(1800), window), 0.0);
    }
}
