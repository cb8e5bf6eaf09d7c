//! Action selection when exploration is enabled.
//!
//! The mapper's distribution is mixed with a uniform one at the application's
//! epsilon, then one action is drawn. The draw is seeded from the event id, so
//! replaying an event id reproduces the same choice and the logged probability
//! is the one the action was actually chosen with.

use rand::{rngs::StdRng, Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::mapper::ActionProbability;

/// `(1 - epsilon) * p + epsilon / n` for every action. Epsilon is clamped to `[0, 1]`.
pub fn smooth(ranking: &[ActionProbability], epsilon: f32) -> Vec<ActionProbability> {
    let epsilon = if epsilon.is_finite() {
        epsilon.clamp(0.0, 1.0)
    } else {
        0.0
    };
    if epsilon == 0.0 || ranking.is_empty() {
        return ranking.to_vec();
    }
    let uniform = epsilon / ranking.len() as f32;
    ranking
        .iter()
        .map(|a| ActionProbability {
            action: a.action,
            probability: (1.0 - epsilon) * a.probability + uniform,
        })
        .collect()
}

fn rng_for(event_id: &str) -> StdRng {
    let digest = Sha256::digest(event_id.as_bytes());
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest);
    StdRng::from_seed(seed)
}

/// Index into `ranking` drawn for `event_id`.
pub fn sample(event_id: &str, ranking: &[ActionProbability]) -> Option<usize> {
    if ranking.is_empty() {
        return None;
    }
    let total: f32 = ranking
        .iter()
        .map(|a| a.probability)
        .filter(|p| p.is_finite() && *p > 0.0)
        .sum();
    if total <= 0.0 {
        return Some(0);
    }
    let draw = rng_for(event_id).gen::<f32>() * total;
    let mut cumulative = 0.0;
    for (i, a) in ranking.iter().enumerate() {
        if a.probability.is_finite() && a.probability > 0.0 {
            cumulative += a.probability;
            if draw < cumulative {
                return Some(i);
            }
        }
    }
    // Rounding can leave the draw just above the last cumulative sum.
    ranking
        .iter()
        .rposition(|a| a.probability.is_finite() && a.probability > 0.0)
}

/// Smoothed ranking with the drawn action moved to the front; the rest keep
/// their order.
pub fn explore(event_id: &str, ranking: &[ActionProbability], epsilon: f32) -> Vec<ActionProbability> {
    let mut smoothed = smooth(ranking, epsilon);
    if let Some(chosen) = sample(event_id, &smoothed) {
        let picked = smoothed.remove(chosen);
        smoothed.insert(0, picked);
    }
    smoothed
}
