//! Logits → emotion label and intensity level.

use crate::types::{ClassificationResult, Emotion, EMOTION_CLASSES};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

const LOGIT_LEVEL_3: f32 = 1.2;
const LOGIT_LEVEL_2: f32 = 0.6;

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("classifier score {index} is non-finite ({value})")]
    NonFinite { index: usize, value: f32 },
    #[error("unknown level policy: {0}")]
    UnknownPolicy(String),
}

/// How the intensity level (1..=3) is derived from the winning class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LevelPolicy {
    /// `floor(p_winner × 3) + 1`, clamped to 1..=3.
    #[default]
    ProbabilityThirds,
    /// Raw winning logit: > 1.2 → 3, > 0.6 → 2, otherwise 1.
    LogitLadder,
}

impl LevelPolicy {
    pub fn level(self, probability: f32, logit: f32) -> u8 {
        match self {
            LevelPolicy::ProbabilityThirds => {
                let level = (probability * 3.0).floor() as i32 + 1;
                level.clamp(1, 3) as u8
            }
            LevelPolicy::LogitLadder => {
                if logit > LOGIT_LEVEL_3 {
                    3
                } else if logit > LOGIT_LEVEL_2 {
                    2
                } else {
                    1
                }
            }
        }
    }
}

impl FromStr for LevelPolicy {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "probability" | "probability-thirds" => Ok(Self::ProbabilityThirds),
            "logit" | "logit-ladder" => Ok(Self::LogitLadder),
            other => Err(DecodeError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Numerically stable softmax (max-subtracted, accumulated in f64).
pub fn softmax(scores: &[f32; EMOTION_CLASSES]) -> [f32; EMOTION_CLASSES] {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let exps: [f64; EMOTION_CLASSES] = std::array::from_fn(|i| (scores[i] as f64 - max).exp());
    let sum: f64 = exps.iter().sum();
    std::array::from_fn(|i| (exps[i] / sum) as f32)
}

/// Index of the largest value; the first one wins ties.
fn argmax(values: &[f32; EMOTION_CLASSES]) -> usize {
    let mut best = 0;
    for i in 1..EMOTION_CLASSES {
        if values[i] > values[best] {
            best = i;
        }
    }
    best
}

pub fn decode(
    raw_scores: [f32; EMOTION_CLASSES],
    policy: LevelPolicy,
) -> Result<ClassificationResult, DecodeError> {
    if let Some((index, &value)) = raw_scores.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(DecodeError::NonFinite { index, value });
    }

    let probabilities = softmax(&raw_scores);
    let winner = argmax(&probabilities);
    let emotion = Emotion::ALL[winner];
    let level = policy.level(probabilities[winner], raw_scores[winner]);

    tracing::debug!(
        %emotion,
        level,
        confidence = probabilities[winner],
        logit = raw_scores[winner],
        "decoded classifier output"
    );

    Ok(ClassificationResult {
        emotion,
        level,
        raw_scores,
        probabilities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_distribution(p: &[f32; EMOTION_CLASSES]) {
        assert!(p.iter().all(|v| *v >= 0.0), "negative probability in {p:?}");
        let sum: f32 = p.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6, "sum = {sum}");
    }

    #[test]
    fn test_single_hot_logit() {
        let result = decode([1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], LevelPolicy::ProbabilityThirds).unwrap();
        assert_eq!(result.emotion, Emotion::Sadness);
        let e = std::f32::consts::E;
        let expected = e / (e + 6.0);
        assert!((result.probabilities[0] - expected).abs() < 1e-6);
        assert!((result.probabilities[0] - 0.3118).abs() < 1e-3);
        assert!((result.probabilities[0] - 1.0 / 7.0).abs() > 0.1);
        assert_eq!(result.level, 1);
    }

    #[test]
    fn test_softmax_well_formed() {
        let cases: [[f32; EMOTION_CLASSES]; 6] = [
            [0.0; EMOTION_CLASSES],
            [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
            [-5.0, 3.5, 0.1, 12.0, -0.7, 2.2, 9.9],
            [1000.0, -1000.0, 0.0, 500.0, -500.0, 1.0, 999.0],
            [-1e30, -1e30, -1e30, -1e30, -1e30, -1e30, -1e30],
            [f32::MAX, f32::MIN, 0.0, 1.0, -1.0, 2.0, -2.0],
        ];
        for scores in cases {
            assert_distribution(&softmax(&scores));
        }
    }

    #[test]
    fn test_uniform_scores() {
        let p = softmax(&[3.0; EMOTION_CLASSES]);
        for v in p {
            assert!((v - 1.0 / 7.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_ties_pick_first() {
        let result = decode([0.0, 2.0, 2.0, 0.0, 0.0, 0.0, 0.0], LevelPolicy::ProbabilityThirds).unwrap();
        assert_eq!(result.emotion, Emotion::Joy);
    }

    #[test]
    fn test_probability_thirds_levels() {
        let policy = LevelPolicy::ProbabilityThirds;
        assert_eq!(policy.level(0.2, 0.0), 1);
        assert_eq!(policy.level(0.34, 0.0), 2);
        assert_eq!(policy.level(0.7, 0.0), 3);
        assert_eq!(policy.level(1.0, 0.0), 3);
        assert_eq!(policy.level(0.0, 0.0), 1);
    }

    #[test]
    fn test_logit_ladder_levels() {
        let policy = LevelPolicy::LogitLadder;
        assert_eq!(policy.level(0.99, 1.5), 3);
        assert_eq!(policy.level(0.99, 1.2), 2);
        assert_eq!(policy.level(0.99, 0.9), 2);
        assert_eq!(policy.level(0.99, 0.6), 1);
        assert_eq!(policy.level(0.99, -3.0), 1);
    }

    #[test]
    fn test_policies_diverge() {
        // Dominant but small logits: confident by probability, weak by logit.
        let scores = [1.0, -5.0, -5.0, -5.0, -5.0, -5.0, -5.0];
        let by_prob = decode(scores, LevelPolicy::ProbabilityThirds).unwrap();
        let by_logit = decode(scores, LevelPolicy::LogitLadder).unwrap();
        assert_eq!(by_prob.level, 3);
        assert_eq!(by_logit.level, 2);
    }

    #[test]
    fn test_decode_deterministic() {
        let scores = [0.3, -1.2, 2.5, 0.0, 1.1, -0.4, 0.9];
        let a = decode(scores, LevelPolicy::default()).unwrap();
        let b = decode(scores, LevelPolicy::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.emotion, Emotion::Anger);
    }

    #[test]
    fn test_non_finite_rejected() {
        let err = decode([0.0, f32::NAN, 0.0, 0.0, 0.0, 0.0, 0.0], LevelPolicy::default()).unwrap_err();
        assert!(matches!(err, DecodeError::NonFinite { index: 1, .. }));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("logit".parse::<LevelPolicy>().unwrap(), LevelPolicy::LogitLadder);
        assert_eq!("probability".parse::<LevelPolicy>().unwrap(), LevelPolicy::ProbabilityThirds);
        assert!("blend".parse::<LevelPolicy>().is_err());
    }
}
