use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::EngineError;

/// Half-up rounding used everywhere marks are displayed or compared:
/// `floor(scale*x + 0.5) / scale`.
pub fn round_half_up(x: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    ((scale * x) + 0.5).floor() / scale
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalcConfig {
    /// Threshold on the 0-20 scale a subject or overall average must reach
    /// to count as passing.
    pub passing_threshold: f64,
    pub round_decimals: u32,
}

impl Default for CalcConfig {
    fn default() -> Self {
        Self {
            passing_threshold: 10.0,
            round_decimals: 2,
        }
    }
}

impl CalcConfig {
    pub fn round(&self, x: f64) -> f64 {
        round_half_up(x, self.round_decimals)
    }

    /// Integer key at display precision, for tie comparison.
    fn display_key(&self, x: f64) -> i64 {
        (x * 10f64.powi(self.round_decimals as i32)).round() as i64
    }
}

/// One raw evaluation mark, already scoped to (student, assignment, term).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequenceScore {
    pub sequence: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubjectAverage {
    pub value: f64,
    pub score_count: usize,
}

/// Mean of a student's sequence marks for one subject-assignment.
///
/// Zero marks is `InsufficientData`, never an average of 0.00: the caller
/// drops the subject from the weighted total instead.
pub fn subject_average(
    scores: &[SequenceScore],
    cfg: &CalcConfig,
) -> Result<SubjectAverage, EngineError> {
    if scores.is_empty() {
        return Err(EngineError::InsufficientData);
    }
    let sum: f64 = scores.iter().map(|s| s.value).sum();
    Ok(SubjectAverage {
        value: cfg.round(sum / scores.len() as f64),
        score_count: scores.len(),
    })
}

/// Statistics over one set of per-student averages. All fields are absent
/// when no student contributed, so an empty set never renders as 0.00.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStats {
    pub count: usize,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub std_dev: Option<f64>,
    pub pass_rate: Option<f64>,
}

impl ClassStats {
    pub fn empty() -> Self {
        ClassStats {
            count: 0,
            mean: None,
            min: None,
            max: None,
            std_dev: None,
            pass_rate: None,
        }
    }
}

pub fn class_stats(averages: &[f64], cfg: &CalcConfig) -> ClassStats {
    let n = averages.len();
    if n == 0 {
        return ClassStats::empty();
    }
    let mean = averages.iter().sum::<f64>() / n as f64;
    // Population variance (divisor n): the class is the whole population of
    // interest, not a sample from it.
    let variance = averages.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    let min = averages.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = averages.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let passing = averages
        .iter()
        .filter(|v| **v >= cfg.passing_threshold)
        .count();
    ClassStats {
        count: n,
        mean: Some(cfg.round(mean)),
        min: Some(min),
        max: Some(max),
        std_dev: Some(cfg.round(variance.sqrt())),
        pass_rate: Some(cfg.round(passing as f64 / n as f64)),
    }
}

/// Coefficient-weighted overall average over (subject average, coefficient)
/// pairs: `sum(avg * coeff) / sum(coeff)`.
pub fn overall_average(parts: &[(f64, i64)], cfg: &CalcConfig) -> Result<f64, EngineError> {
    let coeff_total: i64 = parts.iter().map(|(_, c)| *c).sum();
    if parts.is_empty() || coeff_total <= 0 {
        return Err(EngineError::NoGradedSubjects);
    }
    let weighted: f64 = parts.iter().map(|(avg, c)| avg * (*c as f64)).sum();
    Ok(cfg.round(weighted / coeff_total as f64))
}

#[derive(Debug, Clone)]
pub struct RankTable {
    pub by_student: HashMap<String, Option<i64>>,
    /// Count of students that actually carried an average; the "class size"
    /// printed next to a rank.
    pub ranked_count: usize,
}

impl RankTable {
    pub fn rank_of(&self, student_id: &str) -> Option<i64> {
        self.by_student.get(student_id).copied().flatten()
    }
}

/// Standard competition ranking, descending by average.
///
/// Ties (at display precision) share a rank and the next distinct value
/// takes its 1-based position, so [18, 15, 15, 10] ranks as [1, 2, 2, 4].
/// Entries without an average keep a null rank and do not count toward the
/// ranked total.
pub fn assign_ranks(entries: &[(String, Option<f64>)], cfg: &CalcConfig) -> RankTable {
    let mut by_student: HashMap<String, Option<i64>> =
        entries.iter().map(|(id, _)| (id.clone(), None)).collect();

    let mut ranked: Vec<(&str, i64)> = entries
        .iter()
        .filter_map(|(id, avg)| avg.map(|a| (id.as_str(), cfg.display_key(a))))
        .collect();
    ranked.sort_by(|a, b| match b.1.cmp(&a.1) {
        // Deterministic order among ties; the shared rank hides it anyway.
        Ordering::Equal => a.0.cmp(b.0),
        other => other,
    });

    let mut prev_key: Option<i64> = None;
    let mut prev_rank = 0i64;
    for (pos, (id, key)) in ranked.iter().enumerate() {
        let rank = match prev_key {
            Some(p) if p == *key => prev_rank,
            _ => pos as i64 + 1,
        };
        prev_key = Some(*key);
        prev_rank = rank;
        by_student.insert((*id).to_string(), Some(rank));
    }

    RankTable {
        by_student,
        ranked_count: ranked.len(),
    }
}
