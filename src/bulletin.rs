use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::calc::{self, CalcConfig, ClassStats, SequenceScore, SubjectAverage};
use crate::error::EngineError;
use crate::store;

/// One subject row of a bulletin: the student's own result next to the
/// class-wide picture for the same subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub assignment_id: String,
    pub subject: String,
    pub short_code: String,
    pub teacher: Option<String>,
    pub coefficient: i64,
    /// Absent when the student has no score for the subject; the subject is
    /// then excluded from the weighted overall, never counted as 0.
    pub average: Option<f64>,
    pub score_count: usize,
    pub rank_in_subject: Option<i64>,
    pub class_stats: ClassStats,
}

/// Class-wide weighted average for one sequence of the term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceAverage {
    pub sequence: i64,
    pub class_mean: Option<f64>,
    pub graded_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassProfile {
    pub class_mean: Option<f64>,
    pub top_average: Option<f64>,
    pub bottom_average: Option<f64>,
    pub pass_rate: Option<f64>,
    pub std_dev: Option<f64>,
}

impl ClassProfile {
    pub fn empty() -> Self {
        ClassProfile {
            class_mean: None,
            top_average: None,
            bottom_average: None,
            pass_rate: None,
            std_dev: None,
        }
    }

    fn from_stats(stats: &ClassStats) -> Self {
        ClassProfile {
            class_mean: stats.mean,
            top_average: stats.max,
            bottom_average: stats.min,
            pass_rate: stats.pass_rate,
            std_dev: stats.std_dev,
        }
    }
}

/// The computed content of one bulletin. The store serializes the three
/// block fields into the JSON columns of the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulletinPayload {
    pub overall_average: Option<f64>,
    pub rank: Option<i64>,
    pub class_size: i64,
    pub subjects: Vec<SubjectLine>,
    pub sequences: Vec<SequenceAverage>,
    pub profile: ClassProfile,
    pub general_remark: Option<String>,
}

impl BulletinPayload {
    pub fn subjects_json(&self) -> String {
        serde_json::to_string(&self.subjects).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn sequences_json(&self) -> String {
        serde_json::to_string(&self.sequences).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn profile_json(&self) -> String {
        serde_json::to_string(&self.profile).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateMode {
    /// Normal draft (re)generation; refused outright when any bulletin of
    /// the class/term is already validated.
    Regenerate,
    /// Explicit replacement of issued bulletins: validated revisions stay
    /// frozen and new draft revisions are stacked on top.
    Supersede,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateSummary {
    pub class_id: String,
    pub term_id: String,
    pub student_count: usize,
    pub written: usize,
}

#[derive(Debug, Clone)]
struct ClassAssignment {
    id: String,
    subject: String,
    short_code: String,
    teacher: Option<String>,
    coefficient: i64,
}

/// Build and persist the bulletins of one class for one term.
///
/// The whole unit runs in a single transaction: either every student's
/// draft is written or none is. Ranks and class statistics are only
/// meaningful against the complete set of per-student averages, so a
/// partial write would be worse than no write.
pub fn generate_class_drafts(
    conn: &mut Connection,
    class_id: &str,
    term_id: &str,
    cfg: &CalcConfig,
    mode: GenerateMode,
) -> Result<GenerateSummary, EngineError> {
    let tx = conn.transaction()?;
    let summary = build_and_write(&tx, class_id, term_id, cfg, mode)?;
    tx.commit()?;
    Ok(summary)
}

fn build_and_write(
    conn: &Connection,
    class_id: &str,
    term_id: &str,
    cfg: &CalcConfig,
    mode: GenerateMode,
) -> Result<GenerateSummary, EngineError> {
    if store::term_closed(conn, term_id)? {
        return Err(EngineError::TermClosed {
            term_id: term_id.to_string(),
        });
    }
    let class: Option<String> = conn
        .query_row("SELECT id FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()?;
    if class.is_none() {
        return Err(EngineError::not_found("class"));
    }
    if mode == GenerateMode::Regenerate {
        if let Some(student_id) = store::first_validated_student(conn, class_id, term_id)? {
            return Err(EngineError::AlreadyValidated { student_id });
        }
    }

    let mut students_stmt = conn.prepare(
        "SELECT id FROM students WHERE class_id = ? AND active = 1 ORDER BY sort_order",
    )?;
    let students: Vec<String> = students_stmt
        .query_map([class_id], |r| r.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut assign_stmt = conn.prepare(
        "SELECT a.id, sub.name, sub.short_code,
                CASE WHEN t.id IS NULL THEN NULL
                     ELSE t.last_name || ' ' || t.first_name END,
                a.coefficient
         FROM subject_assignments a
         JOIN subjects sub ON sub.id = a.subject_id
         LEFT JOIN teachers t ON t.id = a.teacher_id
         WHERE a.class_id = ?
         ORDER BY sub.short_code",
    )?;
    let assignments: Vec<ClassAssignment> = assign_stmt
        .query_map([class_id], |r| {
            Ok(ClassAssignment {
                id: r.get(0)?,
                subject: r.get(1)?,
                short_code: r.get(2)?,
                teacher: r.get(3)?,
                coefficient: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // Bulk read of the raw scores for the whole class/term. If this read
    // fails the transaction unwinds and nothing is written.
    let mut scores_by_pair: HashMap<(String, String), Vec<SequenceScore>> = HashMap::new();
    let mut scores_stmt = conn.prepare(
        "SELECT s.student_id, s.assignment_id, s.sequence, s.value
         FROM scores s
         JOIN subject_assignments a ON a.id = s.assignment_id
         WHERE a.class_id = ? AND s.term_id = ?",
    )?;
    let score_rows = scores_stmt.query_map((class_id, term_id), |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, i64>(2)?,
            r.get::<_, f64>(3)?,
        ))
    })?;
    for row in score_rows {
        let (student_id, assignment_id, sequence, value) = row?;
        scores_by_pair
            .entry((student_id, assignment_id))
            .or_default()
            .push(SequenceScore { sequence, value });
    }
    // Scores arrive in storage order; the engine orders by sequence itself.
    for scores in scores_by_pair.values_mut() {
        scores.sort_by_key(|s| s.sequence);
    }

    // Phase 1: every student's per-subject averages. Nothing class-wide may
    // be computed until this map is complete.
    let mut avg_by_pair: HashMap<(String, String), SubjectAverage> = HashMap::new();
    for student_id in &students {
        for a in &assignments {
            let scores = scores_by_pair
                .get(&(student_id.clone(), a.id.clone()))
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            match calc::subject_average(scores, cfg) {
                Ok(avg) => {
                    avg_by_pair.insert((student_id.clone(), a.id.clone()), avg);
                }
                // Ungraded subject: excluded from weighting, not a failure.
                Err(EngineError::InsufficientData) => {}
                Err(e) => return Err(e),
            }
        }
    }

    // Phase 2: class statistics, subject ranks, sequence means, overall
    // averages and class ranks, all over the complete phase-1 result.
    let mut stats_by_assignment: HashMap<String, ClassStats> = HashMap::new();
    let mut ranks_by_assignment: HashMap<String, calc::RankTable> = HashMap::new();
    for a in &assignments {
        let entries: Vec<(String, Option<f64>)> = students
            .iter()
            .map(|s| {
                let avg = avg_by_pair.get(&(s.clone(), a.id.clone())).map(|v| v.value);
                (s.clone(), avg)
            })
            .collect();
        let averages: Vec<f64> = entries.iter().filter_map(|(_, v)| *v).collect();
        stats_by_assignment.insert(a.id.clone(), calc::class_stats(&averages, cfg));
        ranks_by_assignment.insert(a.id.clone(), calc::assign_ranks(&entries, cfg));
    }

    let sequences: BTreeSet<i64> = scores_by_pair
        .values()
        .flatten()
        .map(|s| s.sequence)
        .collect();
    let mut sequence_lines: Vec<SequenceAverage> = Vec::new();
    for seq in sequences {
        let mut per_student: Vec<f64> = Vec::new();
        for student_id in &students {
            let mut parts: Vec<(f64, i64)> = Vec::new();
            for a in &assignments {
                let Some(scores) = scores_by_pair.get(&(student_id.clone(), a.id.clone())) else {
                    continue;
                };
                let in_seq: Vec<SequenceScore> = scores
                    .iter()
                    .filter(|s| s.sequence == seq)
                    .copied()
                    .collect();
                if let Ok(avg) = calc::subject_average(&in_seq, cfg) {
                    parts.push((avg.value, a.coefficient));
                }
            }
            if let Ok(overall) = calc::overall_average(&parts, cfg) {
                per_student.push(overall);
            }
        }
        let stats = calc::class_stats(&per_student, cfg);
        sequence_lines.push(SequenceAverage {
            sequence: seq,
            class_mean: stats.mean,
            graded_count: stats.count,
        });
    }

    let mut overall_by_student: HashMap<String, Option<f64>> = HashMap::new();
    for student_id in &students {
        let parts: Vec<(f64, i64)> = assignments
            .iter()
            .filter_map(|a| {
                avg_by_pair
                    .get(&(student_id.clone(), a.id.clone()))
                    .map(|v| (v.value, a.coefficient))
            })
            .collect();
        let overall = match calc::overall_average(&parts, cfg) {
            Ok(v) => Some(v),
            // No graded subject at all: the bulletin still exists, with the
            // overall average marked unavailable rather than 0.00.
            Err(EngineError::NoGradedSubjects) => None,
            Err(e) => return Err(e),
        };
        overall_by_student.insert(student_id.clone(), overall);
    }

    let rank_entries: Vec<(String, Option<f64>)> = students
        .iter()
        .map(|s| (s.clone(), overall_by_student.get(s).copied().flatten()))
        .collect();
    let ranks = calc::assign_ranks(&rank_entries, cfg);
    let graded: Vec<f64> = rank_entries.iter().filter_map(|(_, v)| *v).collect();
    let profile = ClassProfile::from_stats(&calc::class_stats(&graded, cfg));

    let generated_at = Utc::now().to_rfc3339();
    let mut written = 0usize;
    for student_id in &students {
        let subjects: Vec<SubjectLine> = assignments
            .iter()
            .map(|a| {
                let avg = avg_by_pair.get(&(student_id.clone(), a.id.clone()));
                SubjectLine {
                    assignment_id: a.id.clone(),
                    subject: a.subject.clone(),
                    short_code: a.short_code.clone(),
                    teacher: a.teacher.clone(),
                    coefficient: a.coefficient,
                    average: avg.map(|v| v.value),
                    score_count: avg.map(|v| v.score_count).unwrap_or(0),
                    rank_in_subject: ranks_by_assignment
                        .get(&a.id)
                        .and_then(|t| t.rank_of(student_id)),
                    class_stats: stats_by_assignment
                        .get(&a.id)
                        .cloned()
                        .unwrap_or_else(ClassStats::empty),
                }
            })
            .collect();

        let payload = BulletinPayload {
            overall_average: overall_by_student.get(student_id).copied().flatten(),
            rank: ranks.rank_of(student_id),
            class_size: ranks.ranked_count as i64,
            subjects,
            sequences: sequence_lines.clone(),
            profile: profile.clone(),
            general_remark: None,
        };

        match mode {
            GenerateMode::Regenerate => {
                store::upsert_draft(conn, student_id, term_id, &payload, &generated_at)?;
            }
            GenerateMode::Supersede => {
                store::supersede_draft(conn, student_id, term_id, &payload, &generated_at)?;
            }
        }
        written += 1;
    }

    Ok(GenerateSummary {
        class_id: class_id.to_string(),
        term_id: term_id.to_string(),
        student_count: students.len(),
        written,
    })
}

/// One line of the review sheet the validation screen works from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSheetRow {
    pub student_id: String,
    pub display_name: String,
    pub overall_average: Option<f64>,
    pub rank: Option<i64>,
    pub status: Option<String>,
    pub revision: Option<i64>,
}

pub fn class_sheet(
    conn: &Connection,
    class_id: &str,
    term_id: &str,
) -> Result<Vec<ClassSheetRow>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.last_name, s.first_name,
                b.overall_average, b.rank, b.status, b.revision
         FROM students s
         LEFT JOIN bulletins b
           ON b.student_id = s.id AND b.term_id = ?1
          AND b.revision = (SELECT MAX(revision) FROM bulletins
                            WHERE student_id = s.id AND term_id = ?1)
         WHERE s.class_id = ?2 AND s.active = 1
         ORDER BY s.sort_order",
    )?;
    let rows = stmt
        .query_map((term_id, class_id), |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(ClassSheetRow {
                student_id: r.get(0)?,
                display_name: format!("{}, {}", last, first),
                overall_average: r.get(3)?,
                rank: r.get(4)?,
                status: r.get(5)?,
                revision: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
