use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Fixed pass policy: an entry passes when marks/maxMarks reaches this
/// fraction.
pub const PASS_THRESHOLD: f64 = 0.33;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            _ => None,
        }
    }
}

/// Present/absent tallies of a status map. These become the session's cached
/// counts, so they must be derived from the same map the records are written
/// from.
pub fn tally(statuses: &BTreeMap<String, AttendanceStatus>) -> (i64, i64) {
    let present = statuses
        .values()
        .filter(|s| **s == AttendanceStatus::Present)
        .count() as i64;
    let absent = statuses.len() as i64 - present;
    (present, absent)
}

/// Draft helper: overwrites every entry of the working map.
pub fn mark_all(statuses: &mut BTreeMap<String, AttendanceStatus>, status: AttendanceStatus) {
    for value in statuses.values_mut() {
        *value = status;
    }
}

/// A session's attendance percentage. Empty sessions count as 0.
pub fn session_percentage(present: i64, absent: i64) -> f64 {
    let total = present + absent;
    if total <= 0 {
        return 0.0;
    }
    100.0 * present as f64 / total as f64
}

/// Order-sensitive running mean over session percentages:
/// `avg_n = (avg_{n-1} * (n-1) + pct_n) / n`.
///
/// This differs numerically from a flat mean when session sizes vary, and
/// that difference is user-visible, so the formula is kept as-is. Callers
/// must feed sessions in a fixed, stable order.
pub fn running_average(percentages: &[f64]) -> f64 {
    let mut avg = 0.0;
    for (i, pct) in percentages.iter().enumerate() {
        let n = (i + 1) as f64;
        avg = (avg * (n - 1.0) + pct) / n;
    }
    avg
}

/// A student's personal attendance, rounded to the nearest integer percent.
pub fn student_attendance_percentage(present: i64, absent: i64) -> i64 {
    let total = present + absent;
    if total <= 0 {
        return 0;
    }
    (100.0 * present as f64 / total as f64).round() as i64
}

/// One line of an exam's mark list. `studentName` and `rollNo` are roster
/// snapshots taken at exam creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkEntry {
    pub student_id: String,
    pub student_name: String,
    pub roll_no: i64,
    pub marks: f64,
}

/// Whole-set validation; any bad entry rejects the full operation before
/// anything is written.
pub fn validate_marks(entries: &[MarkEntry], max_marks: i64) -> Result<(), String> {
    if max_marks <= 0 {
        return Err("maxMarks must be a positive integer".to_string());
    }
    if entries.is_empty() {
        return Err("marks must contain at least one entry".to_string());
    }
    let max = max_marks as f64;
    for entry in entries {
        if !entry.marks.is_finite() {
            return Err(format!(
                "marks for student {} must be a finite number",
                entry.student_id
            ));
        }
        if entry.marks < 0.0 {
            return Err(format!(
                "marks for student {} must not be negative",
                entry.student_id
            ));
        }
        if entry.marks > max {
            return Err(format!(
                "marks for student {} exceed maxMarks {}",
                entry.student_id, max_marks
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamStats {
    pub entry_count: usize,
    pub average_raw: f64,
    pub average_percent: f64,
    pub highest: f64,
    pub lowest: f64,
    pub pass_rate: f64,
    pub median_percent: f64,
}

/// Read-time statistics over one exam's mark list; nothing here is ever
/// persisted.
pub fn exam_stats(entries: &[MarkEntry], max_marks: i64) -> ExamStats {
    if entries.is_empty() || max_marks <= 0 {
        return ExamStats {
            entry_count: 0,
            average_raw: 0.0,
            average_percent: 0.0,
            highest: 0.0,
            lowest: 0.0,
            pass_rate: 0.0,
            median_percent: 0.0,
        };
    }
    let max = max_marks as f64;
    let mut sum = 0.0;
    let mut highest = f64::MIN;
    let mut lowest = f64::MAX;
    let mut passed = 0usize;
    let mut percents: Vec<f64> = Vec::with_capacity(entries.len());
    for entry in entries {
        sum += entry.marks;
        highest = highest.max(entry.marks);
        lowest = lowest.min(entry.marks);
        if entry.marks / max >= PASS_THRESHOLD {
            passed += 1;
        }
        percents.push(100.0 * entry.marks / max);
    }
    let average_raw = sum / entries.len() as f64;
    ExamStats {
        entry_count: entries.len(),
        average_raw,
        average_percent: 100.0 * average_raw / max,
        highest,
        lowest,
        pass_rate: passed as f64 / entries.len() as f64,
        median_percent: compute_median(&percents),
    }
}

pub fn compute_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0
    }
}

/// One exam reduced to the figure subject grouping works on.
#[derive(Debug, Clone)]
pub struct ExamFigure {
    pub subject: String,
    pub average_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject: String,
    pub average_percent: f64,
    pub exam_count: usize,
}

/// Per-subject mean of each exam's own normalized average. Two-level by
/// contract: exams with small and large mark lists weigh equally, so this is
/// NOT a pooled mean over individual marks.
pub fn subject_averages(figures: &[ExamFigure]) -> Vec<SubjectAverage> {
    let mut by_subject: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for figure in figures {
        let entry = by_subject.entry(figure.subject.as_str()).or_insert((0.0, 0));
        entry.0 += figure.average_percent;
        entry.1 += 1;
    }
    by_subject
        .into_iter()
        .map(|(subject, (sum, count))| SubjectAverage {
            subject: subject.to_string(),
            average_percent: sum / count as f64,
            exam_count: count,
        })
        .collect()
}
