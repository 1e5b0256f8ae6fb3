use serde::{Deserialize, Serialize};

/// Fixed weekday order of a weekly grid. Every stored schedule carries
/// exactly one entry per label, in this order.
pub const WEEKDAYS: [&str; 6] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

/// Start-of-day default used when appending a period to an empty day.
pub const DAY_START: &str = "08:00";

const DEFAULT_PERIOD_MINUTES: u32 = 60;
const LAST_MINUTE_OF_DAY: u32 = 23 * 60 + 59;

/// One timetable slot. `teacherName` is a display snapshot taken when the
/// period was written; it may drift from the user document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Period {
    pub start_time: String,
    pub end_time: String,
    pub subject: String,
    pub teacher_id: String,
    #[serde(default)]
    pub teacher_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDay {
    pub day: String,
    pub periods: Vec<Period>,
}

/// A decoded `class_schedules` document.
#[derive(Debug, Clone)]
pub struct ScheduleDoc {
    pub id: String,
    pub class_section_id: String,
    pub class_section_name: String,
    pub days: Vec<ScheduleDay>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedPeriod {
    pub start_time: String,
    pub end_time: String,
    pub subject: String,
    pub class_name: String,
    pub class_section_id: String,
    pub source_schedule_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherDay {
    pub day: String,
    pub periods: Vec<ProjectedPeriod>,
}

/// A grid must carry one entry per weekday, Monday through Saturday.
pub fn validate_days(days: &[ScheduleDay]) -> Result<(), String> {
    if days.len() != WEEKDAYS.len() {
        return Err(format!(
            "days must contain exactly {} entries, Monday through Saturday (got {})",
            WEEKDAYS.len(),
            days.len()
        ));
    }
    for (i, day) in days.iter().enumerate() {
        if day.day != WEEKDAYS[i] {
            return Err(format!(
                "day {} must be labeled {} (got {:?})",
                i + 1,
                WEEKDAYS[i],
                day.day
            ));
        }
    }
    Ok(())
}

/// "HH:MM" to minutes since midnight. Zero-padded 24h clock only.
pub fn parse_minutes(hhmm: &str) -> Option<u32> {
    let (h, m) = hhmm.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let hours: u32 = h.parse().ok()?;
    let minutes: u32 = m.parse().ok()?;
    if hours >= 24 || minutes >= 60 {
        return None;
    }
    Some(hours * 60 + minutes)
}

pub fn format_minutes(total: u32) -> String {
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// Draft helper: appends a blank period whose start defaults to the previous
/// period's end (or the day-start default) and whose end is one hour later,
/// clamped at the end of the day. Nothing is persisted here.
pub fn add_period(days: &mut [ScheduleDay], day_index: usize) -> Result<(), String> {
    let Some(day) = days.get_mut(day_index) else {
        return Err(format!("dayIndex {} is out of range", day_index));
    };
    let start_time = day
        .periods
        .last()
        .map(|p| p.end_time.clone())
        .unwrap_or_else(|| DAY_START.to_string());
    let start = parse_minutes(&start_time).unwrap_or(0);
    let end = (start + DEFAULT_PERIOD_MINUTES).min(LAST_MINUTE_OF_DAY);
    day.periods.push(Period {
        start_time,
        end_time: format_minutes(end),
        subject: String::new(),
        teacher_id: String::new(),
        teacher_name: String::new(),
    });
    Ok(())
}

/// Draft helper: removes one period. No minimum-count rule at this layer.
pub fn remove_period(
    days: &mut [ScheduleDay],
    day_index: usize,
    period_index: usize,
) -> Result<(), String> {
    let Some(day) = days.get_mut(day_index) else {
        return Err(format!("dayIndex {} is out of range", day_index));
    };
    if period_index >= day.periods.len() {
        return Err(format!("periodIndex {} is out of range", period_index));
    }
    day.periods.remove(period_index);
    Ok(())
}

/// Storage keeps periods in whatever order they were written; read models
/// sort each day by start time. Lexicographic compare is correct for
/// zero-padded 24h strings.
pub fn sort_for_display(days: &mut [ScheduleDay]) {
    for day in days {
        day.periods
            .sort_by(|a, b| a.start_time.cmp(&b.start_time));
    }
}

/// Inverts the class-to-teacher relationship across the full schedule set:
/// six day buckets in weekday order, each holding every period of the given
/// teacher flattened with its owning class, sorted by start time.
///
/// Pure derivation over whatever the caller scanned; never cached, so it can
/// never go stale against the stored schedules.
pub fn project_for_teacher(teacher_id: &str, schedules: &[ScheduleDoc]) -> Vec<TeacherDay> {
    let mut out: Vec<TeacherDay> = WEEKDAYS
        .iter()
        .map(|d| TeacherDay {
            day: (*d).to_string(),
            periods: Vec::new(),
        })
        .collect();

    for schedule in schedules {
        for (day_index, day) in schedule.days.iter().enumerate().take(out.len()) {
            for period in &day.periods {
                if period.teacher_id != teacher_id {
                    continue;
                }
                out[day_index].periods.push(ProjectedPeriod {
                    start_time: period.start_time.clone(),
                    end_time: period.end_time.clone(),
                    subject: period.subject.clone(),
                    class_name: schedule.class_section_name.clone(),
                    class_section_id: schedule.class_section_id.clone(),
                    source_schedule_id: schedule.id.clone(),
                });
            }
        }
    }

    for day in &mut out {
        day.periods.sort_by(|a, b| a.start_time.cmp(&b.start_time));
    }
    out
}
