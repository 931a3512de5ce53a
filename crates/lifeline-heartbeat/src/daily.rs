//! Daily check-in questionnaire and resonance scoring.
//!
//! Each answer is normalized into `[0, 1]` against its question's range and
//! compared with the decimal digit of pi at the same position (scaled to
//! `[0, 1]`). Per-question alignment is `1 - |answer - digit|`; alignments
//! are combined with weights `1 / (i + 1)^2`, so early questions dominate.
//! The percentage is the resonance scaled to 0-100.

use std::collections::VecDeque;

use chrono::{DateTime, NaiveDate, TimeZone};
use lifeline_mesh::Status;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ScoreError;

/// Reference digits, indexed modulo their length.
const PI_DIGITS: &str = concat!(
    "31415926535897932384626433832795028841971693993751058209749445923078164062862089",
    "98628034825342117067982148086513282306647093844609550582231725359408128481117450",
    "28410270193852110555964462294895493038196442881097566593344612847564823378678316",
    "52712019091456485669234603486104543266482133936072602491412737245870066063155881",
    "74881520920962829254091715364367892590360011330530548820466521384146951941511609",
    "43305727036575959195309218611738193261179310511854807446237996274956735188575272",
    "48912279381830119491298336733624406566430860213949463952247371907021798609437027",
    "70539217176293176752384674818467669405132000568127145263560827785771342757789609",
    "17363717872146844090122495343014654958537105079227968925892354201995611212902196",
    "08640344181598136297747713099605187072113499999983729780499510597317328160963185",
    "95024459455346908302642522308253344685035261931188171010003137838752886587533208",
    "38142061717766914730359825349042875546873115956286388235378759375195778185778053",
    "21712268066130019278766111959092164201989",
);

/// Digit of pi at position `index` (wrapping).
pub fn pi_digit(index: usize) -> u8 {
    let bytes = PI_DIGITS.as_bytes();
    bytes[index % bytes.len()] - b'0'
}

/// Score returned for an empty questionnaire.
pub const NEUTRAL_PERCENTAGE: f64 = 50.0;

pub const GREEN_FROM: f64 = 80.0;
pub const YELLOW_FROM: f64 = 60.0;
pub const ORANGE_FROM: f64 = 40.0;

/// Status bucket for a daily percentage.
pub fn status_for_percentage(percentage: f64) -> Status {
    if percentage >= GREEN_FROM {
        Status::Green
    } else if percentage >= YELLOW_FROM {
        Status::Yellow
    } else if percentage >= ORANGE_FROM {
        Status::Orange
    } else {
        Status::Red
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Energy,
    Sensory,
    Emotional,
    Social,
    Burnout,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Question {
    pub id: &'static str,
    pub category: Category,
    pub label: &'static str,
    pub min: f64,
    pub max: f64,
}

impl Question {
    const fn slider(id: &'static str, category: Category, label: &'static str, min: f64, max: f64) -> Self {
        Self { id, category, label, min, max }
    }

    /// `(value - min) / (max - min)`, or 0.5 for a degenerate range.
    pub fn normalize(&self, value: f64) -> f64 {
        if self.max == self.min {
            return 0.5;
        }
        (value - self.min) / (self.max - self.min)
    }
}

pub const DEFAULT_QUESTIONS: [Question; 15] = [
    Question::slider("spoons", Category::Energy, "Current Spoon Level", 0.0, 12.0),
    Question::slider("energy_baseline", Category::Energy, "Energy vs Baseline", 0.0, 10.0),
    Question::slider("masking_effort", Category::Energy, "Masking Effort Today", 0.0, 10.0),
    Question::slider("sensory_overload", Category::Sensory, "Sensory Overload Level", 0.0, 10.0),
    Question::slider("environment_comfort", Category::Sensory, "Environmental Comfort", 0.0, 10.0),
    Question::slider("stim_regulation", Category::Sensory, "Stim Regulation Needs", 0.0, 10.0),
    Question::slider("mood", Category::Emotional, "Overall Mood", 1.0, 10.0),
    Question::slider("stress", Category::Emotional, "Stress Level", 0.0, 10.0),
    Question::slider("rsd_triggers", Category::Emotional, "RSD Triggers Encountered", 0.0, 10.0),
    Question::slider("social_cost", Category::Social, "Social Interaction Energy Cost", 0.0, 10.0),
    Question::slider("communication_friction", Category::Social, "Communication Friction", 0.0, 10.0),
    Question::slider("need_quiet", Category::Social, "Need for Quiet/Space", 0.0, 10.0),
    Question::slider("brain_fog", Category::Burnout, "Brain Fog Level", 0.0, 10.0),
    Question::slider("executive_function", Category::Burnout, "Executive Function Capacity", 0.0, 10.0),
    Question::slider("recovery_needs", Category::Burnout, "Recovery Needs", 0.0, 10.0),
];

/// One raw answer as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub question_id: String,
    pub value: f64,
}

impl Answer {
    pub fn new(question_id: impl Into<String>, value: f64) -> Self {
        Self {
            question_id: question_id.into(),
            value,
        }
    }
}

/// A validated answer with its normalized value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub question_id: String,
    pub value: f64,
    pub normalized: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub responses: Vec<Response>,
    /// 0-1.
    pub resonance: f64,
    /// 0-100.
    pub percentage: f64,
}

/// A scored daily record. At most one per calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyCheckIn {
    pub id: String,
    /// Unix millis.
    pub timestamp: u64,
    pub date: NaiveDate,
    pub responses: Vec<Response>,
    pub percentage: f64,
    pub resonance: f64,
    pub status: Status,
}

/// Weighted phase alignment of normalized answers with the reference digits.
pub fn resonance(normalized: &[f64]) -> f64 {
    if normalized.is_empty() {
        return NEUTRAL_PERCENTAGE / 100.0;
    }

    let (weighted, total) = normalized
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(weighted, total), (i, &s)| {
            let reference = f64::from(pi_digit(i)) / 9.0;
            let phase = (1.0 - (s - reference).abs()).max(0.0);
            let weight = 1.0 / ((i + 1) as f64).powi(2);
            (weighted + phase * weight, total + weight)
        });
    weighted / total
}

#[derive(Debug, Clone)]
pub struct DailyScoreEngine {
    questions: Vec<Question>,
}

impl Default for DailyScoreEngine {
    fn default() -> Self {
        Self::new(DEFAULT_QUESTIONS.to_vec())
    }
}

impl DailyScoreEngine {
    pub fn new(questions: Vec<Question>) -> Self {
        Self { questions }
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn question(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    /// Score answers in submission order.
    pub fn score(&self, answers: &[Answer]) -> Result<Score, ScoreError> {
        let responses = answers
            .iter()
            .map(|answer| {
                let question = self
                    .question(&answer.question_id)
                    .ok_or_else(|| ScoreError::UnknownQuestion(answer.question_id.clone()))?;
                if !answer.value.is_finite()
                    || answer.value < question.min
                    || answer.value > question.max
                {
                    return Err(ScoreError::OutOfRange {
                        question_id: answer.question_id.clone(),
                        value: answer.value,
                        min: question.min,
                        max: question.max,
                    });
                }
                Ok(Response {
                    question_id: answer.question_id.clone(),
                    value: answer.value,
                    normalized: question.normalize(answer.value),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let normalized: Vec<f64> = responses.iter().map(|r| r.normalized).collect();
        let resonance = resonance(&normalized);
        Ok(Score {
            responses,
            resonance,
            percentage: (resonance * 100.0).clamp(0.0, 100.0),
        })
    }

    /// Score and stamp a record for the calendar date of `now` in its own
    /// time zone.
    pub fn submit<Tz: TimeZone>(
        &self,
        answers: &[Answer],
        now: &DateTime<Tz>,
    ) -> Result<DailyCheckIn, ScoreError> {
        let score = self.score(answers)?;
        Ok(DailyCheckIn {
            id: Uuid::new_v4().to_string(),
            timestamp: u64::try_from(now.timestamp_millis()).unwrap_or_default(),
            date: now.date_naive(),
            responses: score.responses,
            percentage: score.percentage,
            resonance: score.resonance,
            status: status_for_percentage(score.percentage),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

/// Window compared by [`DailyHistory::summary`].
pub const TREND_WINDOW: usize = 7;
/// Points of change still counted as stable.
pub const TREND_DEADBAND: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySummary {
    pub entries: usize,
    pub average_percentage: f64,
    pub trend: Trend,
}

/// Daily records, newest date first, one per date.
#[derive(Debug, Clone)]
pub struct DailyHistory {
    records: VecDeque<DailyCheckIn>,
    cap: usize,
}

impl DailyHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            records: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// Rebuild from stored records in any order.
    pub fn from_records(records: impl IntoIterator<Item = DailyCheckIn>, cap: usize) -> Self {
        let mut history = Self::new(cap);
        for record in records {
            history.upsert(record);
        }
        history
    }

    /// Insert `record`, replacing any record for the same date. Returns the
    /// replaced record.
    pub fn upsert(&mut self, record: DailyCheckIn) -> Option<DailyCheckIn> {
        let replaced = self
            .records
            .iter()
            .position(|r| r.date == record.date)
            .and_then(|i| self.records.remove(i));

        let at = self
            .records
            .iter()
            .position(|r| r.date < record.date)
            .unwrap_or(self.records.len());
        self.records.insert(at, record);
        self.records.truncate(self.cap);
        replaced
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest(&self) -> Option<&DailyCheckIn> {
        self.records.front()
    }

    pub fn for_date(&self, date: NaiveDate) -> Option<&DailyCheckIn> {
        self.records.iter().find(|r| r.date == date)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DailyCheckIn> {
        self.records.iter()
    }

    /// The newest `limit` records.
    pub fn newest(&self, limit: usize) -> Vec<DailyCheckIn> {
        self.records.iter().take(limit).cloned().collect()
    }

    pub fn summary(&self) -> HistorySummary {
        let mean = |records: &[f64]| -> Option<f64> {
            (!records.is_empty()).then(|| records.iter().sum::<f64>() / records.len() as f64)
        };

        let all: Vec<f64> = self.records.iter().map(|r| r.percentage).collect();
        let recent = &all[..all.len().min(TREND_WINDOW)];
        let prior = &all[recent.len()..all.len().min(2 * TREND_WINDOW)];

        let trend = match (mean(recent), mean(prior)) {
            (Some(now), Some(before)) if now - before > TREND_DEADBAND => Trend::Improving,
            (Some(now), Some(before)) if before - now > TREND_DEADBAND => Trend::Declining,
            _ => Trend::Stable,
        };

        HistorySummary {
            entries: all.len(),
            average_percentage: mean(&all).unwrap_or(0.0),
            trend,
        }
    }
}
