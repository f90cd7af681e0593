// src/exam/scoring.rs

//! Score computation per exam type.

use crate::models::exam::{ExamDefinition, ExamType};
use crate::models::session::{AnswerRecord, SessionResult};

/// Wrong answers needed to cancel one correct answer under negative marking.
const WRONG_PER_PENALTY: f64 = 4.0;

/// How a raw answer tally turns into a score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoringRule {
    /// `correct - wrong / 4`, floored at zero (YKS).
    NegativeMarking,
    /// Only correct answers count (KPSS, and the fallback for unknown types).
    RawCorrect,
}

impl ScoringRule {
    pub fn for_exam_type(exam_type: &ExamType) -> Self {
        match exam_type {
            ExamType::YksTyt | ExamType::YksAyt => ScoringRule::NegativeMarking,
            ExamType::Kpss | ExamType::Other(_) => ScoringRule::RawCorrect,
        }
    }

    pub fn apply(self, correct: i32, wrong: i32) -> f64 {
        match self {
            ScoringRule::NegativeMarking => {
                let net = f64::from(correct) - f64::from(wrong) / WRONG_PER_PENALTY;
                net.max(0.0)
            }
            ScoringRule::RawCorrect => f64::from(correct),
        }
    }
}

/// Computes the score of one attempt. Empty answers never affect the score.
pub fn compute_score(exam_type: &ExamType, correct: i32, wrong: i32, _empty: i32) -> f64 {
    ScoringRule::for_exam_type(exam_type).apply(correct, wrong)
}

/// Correct / wrong / empty counts of one attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub correct: i32,
    pub wrong: i32,
    pub empty: i32,
}

/// Counts answers against the exam size.
///
/// Questions never answered count as empty, the same as answers recorded
/// without an option.
pub fn tally<'a>(answers: impl IntoIterator<Item = &'a AnswerRecord>, total_questions: i32) -> Tally {
    let mut tally = Tally::default();
    for answer in answers {
        match (answer.option_id, answer.is_correct) {
            (Some(_), true) => tally.correct += 1,
            (Some(_), false) => tally.wrong += 1,
            (None, _) => {}
        }
    }
    tally.empty = (total_questions - tally.correct - tally.wrong).max(0);
    tally
}

pub fn percentage(correct: i32, total_questions: i32) -> f64 {
    if total_questions <= 0 {
        return 0.0;
    }
    f64::from(correct) / f64::from(total_questions) * 100.0
}

/// Builds the final result of a session from its recorded answers.
pub fn evaluate<'a>(
    exam: &ExamDefinition,
    answers: impl IntoIterator<Item = &'a AnswerRecord>,
    time_taken_secs: i64,
) -> SessionResult {
    let Tally { correct, wrong, empty } = tally(answers, exam.total_questions);

    SessionResult {
        score: compute_score(&exam.exam_type, correct, wrong, empty),
        correct,
        wrong,
        empty,
        total_questions: exam.total_questions,
        percentage: percentage(correct, exam.total_questions),
        time_taken_secs,
    }
}
