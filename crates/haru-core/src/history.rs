//! Monthly emotion summary over a user's daily logs.

use crate::types::{Emotion, EMOTION_CLASSES};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Occurrences needed for the representative emotion to count as dominant.
pub const DOMINANT_THRESHOLD: usize = 3;

const EMPTY_COMMENT: &str = "이번 달은 기록된 감정이 없어요. 기록을 시작해 보세요! 📝";
const MIXED_COMMENT: &str = "다양한 감정으로 가득 찬 다이나믹한 한 달이었어요! 🎢";

/// One saved day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionLog {
    pub date: NaiveDate,
    pub emotion: Emotion,
    pub level: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlySummary {
    /// `None` when the month is empty or the top count is shared.
    pub representative: Option<Emotion>,
    /// Occurrences of the most frequent emotion.
    pub count: usize,
    pub dominant: bool,
    pub comment: String,
}

/// (short, long) comment per emotion.
fn comments(emotion: Emotion) -> (&'static str, &'static str) {
    match emotion {
        Emotion::Joy => (
            "이번 달은 행복 에너지가 넘쳤어요! ✨",
            "매 순간을 밝게 만들어준 기쁨 덕분에 주변까지 환하게 빛났어요. 이 행복을 다음 달에도 이어가시길 응원합니다!",
        ),
        Emotion::Sadness => (
            "마음이 잠시 차분해지는 시간이 필요했어요. 🌙",
            "슬픔은 감정을 돌아보는 중요한 시간이에요. 잠시 멈추고 쉬어가도 괜찮아요. 다음 달은 더 가벼운 마음으로 시작하길 바랍니다.",
        ),
        Emotion::Panic => (
            "예상치 못한 순간에도 잘 대처했어요! 🌪️",
            "당황스러운 일이 많았지만, 결국 그 상황들을 지나왔어요. 앞으로는 조금 더 유연하게 대처할 수 있을 거예요. 스스로를 믿으세요!",
        ),
        Emotion::Anxiety => (
            "미래에 대한 고민이 많았던 한 달이었네요. 💭",
            "불안함은 앞으로 나아가기 위한 준비 과정일 수 있어요. 너무 걱정하지 마세요. 한 걸음씩 천천히 목표를 향해 나아갈 힘이 있어요.",
        ),
        Emotion::Anger => (
            "화나는 일에도 감정을 잘 다스렸어요! 🌋",
            "분노는 에너지가 넘친다는 증거입니다. 이 에너지를 긍정적인 방향으로 풀어내는 연습을 해보면 좋을 것 같아요. 잘했어요!",
        ),
        Emotion::Hurt => (
            "상처를 회복하고 있는 소중한 시간이었어요. 🩹",
            "마음의 상처는 아물 시간이 필요해요. 이 시간을 통해 자신을 돌보고 치유할 수 있었을 거예요. 당신의 회복을 응원합니다.",
        ),
        Emotion::Neutral => (
            "평온하고 차분하게 균형을 잡은 한 달이었어요. 🧘",
            "특별한 감정 기복 없이 안정적인 상태를 유지했어요. 이 중립의 평온함이 앞으로의 모든 일에 긍정적인 영향을 줄 거예요.",
        ),
    }
}

/// Summarize a set of logs, usually one calendar month's.
pub fn summarize(logs: &[EmotionLog]) -> MonthlySummary {
    if logs.is_empty() {
        return MonthlySummary {
            representative: None,
            count: 0,
            dominant: false,
            comment: EMPTY_COMMENT.to_string(),
        };
    }

    let mut counts = [0usize; EMOTION_CLASSES];
    for log in logs {
        counts[log.emotion.index()] += 1;
    }

    let max = counts.iter().copied().max().unwrap_or(0);
    let mut leaders = Emotion::ALL.iter().copied().filter(|e| counts[e.index()] == max);
    let first = leaders.next();
    let tied = leaders.next().is_some();
    let dominant = max >= DOMINANT_THRESHOLD;

    let (representative, comment) = match first {
        Some(emotion) if !tied => {
            let (short, long) = comments(emotion);
            (Some(emotion), if dominant { long } else { short })
        }
        _ => (None, MIXED_COMMENT),
    };

    MonthlySummary {
        representative,
        count: max,
        dominant,
        comment: comment.to_string(),
    }
}

/// Summarize only the logs dated in `year`-`month`.
pub fn summarize_month(logs: &[EmotionLog], year: i32, month: u32) -> MonthlySummary {
    let in_month: Vec<EmotionLog> = logs
        .iter()
        .filter(|log| log.date.year() == year && log.date.month() == month)
        .cloned()
        .collect();
    tracing::debug!(year, month, total = logs.len(), matched = in_month.len(), "monthly summary");
    summarize(&in_month)
}
