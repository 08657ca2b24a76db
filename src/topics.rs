//! Topic naming for the retry, dead-letter and delay-level topics, and the
//! fixed replay delay ladder.

use std::time::Duration;

/// Highest delay level on the ladder
pub const MAX_DELAY_LEVEL: u32 = 18;

/// Retry ceiling; a message that still fails at this count goes to the
/// dead-letter topic
pub const MAX_RECONSUME_COUNT: u32 = 16;

/// Backoff for a task whose republish failed and is retried in-process
pub const LOCAL_RETRY_DELAY_LEVEL: u32 = 2;

const RETRY_TOPIC_PREFIX: &str = "%RETRY%";
const DLQ_TOPIC_PREFIX: &str = "%DLQ%";
const DELAY_TOPIC_PREFIX: &str = "%DELAY%";

/// Replay delays, indexed by `level - 1`
const DELAY_LADDER: [(&str, u64); MAX_DELAY_LEVEL as usize] = [
    ("1s", 1),
    ("5s", 5),
    ("10s", 10),
    ("30s", 30),
    ("1m", 60),
    ("2m", 120),
    ("3m", 180),
    ("4m", 240),
    ("5m", 300),
    ("6m", 360),
    ("7m", 420),
    ("8m", 480),
    ("9m", 540),
    ("10m", 600),
    ("20m", 1200),
    ("30m", 1800),
    ("1h", 3600),
    ("2h", 7200),
];

/// Per-group retry topic name
pub fn retry_topic(group_id: &str) -> String {
    format!("{}{}", RETRY_TOPIC_PREFIX, group_id)
}

/// Per-group dead-letter topic name
pub fn dead_letter_topic(group_id: &str) -> String {
    format!("{}{}", DLQ_TOPIC_PREFIX, group_id)
}

/// Check whether the level is on the ladder
pub fn is_valid_delay_level(level: u32) -> bool {
    (1..=MAX_DELAY_LEVEL).contains(&level)
}

/// Name of the process-wide topic for one delay level.
///
/// Returns `None` for levels off the ladder.
pub fn delay_topic(level: u32) -> Option<String> {
    if !is_valid_delay_level(level) {
        return None;
    }
    let (suffix, _) = DELAY_LADDER[(level - 1) as usize];
    Some(format!("{}{}", DELAY_TOPIC_PREFIX, suffix))
}

/// Replay delay for one ladder level, clamped to the top of the ladder
pub fn delay_duration(level: u32) -> Duration {
    let level = level.clamp(1, MAX_DELAY_LEVEL);
    let (_, secs) = DELAY_LADDER[(level - 1) as usize];
    Duration::from_secs(secs)
}
