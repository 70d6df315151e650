//! Task id generation
//!
//! Ids have the form `{epochMillis}-{role}-{jobName}-{shardId}-{uuid}` so a
//! lexicographic sort of ids from the same epoch width reflects creation
//! order. Any character outside `[A-Za-z0-9_-]` is replaced with `-` after
//! composition, so ids are safe to embed in paths and command lines.

use crate::clock::Clock;
use crate::domain::TaskConfig;

/// Generate a new task id for `config`.
///
/// Uniqueness rests on the uuid suffix; the leading timestamp gives
/// chronological sorting and the role/job/shard components make ids
/// human-attributable.
pub fn generate_task_id(clock: &dyn Clock, config: &TaskConfig) -> String {
    let raw = format!(
        "{}-{}-{}-{}-{}",
        clock.now_millis(),
        config.role,
        config.job_name,
        config.shard_id,
        uuid::Uuid::new_v4(),
    );
    constrain_charset(&raw)
}

/// Replace anything outside `[A-Za-z0-9_-]` with `-`.
fn constrain_charset(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
