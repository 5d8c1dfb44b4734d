//! Column family names and key-formatting helpers for the story store.
//!
//! Key layout mirrors the ensemble state store's scheme: entity-prefixed
//! string keys, nanosecond-zero-padded timestamps for the event log so
//! lexicographic iteration order matches chronological order.

pub const CF_STORIES: &str = "cf_stories";
pub const CF_STEPS: &str = "cf_steps";
pub const CF_CHAT: &str = "cf_chat";
pub const CF_EVENTS: &str = "cf_events";

pub const ALL_CFS: &[&str] = &[CF_STORIES, CF_STEPS, CF_CHAT, CF_EVENTS];

pub mod keys {
    use uuid::Uuid;

    pub fn story(id: &Uuid) -> String {
        format!("story:{id}")
    }

    pub fn story_prefix() -> String {
        "story:".to_string()
    }

    /// Steps are keyed by story so a prefix scan returns exactly one story's
    /// steps; the in-memory list is then sorted by `order`.
    pub fn step(story_id: &Uuid, step_id: &Uuid) -> String {
        format!("step:{story_id}:{step_id}")
    }

    pub fn step_prefix(story_id: &Uuid) -> String {
        format!("step:{story_id}:")
    }

    /// Chat keyed by (owner, nanosecond timestamp) so history replays in order.
    pub fn chat(owner_id: &Uuid, timestamp_nanos: i64) -> String {
        format!("chat:{owner_id}:{timestamp_nanos:020}")
    }

    pub fn chat_prefix(owner_id: &Uuid) -> String {
        format!("chat:{owner_id}:")
    }

    pub fn event(timestamp_nanos: i64, event_id: &str) -> String {
        // i64 timestamps are always non-negative here (Utc::now), but guard
        // against underflow when formatting as an unsigned width field.
        let shifted = (timestamp_nanos as i128) + (i64::MAX as i128) + 1;
        format!("evt:{shifted:039}:{event_id}")
    }

    pub fn parse_event_timestamp(key: &str) -> Option<i64> {
        let rest = key.strip_prefix("evt:")?;
        let ts_str = rest.split(':').next()?;
        let shifted: i128 = ts_str.parse().ok()?;
        let ts = shifted - (i64::MAX as i128) - 1;
        i64::try_from(ts).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn event_keys_sort_lexicographically_by_time() {
        let a = keys::event(-100, "a");
        let b = keys::event(0, "b");
        let c = keys::event(100, "c");
        let mut v = vec![c.clone(), a.clone(), b.clone()];
        v.sort();
        assert_eq!(v, vec![a, b, c]);
    }

    #[test]
    fn event_timestamp_roundtrips() {
        for ts in [-1_000_000_i64, 0, 1_700_000_000_000_000_000] {
            let key = keys::event(ts, "id");
            assert_eq!(keys::parse_event_timestamp(&key), Some(ts));
        }
    }

    #[test]
    fn step_prefix_scopes_to_one_story() {
        let story_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();
        let key = keys::step(&story_id, &step_id);
        assert!(key.starts_with(&keys::step_prefix(&story_id)));
    }
}
