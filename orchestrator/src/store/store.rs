use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use bincode::config::standard;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::schema::{self, ALL_CFS};
use crate::error::{StoreError, StoreResult};
use crate::model::{ChatMessage, Story, StoryStatus, StoryStep};

pub type SharedStoryStore = Arc<StoryStore>;

/// RocksDB-backed persistent store for stories, steps, chat history, and
/// the progress event log.
pub struct StoryStore {
    db: RwLock<DB>,
    path: PathBuf,
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    let (value, _len) = bincode::serde::decode_from_slice(bytes, standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Retries a single RocksDB call once on a transient failure, mirroring
/// `WorktreeCoordinator::run_git_with_retry`'s policy but bounded to the one
/// retry SPEC_FULL.md promises callers for a `StoreUnavailable` condition. A
/// retryable error that persists through the retry surfaces as
/// `StoreError::Unavailable` rather than the raw RocksDB error.
fn retry_once<T>(mut op: impl FnMut() -> Result<T, rocksdb::Error>) -> StoreResult<T> {
    match op() {
        Ok(value) => Ok(value),
        Err(e) => {
            let err: StoreError = e.into();
            if err.is_retryable() {
                op().map_err(|e2| StoreError::Unavailable(e2.to_string()))
            } else {
                Err(err)
            }
        }
    }
}

impl StoryStore {
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

        Ok(Self {
            db: RwLock::new(db),
            path,
        })
    }

    pub fn shared(self) -> SharedStoryStore {
        Arc::new(self)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    // -- generic helpers ----------------------------------------------------

    fn put<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        db.put_cf(&cf, key.as_bytes(), encode(value)?)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        match retry_once(|| db.get_cf(&cf, key.as_bytes()))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, cf_name: &str, key: &str) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        db.delete_cf(&cf, key.as_bytes())?;
        Ok(())
    }

    fn list_prefix_values<T: DeserializeOwned>(
        &self,
        cf_name: &str,
        prefix: &str,
    ) -> StoreResult<Vec<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let mut out = Vec::new();
        for item in db.prefix_iterator_cf(&cf, prefix.as_bytes()) {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key);
            if !key_str.starts_with(prefix) {
                break;
            }
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    // -- stories --------------------------------------------------------------

    pub fn create_story(&self, story: &Story) -> StoreResult<()> {
        self.put(schema::CF_STORIES, &schema::keys::story(&story.id), story)
    }

    pub fn get_story(&self, id: &Uuid) -> StoreResult<Option<Story>> {
        self.get(schema::CF_STORIES, &schema::keys::story(id))
    }

    pub fn list_stories(
        &self,
        status_filter: Option<StoryStatus>,
        repo_path_filter: Option<&str>,
    ) -> StoreResult<Vec<Story>> {
        let canon_filter = repo_path_filter.map(Story::canonicalize_path_str);
        let mut stories: Vec<Story> =
            self.list_prefix_values(schema::CF_STORIES, &schema::keys::story_prefix())?;

        if let Some(status) = status_filter {
            stories.retain(|s| s.status == status);
        }
        if let Some(ref canon) = canon_filter {
            stories.retain(|s| &Story::canonicalize_path_str(&s.repository_path) == canon);
        }
        stories.sort_by_key(|s| s.created_at);
        Ok(stories)
    }

    pub fn delete_story(&self, id: &Uuid) -> StoreResult<()> {
        self.delete(schema::CF_STORIES, &schema::keys::story(id))?;

        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let steps_cf = db
            .cf_handle(schema::CF_STEPS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_STEPS.to_string()))?;
        let step_prefix = schema::keys::step_prefix(id);
        for item in db.prefix_iterator_cf(&steps_cf, step_prefix.as_bytes()) {
            let (key, _) = item?;
            if !key.starts_with(step_prefix.as_bytes()) {
                break;
            }
            db.delete_cf(&steps_cf, &key)?;
        }

        let chat_cf = db
            .cf_handle(schema::CF_CHAT)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_CHAT.to_string()))?;
        let chat_prefix = schema::keys::chat_prefix(id);
        for item in db.prefix_iterator_cf(&chat_cf, chat_prefix.as_bytes()) {
            let (key, _) = item?;
            if !key.starts_with(chat_prefix.as_bytes()) {
                break;
            }
            db.delete_cf(&chat_cf, &key)?;
        }

        Ok(())
    }

    /// General read-modify-write helper. Runs `f` while holding the store's
    /// write lock so the read, mutation, and write are atomic with respect
    /// to every other store operation (including `cas_story_status`).
    pub fn update_story<F>(&self, id: &Uuid, f: F) -> StoreResult<Story>
    where
        F: FnOnce(&mut Story),
    {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_STORIES)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_STORIES.to_string()))?;

        let key = schema::keys::story(id);
        let bytes = retry_once(|| db.get_cf(&cf, key.as_bytes()))?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut story: Story = decode(&bytes)?;

        f(&mut story);
        story.updated_at = chrono::Utc::now();

        let encoded = encode(&story)?;
        retry_once(|| db.put_cf(&cf, key.as_bytes(), &encoded))?;
        Ok(story)
    }

    pub fn update_story_status(&self, id: &Uuid, new_status: StoryStatus) -> StoreResult<Story> {
        self.update_story(id, |s| s.status = new_status)
    }

    /// Compare-and-swap on `Story.status`. Succeeds only if the story's
    /// current status matches `expected`; otherwise returns
    /// `ConflictingUpdate` without mutating anything. Holding the write
    /// lock across the whole read-compare-write makes this atomic against
    /// concurrent callers, including other `update_story`/CAS calls.
    pub fn cas_story_status(
        &self,
        id: &Uuid,
        expected: StoryStatus,
        new: StoryStatus,
    ) -> StoreResult<Story> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_STORIES)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_STORIES.to_string()))?;

        let key = schema::keys::story(id);
        let bytes = retry_once(|| db.get_cf(&cf, key.as_bytes()))?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut story: Story = decode(&bytes)?;

        if story.status != expected {
            return Err(StoreError::ConflictingUpdate {
                id: *id,
                expected: format!("{expected:?}"),
                actual: format!("{:?}", story.status),
            });
        }

        story.status = new;
        story.updated_at = chrono::Utc::now();
        let encoded = encode(&story)?;
        retry_once(|| db.put_cf(&cf, key.as_bytes(), &encoded))?;
        Ok(story)
    }

    // -- steps ------------------------------------------------------------

    pub fn upsert_step(&self, step: &StoryStep) -> StoreResult<()> {
        self.put(
            schema::CF_STEPS,
            &schema::keys::step(&step.story_id, &step.id),
            step,
        )
    }

    pub fn remove_step(&self, story_id: &Uuid, step_id: &Uuid) -> StoreResult<()> {
        self.delete(schema::CF_STEPS, &schema::keys::step(story_id, step_id))
    }

    pub fn list_steps(&self, story_id: &Uuid) -> StoreResult<Vec<StoryStep>> {
        let mut steps: Vec<StoryStep> =
            self.list_prefix_values(schema::CF_STEPS, &schema::keys::step_prefix(story_id))?;
        steps.sort_by_key(|s| s.order);
        Ok(steps)
    }

    pub fn get_step(&self, story_id: &Uuid, step_id: &Uuid) -> StoreResult<Option<StoryStep>> {
        self.get(schema::CF_STEPS, &schema::keys::step(story_id, step_id))
    }

    /// Replace a story's entire step list (used by `plan`/`decompose`).
    pub fn replace_steps(&self, story_id: &Uuid, steps: &[StoryStep]) -> StoreResult<()> {
        let existing = self.list_steps(story_id)?;
        for step in &existing {
            self.remove_step(story_id, &step.id)?;
        }
        for step in steps {
            self.upsert_step(step)?;
        }
        Ok(())
    }

    // -- chat ---------------------------------------------------------------

    pub fn append_chat(&self, owner_id: &Uuid, message: &ChatMessage) -> StoreResult<()> {
        let nanos = message.timestamp.timestamp_nanos_opt().unwrap_or(0);
        self.put(
            schema::CF_CHAT,
            &schema::keys::chat(owner_id, nanos),
            message,
        )
    }

    pub fn get_chat(&self, owner_id: &Uuid) -> StoreResult<Vec<ChatMessage>> {
        self.list_prefix_values(schema::CF_CHAT, &schema::keys::chat_prefix(owner_id))
    }

    // -- events (progress stream audit log) ----------------------------------

    pub fn put_event(
        &self,
        timestamp_nanos: i64,
        event_id: &str,
        event: &impl Serialize,
    ) -> StoreResult<()> {
        let key = schema::keys::event(timestamp_nanos, event_id);
        let bytes =
            serde_json::to_vec(event).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_EVENTS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_EVENTS.to_string()))?;
        db.put_cf(&cf, key.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn get_events_range<T: DeserializeOwned>(
        &self,
        start_nanos: i64,
        end_nanos: i64,
    ) -> StoreResult<Vec<(i64, T)>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_EVENTS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_EVENTS.to_string()))?;

        let start_key = schema::keys::event(start_nanos, "");
        let iter = db.iterator_cf(
            &cf,
            rocksdb::IteratorMode::From(start_key.as_bytes(), rocksdb::Direction::Forward),
        );

        let mut events = Vec::new();
        for result in iter {
            let (key, value) = result?;
            let key_str = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            let Some(ts) = schema::keys::parse_event_timestamp(&key_str) else {
                continue;
            };
            if ts > end_nanos {
                break;
            }
            let event: T = serde_json::from_slice(&value)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            events.push((ts, event));
        }
        Ok(events)
    }
}
