//! Per-queue runtime state and lifecycle operations, grounded in spec
//! §4.7 ("Startup", "Message lifecycle", "Concurrency", "Fetching",
//! "Acknowledgment", "Replying", "Timeouts", "Purge") and
//! `examples/original_source/libs/grd/include/grd/PersQueue.h`'s
//! "Automatic processing" doc-comment bullet list.

use crate::archive;
use crate::message::{MessageStatus, PersistentMessage};
use crate::store::{PersistentQueueStore, LOCK_SAVE_FREQ};
use chrono::Utc;
use dashmap::DashMap;
use nodegrid_address::Address;
use nodegrid_protocol::Envelope;
use nodegrid_shared::{NodegridError, NodegridResult, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub reply_addr: Option<Address>,
    pub reply_cmd: String,
    /// Worker address the queue pushes to; when unset, `sent` messages
    /// always revert to `ready` on `handle_timeout` (spec §4.7 "Timeouts").
    pub exec_addr: Option<Address>,
    pub handle_timeout_ms: i64,
    pub storage_timeout_ms: i64,
    pub error_limit: u32,
    pub error_delay_ms: i64,
    pub archive_fname: Option<String>,
    pub purge_interval_ms: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            reply_addr: None,
            reply_cmd: "pqueue.reply".to_string(),
            exec_addr: None,
            handle_timeout_ms: 30_000,
            storage_timeout_ms: 3_600_000,
            error_limit: 3,
            error_delay_ms: 5_000,
            archive_fname: None,
            purge_interval_ms: 60_000,
        }
    }
}

struct LockBlock {
    next: u64,
    end: u64,
}

pub struct Queue {
    pub name: String,
    pub config: QueueConfig,
    store: Arc<dyn PersistentQueueStore>,
    messages: DashMap<u64, PersistentMessage>,
    next_id: AtomicU64,
    lock_block: Mutex<LockBlock>,
}

impl Queue {
    pub fn new(name: impl Into<String>, config: QueueConfig, store: Arc<dyn PersistentQueueStore>) -> Self {
        Queue {
            name: name.into(),
            config,
            store,
            messages: DashMap::new(),
            next_id: AtomicU64::new(0),
            lock_block: Mutex::new(LockBlock { next: 0, end: 0 }),
        }
    }

    /// Startup recovery sweep (spec §4.7 "Startup"): purge first, then
    /// revert interrupted transitions for whatever remains.
    pub async fn open(&self) -> NodegridResult<()> {
        self.purge().await?;
        let active = self.store.load_active(&self.name).await?;
        let mut max_id = 0;
        for mut msg in active {
            max_id = max_id.max(msg.id);
            match msg.status {
                MessageStatus::Sent | MessageStatus::ExecError if msg.error_cnt < self.config.error_limit => {
                    msg.set_status(MessageStatus::Ready);
                    msg.lock_id = 0;
                    self.store.save(&self.name, &msg).await?;
                }
                MessageStatus::ReplySent | MessageStatus::ReplyError if msg.error_cnt < self.config.error_limit => {
                    msg.set_status(MessageStatus::Handled);
                    self.store.save(&self.name, &msg).await?;
                }
                _ => {}
            }
            self.messages.insert(msg.id, msg);
        }
        self.next_id.store(max_id + 1, Ordering::SeqCst);
        Ok(())
    }

    fn next_lock_id(&self) -> NodegridResult<u64> {
        let mut block = self.lock_block.lock().unwrap_or_else(|e| e.into_inner());
        if block.next >= block.end {
            // synchronous fallback: callers that need a fresh durable
            // reservation should call `ensure_lock_block` first.
            return Err(NodegridError::Other("lock id block exhausted; call ensure_lock_block".into()));
        }
        let id = block.next;
        block.next += 1;
        Ok(id)
    }

    pub async fn ensure_lock_block(&self) -> NodegridResult<()> {
        let needs_refill = {
            let block = self.lock_block.lock().unwrap_or_else(|e| e.into_inner());
            block.next >= block.end
        };
        if needs_refill {
            let first = self.store.reserve_lock_block(&self.name, LOCK_SAVE_FREQ).await?;
            let mut block = self.lock_block.lock().unwrap_or_else(|e| e.into_inner());
            block.next = first;
            block.end = first + LOCK_SAVE_FREQ;
        }
        Ok(())
    }

    pub async fn put(&self, command: impl Into<String>, params: Value, reference: Option<String>, reply_cmd: Option<String>) -> NodegridResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let msg = PersistentMessage::new(id, command, params, reference, reply_cmd);
        self.store.insert(&self.name, msg.clone()).await?;
        self.messages.insert(id, msg);
        Ok(id)
    }

    /// Select up to `limit` `Ready` messages, stamp them `Sent` under one
    /// shared lock id, and return `{lock_id, msg_list}` (spec §4.7
    /// "Fetching").
    pub async fn fetch(&self, limit: usize) -> NodegridResult<(u64, Vec<PersistentMessage>)> {
        self.ensure_lock_block().await?;
        let lock_id = self.next_lock_id()?;
        let mut picked = Vec::new();
        let ready_ids: Vec<u64> = self
            .messages
            .iter()
            .filter(|e| e.value().status == MessageStatus::Ready)
            .map(|e| *e.key())
            .take(limit)
            .collect();
        for id in ready_ids {
            if let Some(mut entry) = self.messages.get_mut(&id) {
                entry.lock_id = lock_id;
                entry.set_status(MessageStatus::Sent);
                self.store.save(&self.name, &entry).await?;
                picked.push(entry.clone());
            }
        }
        Ok((lock_id, picked))
    }

    /// `{lock_id, message_id, exec_status, result?, error?}` (spec §4.7
    /// "Acknowledgment"). Returns `false` (and leaves state untouched) for
    /// a stale `lock_id` — spec's documented optimistic-concurrency guard.
    pub async fn handled(&self, lock_id: u64, message_id: u64, exec_status: i32, result: Option<Value>, error: Option<String>) -> NodegridResult<bool> {
        let Some(mut entry) = self.messages.get_mut(&message_id) else {
            return Ok(false);
        };
        if entry.status != MessageStatus::Sent || entry.lock_id != lock_id {
            tracing::warn!(message_id, lock_id, "stale handled() ack ignored");
            return Ok(false);
        }
        entry.exec_status = Some(exec_status);
        entry.result = result;
        entry.error = error;
        if exec_status == 0 {
            entry.set_status(MessageStatus::Handled);
        } else {
            entry.error_cnt += 1;
            entry.set_status(MessageStatus::ExecError);
        }
        self.store.save(&self.name, &entry).await?;
        Ok(true)
    }

    /// Lock a message regardless of its current status (spec §4.7's `any
    /// -> locked` diagram edge).
    pub async fn lock(&self, message_id: u64, lock_id: u64) -> NodegridResult<bool> {
        let Some(mut entry) = self.messages.get_mut(&message_id) else {
            return Ok(false);
        };
        entry.lock(lock_id);
        self.store.save(&self.name, &entry).await?;
        Ok(true)
    }

    pub async fn unlock(&self, message_id: u64) -> NodegridResult<bool> {
        let Some(mut entry) = self.messages.get_mut(&message_id) else {
            return Ok(false);
        };
        entry.unlock();
        self.store.save(&self.name, &entry).await?;
        Ok(true)
    }

    /// Force a message straight to `for_purge`, requiring a matching
    /// `lock_id` unless the message is currently unlocked (`lock_id==0`).
    pub async fn cancel(&self, message_id: u64, lock_id: u64) -> NodegridResult<bool> {
        let Some(mut entry) = self.messages.get_mut(&message_id) else {
            return Ok(false);
        };
        if entry.lock_id != 0 && entry.lock_id != lock_id {
            return Ok(false);
        }
        entry.set_status(MessageStatus::ForPurge);
        self.store.save(&self.name, &entry).await?;
        Ok(true)
    }

    pub fn peek(&self, message_id: u64) -> Option<PersistentMessage> {
        self.messages.get(&message_id).map(|e| e.clone())
    }

    pub fn peek_by_reference(&self, reference: &str) -> Option<PersistentMessage> {
        self.messages.iter().find(|e| e.value().reference.as_deref() == Some(reference)).map(|e| e.value().clone())
    }

    pub fn mlist(&self, status: Option<MessageStatus>) -> Vec<PersistentMessage> {
        self.messages
            .iter()
            .filter(|e| status.map(|s| e.value().status == s).unwrap_or(true))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Build the reply envelope for every `Handled` message with a
    /// configured reply address, and move it to `ReplySent`. There is no
    /// transport-level ack visible at this layer (concrete transports are
    /// out of scope), so a `ReplySent` message is treated as
    /// acknowledged on its next sweep and promoted straight to
    /// `ForPurge` by [`Queue::sweep_timeouts`] — a documented
    /// simplification of the original's explicit reply-ack step.
    pub async fn drain_handled(&self, own_address: &Address) -> NodegridResult<Vec<Envelope>> {
        let Some(reply_addr) = self.config.reply_addr.clone() else {
            let ids: Vec<u64> = self.messages.iter().filter(|e| e.value().status == MessageStatus::Handled).map(|e| *e.key()).collect();
            for id in ids {
                if let Some(mut entry) = self.messages.get_mut(&id) {
                    entry.set_status(MessageStatus::ForPurge);
                    self.store.save(&self.name, &entry).await?;
                }
            }
            return Ok(Vec::new());
        };

        let mut envelopes = Vec::new();
        let ids: Vec<u64> = self.messages.iter().filter(|e| e.value().status == MessageStatus::Handled).map(|e| *e.key()).collect();
        for id in ids {
            if let Some(mut entry) = self.messages.get_mut(&id) {
                let mut params = Value::map();
                let reference_or_id = entry.reference.clone().unwrap_or_else(|| entry.id.to_string());
                params.set("reference", Value::from(reference_or_id));
                params.set("exec_status", Value::Int(entry.exec_status.unwrap_or(0) as i64));
                if let Some(result) = &entry.result {
                    params.set("result", result.clone());
                }
                if let Some(error) = &entry.error {
                    params.set("error", Value::from(error.clone()));
                }
                let command = entry.reply_cmd.clone().unwrap_or_else(|| self.config.reply_cmd.clone());
                envelopes.push(Envelope::request(own_address.clone(), reply_addr.clone(), 0, command, params, 0));
                entry.set_status(MessageStatus::ReplySent);
                self.store.save(&self.name, &entry).await?;
            }
        }
        Ok(envelopes)
    }

    /// Periodic sweep: handle_timeout revert, storage_timeout purge,
    /// error retries, and `ReplySent -> ForPurge` promotion (spec §4.7
    /// "Timeouts").
    pub async fn sweep_timeouts(&self) -> NodegridResult<()> {
        let ids: Vec<u64> = self.messages.iter().map(|e| *e.key()).collect();
        for id in ids {
            let Some(mut entry) = self.messages.get_mut(&id) else { continue };
            match entry.status {
                MessageStatus::Sent if self.config.exec_addr.is_none() && entry.ms_since_update() >= self.config.handle_timeout_ms => {
                    entry.set_status(MessageStatus::Ready);
                    entry.lock_id = 0;
                    self.store.save(&self.name, &entry).await?;
                }
                MessageStatus::Ready if entry.ms_since_update() >= self.config.storage_timeout_ms => {
                    entry.set_status(MessageStatus::ForPurge);
                    self.store.save(&self.name, &entry).await?;
                }
                MessageStatus::ExecError if entry.error_cnt < self.config.error_limit && entry.ms_since_update() >= self.config.error_delay_ms => {
                    entry.set_status(MessageStatus::Ready);
                    entry.lock_id = 0;
                    self.store.save(&self.name, &entry).await?;
                }
                MessageStatus::ReplyError if entry.error_cnt < self.config.error_limit && entry.ms_since_update() >= self.config.error_delay_ms => {
                    entry.set_status(MessageStatus::Handled);
                    self.store.save(&self.name, &entry).await?;
                }
                MessageStatus::ReplySent => {
                    entry.set_status(MessageStatus::ForPurge);
                    self.store.save(&self.name, &entry).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Draw a fresh lock id, mark every `for_purge` row with it, archive
    /// (if configured) or drop it, then delete the rows (spec §4.7
    /// "Purge").
    pub async fn purge(&self) -> NodegridResult<usize> {
        let rows = self.store.select_for_purge(&self.name).await?;
        if rows.is_empty() {
            return Ok(0);
        }
        if let Some(pattern) = &self.config.archive_fname {
            archive::write_archive(&self.name, pattern, &rows).await?;
        }
        let ids: Vec<u64> = rows.iter().map(|m| m.id).collect();
        self.store.delete(&self.name, &ids).await?;
        for id in &ids {
            self.messages.remove(id);
        }
        Ok(ids.len())
    }

    pub async fn export(&self, path: &str, status: Option<MessageStatus>) -> NodegridResult<usize> {
        let rows = self.mlist(status);
        let json = serde_json::to_vec_pretty(&rows).map_err(NodegridError::Serde)?;
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(NodegridError::Io)?;
            }
        }
        tokio::fs::write(path, json).await.map_err(NodegridError::Io)?;
        Ok(rows.len())
    }

    pub async fn import(&self, path: &str) -> NodegridResult<usize> {
        let contents = tokio::fs::read_to_string(path).await.map_err(NodegridError::Io)?;
        let rows: Vec<PersistentMessage> = serde_json::from_str(&contents).map_err(NodegridError::Serde)?;
        let count = rows.len();
        let mut max_id = 0;
        for row in rows {
            max_id = max_id.max(row.id);
            self.store.save(&self.name, &row).await?;
            self.messages.insert(row.id, row);
        }
        if max_id >= self.next_id.load(Ordering::SeqCst) {
            self.next_id.store(max_id + 1, Ordering::SeqCst);
        }
        let _ = Utc::now();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryPersistentQueueStore;

    fn make_queue(config: QueueConfig) -> Queue {
        Queue::new("q", config, Arc::new(InMemoryPersistentQueueStore::new()))
    }

    #[tokio::test]
    async fn fetch_stamps_a_shared_lock_id_on_every_picked_message() {
        let q = make_queue(QueueConfig::default());
        q.put("x", Value::Null, None, None).await.unwrap();
        q.put("y", Value::Null, None, None).await.unwrap();
        let (lock_id, picked) = q.fetch(10).await.unwrap();
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|m| m.lock_id == lock_id));
        assert!(picked.iter().all(|m| m.status == MessageStatus::Sent));
    }

    #[tokio::test]
    async fn stale_lock_id_in_handled_does_not_mutate_state() {
        let q = make_queue(QueueConfig::default());
        let id = q.put("x", Value::Null, None, None).await.unwrap();
        let (lock_id, _) = q.fetch(10).await.unwrap();
        let ok = q.handled(lock_id + 1, id, 0, None, None).await.unwrap();
        assert!(!ok);
        assert_eq!(q.peek(id).unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn handled_with_exec_error_increments_error_count() {
        let q = make_queue(QueueConfig::default());
        let id = q.put("x", Value::Null, None, None).await.unwrap();
        let (lock_id, _) = q.fetch(10).await.unwrap();
        q.handled(lock_id, id, -1, None, Some("boom".into())).await.unwrap();
        let msg = q.peek(id).unwrap();
        assert_eq!(msg.status, MessageStatus::ExecError);
        assert_eq!(msg.error_cnt, 1);
    }

    #[tokio::test]
    async fn handled_with_no_reply_addr_goes_straight_to_purge_on_drain() {
        let q = make_queue(QueueConfig::default());
        let id = q.put("x", Value::Null, None, None).await.unwrap();
        let (lock_id, _) = q.fetch(10).await.unwrap();
        q.handled(lock_id, id, 0, None, None).await.unwrap();
        let own = Address::raw("q-node");
        let envelopes = q.drain_handled(&own).await.unwrap();
        assert!(envelopes.is_empty());
        assert_eq!(q.peek(id).unwrap().status, MessageStatus::ForPurge);
    }

    #[tokio::test]
    async fn purge_removes_rows_after_archiving() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = QueueConfig::default();
        config.archive_fname = Some(format!("{}/arc_*.json", dir.path().display()));
        let q = make_queue(config);
        let id = q.put("x", Value::Null, None, None).await.unwrap();
        q.cancel(id, 0).await.unwrap();
        let purged = q.purge().await.unwrap();
        assert_eq!(purged, 1);
        assert!(q.peek(id).is_none());
    }
}
