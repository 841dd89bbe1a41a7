//! Persistent message shape and its status machine, grounded in
//! `examples/original_source/libs/grd/include/grd/PersQueue.h`'s message
//! lifecycle comment and spec §3/§4.7.

use chrono::{DateTime, Utc};
use nodegrid_shared::Value;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Ready,
    Sent,
    Handled,
    ReplySent,
    ForPurge,
    ExecError,
    ReplyError,
    Locked,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Ready => "ready",
            MessageStatus::Sent => "sent",
            MessageStatus::Handled => "handled",
            MessageStatus::ReplySent => "reply_sent",
            MessageStatus::ForPurge => "for_purge",
            MessageStatus::ExecError => "exec_error",
            MessageStatus::ReplyError => "reply_error",
            MessageStatus::Locked => "locked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ready" => MessageStatus::Ready,
            "sent" => MessageStatus::Sent,
            "handled" => MessageStatus::Handled,
            "reply_sent" => MessageStatus::ReplySent,
            "for_purge" => MessageStatus::ForPurge,
            "exec_error" => MessageStatus::ExecError,
            "reply_error" => MessageStatus::ReplyError,
            "locked" => MessageStatus::Locked,
            _ => return None,
        })
    }
}

/// `{id, status, command, params, reference?, reply_cmd?, exec_status?,
/// result?, error?, error_cnt, lock_id, old_status, added_at, updated_at}`
/// per spec §3. `status` is the sole authority for scheduling decisions;
/// `lock_id` is the optimistic concurrency token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentMessage {
    pub id: u64,
    pub status: MessageStatus,
    pub command: String,
    pub params: Value,
    pub reference: Option<String>,
    pub reply_cmd: Option<String>,
    pub exec_status: Option<i32>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_cnt: u32,
    pub lock_id: u64,
    /// Status saved while `status == Locked`, so `unlock` can restore it.
    pub old_status: Option<MessageStatus>,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistentMessage {
    pub fn new(id: u64, command: impl Into<String>, params: Value, reference: Option<String>, reply_cmd: Option<String>) -> Self {
        let now = Utc::now();
        PersistentMessage {
            id,
            status: MessageStatus::Ready,
            command: command.into(),
            params,
            reference,
            reply_cmd,
            exec_status: None,
            result: None,
            error: None,
            error_cnt: 0,
            lock_id: 0,
            old_status: None,
            added_at: now,
            updated_at: now,
        }
    }

    pub fn lock(&mut self, lock_id: u64) {
        if self.status != MessageStatus::Locked {
            self.old_status = Some(self.status);
            self.status = MessageStatus::Locked;
        }
        self.lock_id = lock_id;
        self.updated_at = Utc::now();
    }

    pub fn unlock(&mut self) {
        if let Some(prior) = self.old_status.take() {
            self.status = prior;
        }
        self.updated_at = Utc::now();
    }

    pub fn set_status(&mut self, status: MessageStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn seconds_since_update(&self) -> i64 {
        (Utc::now() - self.updated_at).num_seconds()
    }

    pub fn ms_since_update(&self) -> i64 {
        (Utc::now() - self.updated_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_then_unlock_restores_prior_status() {
        let mut msg = PersistentMessage::new(1, "x", Value::Null, None, None);
        msg.set_status(MessageStatus::Sent);
        msg.lock(42);
        assert_eq!(msg.status, MessageStatus::Locked);
        assert_eq!(msg.lock_id, 42);
        msg.unlock();
        assert_eq!(msg.status, MessageStatus::Sent);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            MessageStatus::Ready,
            MessageStatus::Sent,
            MessageStatus::Handled,
            MessageStatus::ReplySent,
            MessageStatus::ForPurge,
            MessageStatus::ExecError,
            MessageStatus::ReplyError,
            MessageStatus::Locked,
        ] {
            assert_eq!(MessageStatus::parse(s.as_str()), Some(s));
        }
    }
}
