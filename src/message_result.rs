use crate::protocol::{Phase, Status};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counts of edits applied to a message at end-of-message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EditCounts {
    pub added_headers: u32,
    pub changed_headers: u32,
    pub removed_headers: u32,
    pub added_recipients: u32,
    pub removed_recipients: u32,
    pub replaced_body_bytes: u64,
    pub changed_from: bool,
    pub quarantined: bool,
}

/// What happened to one message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageResult {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub from: Option<String>,
    pub recipients: Vec<String>,
    pub rejected_recipients: Vec<String>,
    pub temporary_failed_recipients: Vec<String>,
    pub header_count: u32,
    pub body_size: u64,
    pub state: Phase,
    pub status: Status,
    pub edits: EditCounts,
}

impl MessageResult {
    pub fn new() -> Self {
        MessageResult {
            start_time: Utc::now(),
            end_time: None,
            from: None,
            recipients: Vec::new(),
            rejected_recipients: Vec::new(),
            temporary_failed_recipients: Vec::new(),
            header_count: 0,
            body_size: 0,
            state: Phase::EnvelopeFrom,
            status: Status::NotChange,
            edits: EditCounts::default(),
        }
    }

    /// Records the verdict for the latest recipient.
    pub fn recipient_status(&mut self, status: Status) {
        let Some(recipient) = self.recipients.last().cloned() else {
            return;
        };
        match status {
            Status::Reject | Status::Discard => {
                self.recipients.pop();
                self.rejected_recipients.push(recipient);
            }
            Status::TemporaryFailure => {
                self.recipients.pop();
                self.temporary_failed_recipients.push(recipient);
            }
            _ => {}
        }
    }

    pub fn close(&mut self, state: Phase, status: Status) {
        self.end_time = Some(Utc::now());
        self.state = state;
        self.status = status;
    }

    pub fn elapsed_ms(&self) -> i64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds()
    }
}

impl Default for MessageResult {
    fn default() -> Self {
        Self::new()
    }
}
