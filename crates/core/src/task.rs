//! Task: one unit of work handed from a producer to a worker.
//!
//! A task is a **fact about intent** ("issue a receipt for TCK-1"). It is
//! immutable once created: fields are private, there are no setters, and a
//! retry re-submits a clone of the very same value (same [`TaskId`], same
//! payload, same `created_at`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::id::{TaskId, TicketId};

/// Sheet that confirmed tickets are appended to.
pub const TICKETS_TO_PRINT_SHEET: &str = "tickets-to-print";

/// Selects which processing capability handles a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    IssueReceipt,
    AppendToSheet,
    AddToNewsletter,
    SendNotification,
    SetAlarmState,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::IssueReceipt,
        TaskKind::AppendToSheet,
        TaskKind::AddToNewsletter,
        TaskKind::SendNotification,
        TaskKind::SetAlarmState,
    ];

    /// Stable name used in logs and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::IssueReceipt => "issue_receipt",
            TaskKind::AppendToSheet => "append_to_sheet",
            TaskKind::AddToNewsletter => "add_to_newsletter",
            TaskKind::SendNotification => "send_notification",
            TaskKind::SetAlarmState => "set_alarm_state",
        }
    }
}

impl core::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user record, as needed by newsletter and notification capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub email: String,
}

impl User {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
        }
    }
}

/// A row to append to a named spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRow {
    pub sheet: String,
    pub columns: Vec<String>,
}

/// Desired alarm state (`on = true` starts the alarm).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmCommand {
    pub on: bool,
}

/// Kind-specific task data.
///
/// The variant *is* the kind tag, so a task can never carry a payload that
/// disagrees with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    IssueReceipt { ticket_id: TicketId },
    AppendToSheet(SheetRow),
    AddToNewsletter(User),
    SendNotification(User),
    SetAlarmState(AlarmCommand),
}

impl Payload {
    pub fn kind(&self) -> TaskKind {
        match self {
            Payload::IssueReceipt { .. } => TaskKind::IssueReceipt,
            Payload::AppendToSheet(_) => TaskKind::AppendToSheet,
            Payload::AddToNewsletter(_) => TaskKind::AddToNewsletter,
            Payload::SendNotification(_) => TaskKind::SendNotification,
            Payload::SetAlarmState(_) => TaskKind::SetAlarmState,
        }
    }
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    payload: Payload,
    created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(payload: Payload) -> Self {
        Self::with_id(TaskId::new(), payload)
    }

    /// Create a task with an explicit id (deterministic tests, replays).
    pub fn with_id(id: TaskId, payload: Payload) -> Self {
        Self {
            id,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn issue_receipt(ticket_id: TicketId) -> Self {
        Self::new(Payload::IssueReceipt { ticket_id })
    }

    pub fn append_to_sheet(sheet: impl Into<String>, columns: Vec<String>) -> Self {
        Self::new(Payload::AppendToSheet(SheetRow {
            sheet: sheet.into(),
            columns,
        }))
    }

    pub fn add_to_newsletter(user: User) -> Self {
        Self::new(Payload::AddToNewsletter(user))
    }

    pub fn send_notification(user: User) -> Self {
        Self::new(Payload::SendNotification(user))
    }

    pub fn set_alarm_state(on: bool) -> Self {
        Self::new(Payload::SetAlarmState(AlarmCommand { on }))
    }

    /// The two independent effects of confirming a ticket: tracker append and
    /// receipt issuance.
    pub fn ticket_confirmation(ticket_id: &TicketId) -> [Task; 2] {
        [
            Task::append_to_sheet(TICKETS_TO_PRINT_SHEET, vec![ticket_id.to_string()]),
            Task::issue_receipt(ticket_id.clone()),
        ]
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Serialize for transport (JSON).
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CoreError::encoding(e.to_string()))
    }

    /// Decode a task previously produced by [`Task::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(id: &str) -> TicketId {
        TicketId::new(id).unwrap()
    }

    #[test]
    fn kind_follows_payload() {
        assert_eq!(Task::issue_receipt(ticket("TCK-1")).kind(), TaskKind::IssueReceipt);
        assert_eq!(
            Task::append_to_sheet("s", vec!["a".into()]).kind(),
            TaskKind::AppendToSheet
        );
        assert_eq!(Task::add_to_newsletter(User::new("a@b.c")).kind(), TaskKind::AddToNewsletter);
        assert_eq!(Task::send_notification(User::new("a@b.c")).kind(), TaskKind::SendNotification);
        assert_eq!(Task::set_alarm_state(true).kind(), TaskKind::SetAlarmState);
    }

    #[test]
    fn clone_keeps_identity() {
        let task = Task::issue_receipt(ticket("TCK-1"));
        let retry = task.clone();
        assert_eq!(task, retry);
        assert_eq!(task.id(), retry.id());
        assert_eq!(task.created_at(), retry.created_at());
    }

    #[test]
    fn wire_format_is_tagged_by_kind() {
        let task = Task::issue_receipt(ticket("TCK-1"));
        let json: serde_json::Value = serde_json::from_slice(&task.to_bytes().unwrap()).unwrap();

        assert_eq!(json["payload"]["kind"], "issue_receipt");
        assert_eq!(json["payload"]["data"]["ticket_id"], "TCK-1");
        assert_eq!(Task::from_bytes(&task.to_bytes().unwrap()).unwrap(), task);
    }

    #[test]
    fn from_bytes_rejects_garbage() {
        assert!(matches!(Task::from_bytes(b"TCK-1"), Err(CoreError::Encoding(_))));
        assert!(matches!(
            Task::from_bytes(br#"{"id":"0190a0e0-0000-7000-8000-000000000000","payload":{"kind":"issue_receipt","data":{"ticket_id":""}},"created_at":"2024-01-01T00:00:00Z"}"#),
            Err(CoreError::Encoding(_))
        ));
    }

    #[test]
    fn ticket_confirmation_targets_both_effects() {
        let [sheet, receipt] = Task::ticket_confirmation(&ticket("TCK-7"));

        assert_eq!(
            sheet.payload(),
            &Payload::AppendToSheet(SheetRow {
                sheet: TICKETS_TO_PRINT_SHEET.to_string(),
                columns: vec!["TCK-7".to_string()],
            })
        );
        assert_eq!(
            receipt.payload(),
            &Payload::IssueReceipt {
                ticket_id: ticket("TCK-7")
            }
        );
        assert_ne!(sheet.id(), receipt.id());
    }

    #[test]
    fn kind_names_are_stable() {
        for kind in TaskKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
