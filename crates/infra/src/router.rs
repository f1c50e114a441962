//! Kind-based routing from a task to the capability that fulfils it.

use std::sync::Arc;

use thiserror::Error;

use courier_core::{
    AlarmClient, CapabilityError, NewsletterClient, NotificationClient, Payload, ReceiptIssuer,
    SheetAppender, Task, TaskKind,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The capability was called and failed; the task should be retried.
    #[error("{kind} failed: {source}")]
    Capability {
        kind: TaskKind,
        #[source]
        source: CapabilityError,
    },

    /// No capability is wired for this kind; retrying cannot help.
    #[error("no capability registered for {0}")]
    Unroutable(TaskKind),
}

impl ProcessError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessError::Capability { .. })
    }
}

/// Processes one task synchronously.
pub trait TaskProcessor: Send + Sync {
    fn process(&self, task: &Task) -> Result<(), ProcessError>;
}

impl<P> TaskProcessor for Arc<P>
where
    P: TaskProcessor + ?Sized,
{
    fn process(&self, task: &Task) -> Result<(), ProcessError> {
        (**self).process(task)
    }
}

/// Routes each task kind to its capability.
///
/// Built once at startup; unset capabilities make their kinds unroutable.
#[derive(Clone, Default)]
pub struct CapabilityRouter {
    receipts: Option<Arc<dyn ReceiptIssuer>>,
    sheets: Option<Arc<dyn SheetAppender>>,
    newsletter: Option<Arc<dyn NewsletterClient>>,
    notifications: Option<Arc<dyn NotificationClient>>,
    alarm: Option<Arc<dyn AlarmClient>>,
}

impl CapabilityRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_receipts(mut self, receipts: Arc<dyn ReceiptIssuer>) -> Self {
        self.receipts = Some(receipts);
        self
    }

    pub fn with_sheets(mut self, sheets: Arc<dyn SheetAppender>) -> Self {
        self.sheets = Some(sheets);
        self
    }

    pub fn with_newsletter(mut self, newsletter: Arc<dyn NewsletterClient>) -> Self {
        self.newsletter = Some(newsletter);
        self
    }

    pub fn with_notifications(mut self, notifications: Arc<dyn NotificationClient>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub fn with_alarm(mut self, alarm: Arc<dyn AlarmClient>) -> Self {
        self.alarm = Some(alarm);
        self
    }

    pub fn handles(&self, kind: TaskKind) -> bool {
        match kind {
            TaskKind::IssueReceipt => self.receipts.is_some(),
            TaskKind::AppendToSheet => self.sheets.is_some(),
            TaskKind::AddToNewsletter => self.newsletter.is_some(),
            TaskKind::SendNotification => self.notifications.is_some(),
            TaskKind::SetAlarmState => self.alarm.is_some(),
        }
    }

    /// Kinds this router can process.
    pub fn routes(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|k| self.handles(*k))
            .collect()
    }
}

impl std::fmt::Debug for CapabilityRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRouter")
            .field("routes", &self.routes())
            .finish()
    }
}

impl TaskProcessor for CapabilityRouter {
    fn process(&self, task: &Task) -> Result<(), ProcessError> {
        let kind = task.kind();
        let result = match task.payload() {
            Payload::IssueReceipt { ticket_id } => self
                .receipts
                .as_ref()
                .map(|c| c.issue_receipt(ticket_id)),
            Payload::AppendToSheet(row) => self
                .sheets
                .as_ref()
                .map(|c| c.append_row(&row.sheet, &row.columns)),
            Payload::AddToNewsletter(user) => {
                self.newsletter.as_ref().map(|c| c.add_to_newsletter(user))
            }
            Payload::SendNotification(user) => {
                self.notifications.as_ref().map(|c| c.send_notification(user))
            }
            Payload::SetAlarmState(cmd) => self.alarm.as_ref().map(|c| c.set_alarm_state(cmd.on)),
        };

        match result {
            None => Err(ProcessError::Unroutable(kind)),
            Some(r) => r.map_err(|source| ProcessError::Capability { kind, source }),
        }
    }
}

/// Human-readable confirmation logged after a task succeeds.
pub fn confirmation(task: &Task) -> String {
    match task.payload() {
        Payload::IssueReceipt { ticket_id } => format!("receipt issued for ticket {ticket_id}"),
        Payload::AppendToSheet(row) => {
            format!("row [{}] appended to sheet {}", row.columns.join(", "), row.sheet)
        }
        Payload::AddToNewsletter(user) => format!("user {} added to newsletter", user.email),
        Payload::SendNotification(user) => format!("user {} notified", user.email),
        Payload::SetAlarmState(cmd) if cmd.on => "alarm started".to_string(),
        Payload::SetAlarmState(_) => "alarm stopped".to_string(),
    }
}
