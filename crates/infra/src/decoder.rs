//! Turning raw stream payloads into tasks.
//!
//! Each stream worker is configured with one decoder. A payload the decoder
//! rejects can never succeed, so the worker logs it and acks it away.

use courier_core::{CoreError, CoreResult, Task, TaskId, TaskKind};
use courier_events::MessageId;

pub trait TaskDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> CoreResult<Task>;

    /// Decode a message read from `topic`. Payloads that carry no task id
    /// should derive one from the message so redeliveries share it.
    fn decode_message(&self, _topic: &str, _id: &MessageId, payload: &[u8]) -> CoreResult<Task> {
        self.decode(payload)
    }
}

/// Payloads are serialized [`Task`] values (what the dispatcher publishes).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTaskDecoder;

impl TaskDecoder for JsonTaskDecoder {
    fn decode(&self, payload: &[u8]) -> CoreResult<Task> {
        Task::from_bytes(payload)
    }
}

/// Smoke-sensor signal: `"1"` starts the alarm, `"0"` stops it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlarmSignalDecoder;

impl TaskDecoder for AlarmSignalDecoder {
    fn decode(&self, payload: &[u8]) -> CoreResult<Task> {
        let unexpected = |reason: String| CoreError::UnexpectedPayload {
            kind: TaskKind::SetAlarmState,
            reason,
        };
        let text = std::str::from_utf8(payload)
            .map_err(|e| unexpected(format!("not utf-8: {e}")))?;
        match text.trim() {
            "1" => Ok(Task::set_alarm_state(true)),
            "0" => Ok(Task::set_alarm_state(false)),
            other => Err(unexpected(format!("expected \"0\" or \"1\", got {other:?}"))),
        }
    }

    fn decode_message(&self, topic: &str, id: &MessageId, payload: &[u8]) -> CoreResult<Task> {
        let task = self.decode(payload)?;
        Ok(Task::with_id(
            TaskId::for_message(topic, id.as_str()),
            task.payload().clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{AlarmCommand, Payload, TicketId};
    use super::*;

    #[test]
    fn json_decoder_reads_dispatched_tasks() {
        let task = Task::issue_receipt(TicketId::new("TCK-1").unwrap());
        let decoded = JsonTaskDecoder.decode(&task.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, task);
        assert!(JsonTaskDecoder.decode(b"TCK-1").is_err());
    }

    #[test]
    fn alarm_signal_maps_zero_and_one() {
        let on = AlarmSignalDecoder.decode(b"1").unwrap();
        let off = AlarmSignalDecoder.decode(b"0\n").unwrap();
        assert_eq!(on.payload(), &Payload::SetAlarmState(AlarmCommand { on: true }));
        assert_eq!(off.payload(), &Payload::SetAlarmState(AlarmCommand { on: false }));
    }

    #[test]
    fn redelivered_alarm_signal_keeps_its_task_id() {
        let id = MessageId::new("1718000000000-0");
        let first = AlarmSignalDecoder.decode_message("smoke-sensor", &id, b"1").unwrap();
        let again = AlarmSignalDecoder.decode_message("smoke-sensor", &id, b"1").unwrap();
        let other = AlarmSignalDecoder
            .decode_message("smoke-sensor", &MessageId::new("1718000000001-0"), b"1")
            .unwrap();

        assert_eq!(first.id(), again.id());
        assert_ne!(first.id(), other.id());
        assert_eq!(first.payload(), &Payload::SetAlarmState(AlarmCommand { on: true }));
    }

    #[test]
    fn json_decoder_keeps_the_published_id() {
        let task = Task::issue_receipt(TicketId::new("TCK-1").unwrap());
        let decoded = JsonTaskDecoder
            .decode_message("issue-receipt", &MessageId::new("1-0"), &task.to_bytes().unwrap())
            .unwrap();
        assert_eq!(decoded.id(), task.id());
    }

    #[test]
    fn alarm_signal_rejects_anything_else() {
        let cases: [&[u8]; 4] = [b"2", b"", b"on", &[0xff, 0xfe]];
        for raw in cases {
            let err = AlarmSignalDecoder.decode(raw).unwrap_err();
            assert!(matches!(
                err,
                CoreError::UnexpectedPayload {
                    kind: TaskKind::SetAlarmState,
                    ..
                }
            ));
        }
    }
}
