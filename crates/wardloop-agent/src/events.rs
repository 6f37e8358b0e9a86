//! Event/Session Side-Effect Layer (SPEC_FULL.md §4.G): the single call site
//! that assigns a monotonic sequence number, forwards to the caller's
//! `onEvent` callback, and mirrors best-effort into the durable `Observer`
//! log. Observer failures are logged to stderr and never abort the run —
//! only session-store failures are fatal (§7).

use chrono::Utc;
use wardloop_core::{EventEnvelope, EventKind};
use wardloop_observe::Observer;

pub struct EventSink<'a> {
    session_id: String,
    next_seq: u64,
    on_event: Option<&'a mut dyn FnMut(&EventEnvelope)>,
    observer: Option<&'a Observer>,
}

impl<'a> EventSink<'a> {
    pub fn new(
        session_id: impl Into<String>,
        on_event: Option<&'a mut dyn FnMut(&EventEnvelope)>,
        observer: Option<&'a Observer>,
    ) -> Self {
        Self { session_id: session_id.into(), next_seq: 0, on_event, observer }
    }

    /// Assign the next sequence number, forward to `onEvent`, mirror to the
    /// durable log, and return the envelope so callers can inspect what was
    /// just published (used by tests and by the orchestrator's end-of-run
    /// summary).
    pub fn publish(&mut self, kind: EventKind) -> EventEnvelope {
        let envelope =
            EventEnvelope { seq_no: self.next_seq, at: Utc::now(), session_id: self.session_id.clone(), kind };
        self.next_seq += 1;

        if let Some(cb) = self.on_event.as_mut() {
            cb(&envelope);
        }
        if let Some(observer) = self.observer {
            if let Err(err) = observer.record_event(&envelope) {
                eprintln!("[wardloop] failed to record event to observer log: {err}");
            }
        }
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wardloop_core::AgentMode;

    #[test]
    fn publish_assigns_monotonically_increasing_sequence_numbers() {
        let mut captured = Vec::new();
        let mut on_event = |e: &EventEnvelope| captured.push(e.seq_no);
        let mut sink = EventSink::new("sess-1", Some(&mut on_event), None);

        sink.publish(EventKind::Start { agent_id: "a".into(), mode: AgentMode::SingleMain, goal: "g".into() });
        sink.publish(EventKind::Complete { steps: 1, evidence_count: 0 });

        assert_eq!(captured, vec![0, 1]);
    }

    #[test]
    fn publish_stamps_the_session_id_on_every_envelope() {
        let mut sink = EventSink::new("sess-xyz", None, None);
        let envelope = sink.publish(EventKind::Complete { steps: 0, evidence_count: 0 });
        assert_eq!(envelope.session_id, "sess-xyz");
    }

    #[test]
    fn publish_works_with_no_callback_and_no_observer() {
        let mut sink = EventSink::new("sess-1", None, None);
        let envelope = sink.publish(EventKind::Complete { steps: 0, evidence_count: 0 });
        assert_eq!(envelope.seq_no, 0);
    }
}
