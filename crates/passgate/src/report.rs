//! Enforcement events and the sinks that receive them.
//!
//! The gate hands every decision on a monitored write to an
//! [`EnforcementReporter`]. The reporter forwards it to an [`EventSink`] and
//! swallows sink failures: a broken sink never changes whether a write lands.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::SinkError;
use crate::policy::PolicyDecision;

/// One decision on one write to the monitored file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementEvent {
    /// When the decision was made
    #[serde(with = "system_time_ms")]
    pub timestamp: SystemTime,
    /// Path the write was aimed at
    pub target: String,
    /// File offset of the write
    pub offset: u64,
    /// Payload length in bytes
    pub len: usize,
    /// Candidate records evaluated before the decision was reached
    pub records: usize,
    /// The aggregate decision, including the offending identity on denial
    #[serde(flatten)]
    pub decision: PolicyDecision,
}

impl EnforcementEvent {
    /// Returns true if this event records a rejected write.
    pub fn is_denial(&self) -> bool {
        !self.decision.is_allowed()
    }
}

/// Helper for serializing a timestamp as milliseconds since the Unix epoch
mod system_time_ms {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        u64::try_from(ms).unwrap_or(u64::MAX).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_millis(ms))
    }
}

/// The external collaborator that stores or ships enforcement events.
pub trait EventSink: Send + Sync {
    /// Accept one event.
    fn accept(&self, event: &EnforcementEvent) -> Result<(), SinkError>;
}

/// Sink that emits events as structured `tracing` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn accept(&self, event: &EnforcementEvent) -> Result<(), SinkError> {
        match &event.decision {
            PolicyDecision::Allow => tracing::debug!(
                target: "passgate::enforcement",
                decision = "allow",
                target_path = %event.target,
                offset = event.offset,
                len = event.len,
                records = event.records,
                "write allowed"
            ),
            PolicyDecision::Deny { reason, identity } => tracing::warn!(
                target: "passgate::enforcement",
                decision = "deny",
                target_path = %event.target,
                offset = event.offset,
                len = event.len,
                records = event.records,
                identity = %identity,
                reason = %reason,
                "write denied"
            ),
        }
        Ok(())
    }
}

/// Sink that writes one JSON object per line to a writer.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Create a sink writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> std::fmt::Debug for JsonLinesSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesSink").finish_non_exhaustive()
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn accept(&self, event: &EnforcementEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| SinkError::Unavailable("writer lock poisoned".to_string()))?;
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

/// Sink that keeps events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<EnforcementEvent>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far, oldest first.
    pub fn events(&self) -> Vec<EnforcementEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of events received so far.
    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Returns true if no event has been received.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn accept(&self, event: &EnforcementEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .map_err(|_| SinkError::Unavailable("event buffer poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn accept(&self, event: &EnforcementEvent) -> Result<(), SinkError> {
        (**self).accept(event)
    }
}

/// Forwards enforcement events to a sink without ever failing the caller.
#[derive(Clone)]
pub struct EnforcementReporter {
    sink: Arc<dyn EventSink>,
    report_allowed: bool,
}

impl EnforcementReporter {
    /// Report every decision to `sink`.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            report_allowed: true,
        }
    }

    /// Choose whether allowed writes are reported. Denials always are.
    pub fn report_allowed(mut self, report_allowed: bool) -> Self {
        self.report_allowed = report_allowed;
        self
    }

    /// Hand `event` to the sink. Sink failures are logged and dropped.
    pub fn report(&self, event: EnforcementEvent) {
        if event.decision.is_allowed() && !self.report_allowed {
            return;
        }
        if let Err(e) = self.sink.accept(&event) {
            tracing::warn!(
                error = %e,
                target_path = %event.target,
                denied = event.is_denial(),
                "enforcement event dropped"
            );
        }
    }
}

impl Default for EnforcementReporter {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl std::fmt::Debug for EnforcementReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnforcementReporter")
            .field("report_allowed", &self.report_allowed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::policy::DenyReason;
    use std::time::{Duration, UNIX_EPOCH};

    fn event(decision: PolicyDecision) -> EnforcementEvent {
        EnforcementEvent {
            timestamp: UNIX_EPOCH + Duration::from_millis(1_700_000_000_123),
            target: "/etc/passwd".to_string(),
            offset: 42,
            len: 46,
            records: 1,
            decision,
        }
    }

    fn denial() -> EnforcementEvent {
        event(PolicyDecision::deny(DenyReason::NotWhitelisted, b"mallory"))
    }

    struct BrokenSink;

    impl EventSink for BrokenSink {
        fn accept(&self, _event: &EnforcementEvent) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("collector offline".to_string()))
        }
    }

    #[test]
    fn test_memory_sink_records_events() {
        let sink = Arc::new(MemorySink::new());
        let reporter = EnforcementReporter::new(sink.clone());
        reporter.report(denial());
        reporter.report(event(PolicyDecision::Allow));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_denial());
        assert_eq!(events[0].decision.offending_identity(), Some("mallory"));
        assert!(!events[1].is_denial());
    }

    #[test]
    fn test_allowed_events_can_be_suppressed() {
        let sink = Arc::new(MemorySink::new());
        let reporter = EnforcementReporter::new(sink.clone()).report_allowed(false);
        reporter.report(event(PolicyDecision::Allow));
        assert!(sink.is_empty());

        reporter.report(denial());
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_broken_sink_is_swallowed() {
        let reporter = EnforcementReporter::new(Arc::new(BrokenSink));
        // Must not panic or propagate.
        reporter.report(denial());
        reporter.report(event(PolicyDecision::Allow));
    }

    #[test]
    fn test_tracing_sink_accepts() {
        assert!(TracingSink.accept(&denial()).is_ok());
        assert!(TracingSink.accept(&event(PolicyDecision::Allow)).is_ok());
    }

    #[test]
    fn test_json_lines_format() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.accept(&denial()).unwrap();
        sink.accept(&event(PolicyDecision::Allow)).unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(
            first,
            serde_json::json!({
                "timestamp": 1_700_000_000_123u64,
                "target": "/etc/passwd",
                "offset": 42,
                "len": 46,
                "records": 1,
                "decision": "deny",
                "reason": "not_whitelisted",
                "identity": "mallory",
            })
        );

        let second: EnforcementEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second, event(PolicyDecision::Allow));
    }
}
