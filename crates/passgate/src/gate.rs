//! The interception gate: the single path from writers to the storage primitive.
//!
//! Writes to any path other than the monitored target are forwarded as-is.
//! Writes to the monitored target are copied into a private buffer, parsed
//! into candidate records, and checked record by record. One denied record
//! rejects the whole write and storage is never touched; otherwise the
//! inspected bytes are forwarded and the storage result is returned
//! unchanged.
//!
//! Each call is evaluated on its own. Nothing is shared between calls except
//! the immutable policy, target and format, so concurrent writers need no
//! locking here.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{GateConfig, GateLimits};
use crate::error::{GateError, StorageError, StorageResult};
use crate::policy::{DenyReason, PolicyDecision, PolicyHandler, Whitelist};
use crate::record::{CandidateRecord, RecordFormat};
use crate::report::{EnforcementEvent, EnforcementReporter, EventSink};
use crate::storage::WriteStorage;
use crate::target::MonitoredTarget;

/// One intercepted write attempt.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest<'a> {
    /// Path being written
    pub target: &'a str,
    /// File offset of the write
    pub offset: u64,
    /// Caller-owned bytes. Never mutated or retained by the gate.
    pub payload: &'a [u8],
}

impl<'a> WriteRequest<'a> {
    /// Describe a write of `payload` to `target` at `offset`.
    pub fn new(target: &'a str, offset: u64, payload: &'a [u8]) -> Self {
        Self {
            target,
            offset,
            payload,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Result of a write the gate let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Bytes written, as reported by storage
    pub written: usize,
    /// Whether the payload was inspected (false for non-monitored paths)
    pub inspected: bool,
}

/// A private copy of a payload, owned by the gate for one call.
#[derive(Debug)]
pub struct PayloadBuffer {
    bytes: Vec<u8>,
}

impl PayloadBuffer {
    /// Take ownership of an already-copied payload.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// The copied bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Allocates the private copy of each inspected payload.
///
/// Returning `None` means the copy could not be made; the gate then denies
/// the write.
pub trait PayloadAllocator: Send + Sync {
    /// Copy `payload` into a buffer owned by the gate.
    fn copy_in(&self, payload: &[u8]) -> Option<PayloadBuffer>;
}

/// Heap allocator with a size cap and fallible reservation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundedAllocator {
    limits: GateLimits,
}

impl BoundedAllocator {
    /// Allocator refusing payloads over `limits.max_payload_bytes`.
    pub fn new(limits: GateLimits) -> Self {
        Self { limits }
    }
}

impl PayloadAllocator for BoundedAllocator {
    fn copy_in(&self, payload: &[u8]) -> Option<PayloadBuffer> {
        if payload.len() > self.limits.max_payload_bytes {
            return None;
        }
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(payload.len()).ok()?;
        bytes.extend_from_slice(payload);
        Some(PayloadBuffer::new(bytes))
    }
}

/// Aggregate decision over every record of one payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Allow, or the first denial encountered
    #[serde(flatten)]
    pub decision: PolicyDecision,
    /// Records evaluated to reach the decision
    pub records: usize,
}

/// Evaluate `records` against `policy`. The first denied record decides.
///
/// No records at all is an allow: there is nothing to reject.
pub fn evaluate_records<'a, P, I>(policy: &P, records: I) -> Verdict
where
    P: PolicyHandler + ?Sized,
    I: IntoIterator<Item = CandidateRecord<'a>>,
{
    let mut evaluated = 0;
    for record in records {
        evaluated += 1;
        let decision = policy.evaluate(record.identity);
        if !decision.is_allowed() {
            return Verdict {
                decision,
                records: evaluated,
            };
        }
    }
    Verdict {
        decision: PolicyDecision::Allow,
        records: evaluated,
    }
}

/// Parse `payload` with `format` and evaluate it against `policy`.
pub fn evaluate_payload<P: PolicyHandler + ?Sized>(
    policy: &P,
    format: RecordFormat,
    payload: &[u8],
) -> Verdict {
    evaluate_records(policy, format.parse(payload))
}

/// Gate in front of a storage primitive, enforcing `policy` on the monitored target.
pub struct InterceptionGate<S: WriteStorage + ?Sized, P: PolicyHandler + ?Sized = Whitelist> {
    inner: Arc<S>,
    policy: Arc<P>,
    target: MonitoredTarget,
    format: RecordFormat,
    allocator: Arc<dyn PayloadAllocator>,
    reporter: EnforcementReporter,
}

impl<S: WriteStorage + ?Sized> InterceptionGate<S, Whitelist> {
    /// Build a gate from a validated config, reporting to `sink`.
    pub fn from_config(config: &GateConfig, storage: Arc<S>, sink: Arc<dyn EventSink>) -> Self {
        InterceptionGate::new(storage, Arc::new(config.whitelist()), config.target.clone())
            .with_format(config.format)
            .with_allocator(Arc::new(BoundedAllocator::new(config.limits)))
            .with_reporter(EnforcementReporter::new(sink).report_allowed(config.report_allowed))
    }
}

impl<S: WriteStorage + ?Sized, P: PolicyHandler + ?Sized> InterceptionGate<S, P> {
    /// Gate `storage` with `policy` on `target`, using default format, limits
    /// and the tracing sink.
    pub fn new(storage: Arc<S>, policy: Arc<P>, target: MonitoredTarget) -> Self {
        Self {
            inner: storage,
            policy,
            target,
            format: RecordFormat::default(),
            allocator: Arc::new(BoundedAllocator::default()),
            reporter: EnforcementReporter::default(),
        }
    }

    /// Use `format` to find records.
    pub fn with_format(mut self, format: RecordFormat) -> Self {
        self.format = format;
        self
    }

    /// Use `allocator` for payload copies.
    pub fn with_allocator(mut self, allocator: Arc<dyn PayloadAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Send enforcement events through `reporter`.
    pub fn with_reporter(mut self, reporter: EnforcementReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// The monitored target.
    pub fn target(&self) -> &MonitoredTarget {
        &self.target
    }

    /// The policy handler.
    pub fn policy(&self) -> &Arc<P> {
        &self.policy
    }

    /// The record format.
    pub fn format(&self) -> RecordFormat {
        self.format
    }

    /// Decide on `request` and, if allowed, forward it to storage.
    pub async fn intercept(&self, request: WriteRequest<'_>) -> Result<WriteOutcome, GateError> {
        if !self.target.matches(request.target) {
            let written = self
                .inner
                .write_at(request.target, request.offset, request.payload)
                .await?;
            return Ok(WriteOutcome {
                written,
                inspected: false,
            });
        }

        let Some(buffer) = self.allocator.copy_in(request.payload) else {
            tracing::warn!(
                target_path = %request.target,
                len = request.len(),
                "cannot buffer payload for inspection, denying write"
            );
            self.reporter.report(self.event(
                &request,
                0,
                PolicyDecision::deny(DenyReason::ResourceExhausted, b""),
            ));
            return Err(GateError::ResourceExhausted {
                requested: request.len(),
            });
        };

        let verdict = evaluate_payload(&*self.policy, self.format, buffer.as_bytes());
        self.reporter
            .report(self.event(&request, verdict.records, verdict.decision.clone()));

        if let PolicyDecision::Deny { reason, identity } = verdict.decision {
            tracing::warn!(
                target_path = %request.target,
                offset = request.offset,
                identity = %identity,
                reason = %reason,
                "policy denied write"
            );
            return Err(GateError::Denied {
                identity,
                reason: reason.to_string(),
            });
        }

        // The inspected copy is what lands, so the bytes checked are the bytes written.
        let written = self
            .inner
            .write_at(request.target, request.offset, buffer.as_bytes())
            .await?;
        Ok(WriteOutcome {
            written,
            inspected: true,
        })
    }

    fn event(
        &self,
        request: &WriteRequest<'_>,
        records: usize,
        decision: PolicyDecision,
    ) -> EnforcementEvent {
        EnforcementEvent {
            timestamp: SystemTime::now(),
            target: request.target.to_string(),
            offset: request.offset,
            len: request.len(),
            records,
            decision,
        }
    }
}

impl<S: WriteStorage + ?Sized, P: PolicyHandler + ?Sized> Clone for InterceptionGate<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
            target: self.target.clone(),
            format: self.format,
            allocator: Arc::clone(&self.allocator),
            reporter: self.reporter.clone(),
        }
    }
}

impl<S: WriteStorage + ?Sized, P: PolicyHandler + ?Sized> std::fmt::Debug
    for InterceptionGate<S, P>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptionGate")
            .field("target", &self.target)
            .field("format", &self.format)
            .field("reporter", &self.reporter)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: WriteStorage + ?Sized + 'static, P: PolicyHandler + ?Sized + 'static> WriteStorage
    for InterceptionGate<S, P>
{
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> StorageResult<usize> {
        match self.intercept(WriteRequest::new(path, offset, data)).await {
            Ok(outcome) => Ok(outcome.written),
            Err(GateError::Storage(e)) => Err(e),
            Err(denied) => Err(StorageError::PermissionDenied(denied.to_string())),
        }
    }

    async fn set_size(&self, path: &str, size: u64) -> StorageResult<()> {
        // Truncating removes records and extending pads with NULs; neither can add one.
        self.inner.set_size(path, size).await
    }

    async fn size(&self, path: &str) -> StorageResult<u64> {
        self.inner.size(path).await
    }
}
