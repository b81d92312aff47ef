//! Passgate: write-path gate for an account registry
//!
//! Passgate sits between writers and the storage primitive and keeps one
//! invariant over a monitored account file (typically `/etc/passwd`): no
//! account other than the whitelisted identities is ever persisted to it.
//!
//! Every write to the monitored file is copied, split into `name:...`
//! records and checked against the whitelist before it reaches storage. A
//! single unlisted record rejects the entire write with `EPERM`; nothing of
//! it lands. Writes to other files pass straight through.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use passgate::{GateConfig, FsStorage, TracingSink, install};
//!
//! let handle = install(GateConfig::default(), FsStorage::new(), Arc::new(TracingSink))?;
//! handle.write("/etc/passwd", offset, b"operator:x:1000:1000::/home/operator:/bin/bash\n").await?;
//! ```

mod config;
mod error;
mod gate;
mod install;
mod policy;
mod record;
mod report;
mod storage;
mod target;

pub use config::{GateConfig, GateLimits};
pub use error::{
    ConfigError, GateError, InstallError, SinkError, StorageError, StorageResult,
};
pub use gate::{
    BoundedAllocator, InterceptionGate, PayloadAllocator, PayloadBuffer, Verdict, WriteOutcome,
    WriteRequest, evaluate_payload, evaluate_records,
};
pub use install::{InterceptionHandle, install, is_installed};
pub use policy::{DenyReason, PolicyDecision, PolicyHandler, Whitelist};
pub use record::{CandidateRecord, RecordFormat, Records, parse};
pub use report::{
    EnforcementEvent, EnforcementReporter, EventSink, JsonLinesSink, MemorySink, TracingSink,
};
pub use storage::{FsStorage, InMemoryStorage, WriteStorage};
pub use target::MonitoredTarget;
