//! One-time installation of the gate in front of the storage primitive.
//!
//! [`install`] takes ownership of the storage, so once it returns nothing
//! outside the gate can reach the storage directly. It succeeds at most
//! once per process. The returned [`InterceptionHandle`] has no uninstall,
//! release or accessor for the raw storage: the gate stays in place for the
//! life of the process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::GateConfig;
use crate::error::{GateError, InstallError, StorageResult};
use crate::gate::{InterceptionGate, WriteOutcome, WriteRequest};
use crate::report::EventSink;
use crate::storage::WriteStorage;
use crate::target::MonitoredTarget;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Capability for writing through the installed gate.
///
/// Cloning shares the same gate.
pub struct InterceptionHandle<S: WriteStorage + 'static> {
    gate: Arc<InterceptionGate<S>>,
}

/// Install the gate described by `config` in front of `storage`.
///
/// The config is validated first; an invalid config does not use up the
/// installation. Any call after a successful install returns
/// [`InstallError::AlreadyInstalled`].
pub fn install<S: WriteStorage + 'static>(
    config: GateConfig,
    storage: S,
    sink: Arc<dyn EventSink>,
) -> Result<InterceptionHandle<S>, InstallError> {
    config.validate()?;
    if INSTALLED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(InstallError::AlreadyInstalled);
    }

    let gate = InterceptionGate::from_config(&config, Arc::new(storage), sink);
    tracing::info!(
        target_path = %config.target,
        whitelist = ?config.whitelist,
        report_allowed = config.report_allowed,
        "interception gate installed"
    );
    Ok(InterceptionHandle {
        gate: Arc::new(gate),
    })
}

/// Returns true once a gate has been installed in this process.
pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::SeqCst)
}

impl<S: WriteStorage + 'static> InterceptionHandle<S> {
    /// Write `payload` to `target` at `offset` through the gate.
    pub async fn write(
        &self,
        target: &str,
        offset: u64,
        payload: &[u8],
    ) -> Result<WriteOutcome, GateError> {
        self.gate
            .intercept(WriteRequest::new(target, offset, payload))
            .await
    }

    /// Submit a prepared request to the gate.
    pub async fn intercept(&self, request: WriteRequest<'_>) -> Result<WriteOutcome, GateError> {
        self.gate.intercept(request).await
    }

    /// Read through to storage.
    pub async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        self.gate.read(path).await
    }

    /// The monitored target.
    pub fn target(&self) -> &MonitoredTarget {
        self.gate.target()
    }

    /// The gate as a storage, for code that expects a [`WriteStorage`].
    pub fn storage(&self) -> Arc<dyn WriteStorage> {
        Arc::clone(&self.gate) as Arc<dyn WriteStorage>
    }
}

impl<S: WriteStorage + 'static> Clone for InterceptionHandle<S> {
    fn clone(&self) -> Self {
        Self {
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<S: WriteStorage + 'static> std::fmt::Debug for InterceptionHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptionHandle")
            .field("gate", &self.gate)
            .finish()
    }
}
