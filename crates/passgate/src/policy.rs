//! Identity policy: which account names may appear in the monitored file.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a record was denied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The identity is not on the whitelist
    NotWhitelisted,
    /// The identity field is empty
    EmptyIdentity,
    /// The payload could not be buffered for inspection
    ResourceExhausted,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DenyReason::NotWhitelisted => "identity is not whitelisted",
            DenyReason::EmptyIdentity => "empty identity field",
            DenyReason::ResourceExhausted => "resource exhausted",
        })
    }
}

/// The result of a policy check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PolicyDecision {
    /// The record is allowed.
    Allow,
    /// The record is denied.
    Deny {
        /// Why it was denied.
        reason: DenyReason,
        /// The offending identity, lossily decoded. Empty when none applies.
        identity: String,
    },
}

impl PolicyDecision {
    /// Deny `identity` for `reason`.
    pub fn deny(reason: DenyReason, identity: &[u8]) -> Self {
        PolicyDecision::Deny {
            reason,
            identity: String::from_utf8_lossy(identity).into_owned(),
        }
    }

    /// Returns true if the record is allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }

    /// Returns the denial reason if denied, None if allowed.
    pub fn denial_reason(&self) -> Option<DenyReason> {
        match self {
            PolicyDecision::Allow => None,
            PolicyDecision::Deny { reason, .. } => Some(*reason),
        }
    }

    /// Returns the offending identity if denied.
    pub fn offending_identity(&self) -> Option<&str> {
        match self {
            PolicyDecision::Allow => None,
            PolicyDecision::Deny { identity, .. } => Some(identity),
        }
    }
}

/// Trait for policies deciding whether an identity may be persisted.
///
/// Implementations must be pure: the same identity always yields the same
/// decision, and checks never block. They run on every record of every write
/// to the monitored file.
pub trait PolicyHandler: Send + Sync {
    /// Decide whether `identity` (the leading field of a record) is allowed.
    fn evaluate(&self, identity: &[u8]) -> PolicyDecision;
}

// Implement PolicyHandler for Arc<dyn PolicyHandler> to allow dynamic dispatch
impl PolicyHandler for std::sync::Arc<dyn PolicyHandler> {
    fn evaluate(&self, identity: &[u8]) -> PolicyDecision {
        (**self).evaluate(identity)
    }
}

/// A fixed set of permitted identities.
///
/// Matching is exact and byte-for-byte: `operator2` does not match
/// `operator`, and neither does `operator ` or `Operator`.
#[derive(Clone, PartialEq, Eq)]
pub struct Whitelist {
    identities: Box<[Box<[u8]>]>,
}

impl Whitelist {
    /// A whitelist admitting exactly one identity.
    pub fn single(identity: impl AsRef<[u8]>) -> Self {
        Self::new([identity])
    }

    /// A whitelist admitting each of `identities`.
    pub fn new<I, T>(identities: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        Self {
            identities: identities
                .into_iter()
                .map(|id| Box::from(id.as_ref()))
                .collect(),
        }
    }

    /// Returns true if `identity` is exactly one of the permitted identities.
    pub fn contains(&self, identity: &[u8]) -> bool {
        // Slice equality compares lengths first, so prefixes never match.
        self.identities.iter().any(|id| **id == *identity)
    }

    /// Number of permitted identities.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Returns true if nothing is permitted.
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Iterate over the permitted identities.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.identities.iter().map(|id| &**id)
    }
}

impl fmt::Debug for Whitelist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(String::from_utf8_lossy))
            .finish()
    }
}

impl PolicyHandler for Whitelist {
    fn evaluate(&self, identity: &[u8]) -> PolicyDecision {
        if identity.is_empty() {
            PolicyDecision::deny(DenyReason::EmptyIdentity, identity)
        } else if self.contains(identity) {
            PolicyDecision::Allow
        } else {
            PolicyDecision::deny(DenyReason::NotWhitelisted, identity)
        }
    }
}
