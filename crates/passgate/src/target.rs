//! The monitored file whose writes are policed.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Identifies the monitored file.
///
/// Matching is lexical: `.` components and repeated separators are ignored,
/// so `/etc/./passwd` and `//etc/passwd` are the same file as `/etc/passwd`.
/// A path whose file can't be known without the filesystem (one containing
/// `..`, or a relative path against an absolute target) always matches, so
/// its payload is inspected rather than waved through.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoredTarget {
    /// Exactly this path
    Path(String),
    /// Any path whose final component is this name (e.g. `passwd`)
    FileName(String),
    /// Any path matching this glob pattern
    Pattern(#[serde(with = "glob_pattern")] glob::Pattern),
}

impl Default for MonitoredTarget {
    fn default() -> Self {
        MonitoredTarget::Path("/etc/passwd".to_string())
    }
}

impl MonitoredTarget {
    /// Monitor exactly `path`.
    pub fn path(path: impl Into<String>) -> Self {
        MonitoredTarget::Path(path.into())
    }

    /// Monitor every file named `name`.
    pub fn file_name(name: impl Into<String>) -> Self {
        MonitoredTarget::FileName(name.into())
    }

    /// Monitor every path matching the glob `pattern`.
    pub fn pattern(pattern: &str) -> Result<Self, ConfigError> {
        glob::Pattern::new(pattern)
            .map(MonitoredTarget::Pattern)
            .map_err(|e| ConfigError::InvalidTarget(format!("{pattern}: {e}")))
    }

    /// Returns true if a write to `path` must pass the policy.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            MonitoredTarget::Path(p) => {
                let target = Lexical::new(p);
                let candidate = Lexical::new(path);
                candidate.is_ambiguous(target.absolute) || candidate.parts == target.parts
            }
            MonitoredTarget::FileName(name) => {
                Path::new(path).file_name() == Some(OsStr::new(name))
            }
            MonitoredTarget::Pattern(pattern) => {
                let candidate = Lexical::new(path);
                let anchored = pattern.as_str().starts_with('/');
                candidate.climbs
                    || (anchored && !candidate.absolute)
                    || pattern.matches_path(&candidate.to_path_buf())
            }
        }
    }

    /// Reject targets that could never match anything meaningful.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            MonitoredTarget::Path(p) if p.is_empty() => {
                Err(ConfigError::InvalidTarget("empty path".to_string()))
            }
            MonitoredTarget::Path(p) if Lexical::new(p).is_ambiguous(true) => Err(
                ConfigError::InvalidTarget(format!("path must be absolute without `..`, got {p:?}")),
            ),
            MonitoredTarget::FileName(name) if name.is_empty() || name.contains('/') => {
                Err(ConfigError::InvalidTarget(format!(
                    "file name must be a single non-empty component, got {name:?}"
                )))
            }
            MonitoredTarget::Pattern(pattern) if pattern.as_str().is_empty() => {
                Err(ConfigError::InvalidTarget("empty pattern".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// A path split into its named components.
struct Lexical<'a> {
    absolute: bool,
    climbs: bool,
    parts: Vec<&'a OsStr>,
}

impl<'a> Lexical<'a> {
    fn new(path: &'a str) -> Self {
        let mut lexical = Lexical {
            absolute: false,
            climbs: false,
            parts: Vec::new(),
        };
        for component in Path::new(path).components() {
            match component {
                Component::Prefix(_) | Component::RootDir => lexical.absolute = true,
                Component::CurDir => {}
                Component::ParentDir => lexical.climbs = true,
                Component::Normal(part) => lexical.parts.push(part),
            }
        }
        lexical
    }

    /// True if the file this path names can't be compared lexically with a
    /// target that is absolute when `target_absolute` is set.
    fn is_ambiguous(&self, target_absolute: bool) -> bool {
        self.climbs || self.absolute != target_absolute
    }

    fn to_path_buf(&self) -> PathBuf {
        let mut path = if self.absolute {
            PathBuf::from("/")
        } else {
            PathBuf::new()
        };
        path.extend(self.parts.iter().copied());
        path
    }
}

impl fmt::Display for MonitoredTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitoredTarget::Path(p) => f.write_str(p),
            MonitoredTarget::FileName(name) => write!(f, "*/{name}"),
            MonitoredTarget::Pattern(pattern) => f.write_str(pattern.as_str()),
        }
    }
}

/// Helper for serializing a glob pattern as its source string
mod glob_pattern {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(pattern: &glob::Pattern, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(pattern.as_str())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<glob::Pattern, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        glob::Pattern::new(&s).map_err(D::Error::custom)
    }
}
