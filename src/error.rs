//! Error types for every stage of a proxy session.
//!
//! Each component reports its own enum so callers can tell validation
//! failures (nothing touched yet) from spawn and runtime failures.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while parsing a node link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The scheme is recognized syntax but not a protocol we can drive.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// A structural part of the link is missing or unreadable.
    #[error("malformed link ({segment}): {reason}")]
    MalformedLink {
        segment: &'static str,
        reason: String,
    },
}

impl LinkError {
    pub(crate) fn malformed(segment: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedLink {
            segment,
            reason: reason.into(),
        }
    }
}

/// Errors produced while building the engine document.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("node link: {0}")]
    Link(#[from] LinkError),

    #[error("unsupported outbound protocol: {0}")]
    UnsupportedOutboundProtocol(String),

    #[error("unsupported transport type: {0:?}")]
    UnsupportedTransportType(String),

    #[error("unsupported security type: {0:?}")]
    UnsupportedSecurityType(String),

    /// A routing rule has no matcher besides its outbound tag.
    #[error("routing rule {tag:?}: {reason}")]
    InvalidRule { tag: String, reason: String },

    #[error("failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors produced while launching the engine process.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("engine executable not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The OS refused to execute the file (permissions, quarantine,
    /// code signing). Callers should point the user at the OS security
    /// settings instead of showing a generic failure.
    #[error("engine executable is not permitted to run: {}", .0.display())]
    NotExecutable(PathBuf),

    #[error("failed to spawn engine: {0}")]
    Io(#[from] std::io::Error),
}

/// A single proxy tool invocation that failed or printed something we
/// could not read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{command}` failed: {reason}")]
pub struct ProxyCommandError {
    pub command: String,
    pub reason: String,
}

/// Errors produced while loading or saving settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("settings file {} is not valid: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("could not resolve a home directory for raybar")]
    NoHome,
}

/// The stage of a session start at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Build,
    Persist,
    Spawn,
    Apply,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Build => "build",
            Self::Persist => "persist",
            Self::Spawn => "spawn",
            Self::Apply => "apply",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned synchronously by the session orchestrator.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("engine executable path is not set")]
    MissingExecutable,

    #[error("no outbound node is selected")]
    MissingNode,

    #[error("invalid session config: {0}")]
    InvalidConfig(String),

    #[error("engine check failed: {0}")]
    Executable(#[source] SpawnError),

    #[error("failed to build engine config: {0}")]
    Build(#[from] BuildError),

    #[error("failed to write engine config to {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start engine: {0}")]
    Spawn(#[source] SpawnError),

    /// The system proxy could not be changed on any interface.
    #[error("system proxy was not applied: {0}")]
    Apply(String),
}

impl SessionError {
    /// Returns the stage at which the session start failed.
    pub fn stage(&self) -> Stage {
        match self {
            Self::MissingExecutable
            | Self::MissingNode
            | Self::InvalidConfig(_)
            | Self::Executable(_) => Stage::Validate,
            Self::Build(_) => Stage::Build,
            Self::Persist { .. } => Stage::Persist,
            Self::Spawn(_) => Stage::Spawn,
            Self::Apply(_) => Stage::Apply,
        }
    }

    /// True when the user can fix the failure by allowing the engine to
    /// run in the OS security settings.
    pub fn needs_permission(&self) -> bool {
        matches!(
            self,
            Self::Executable(SpawnError::NotExecutable(_)) | Self::Spawn(SpawnError::NotExecutable(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_for_each_error() {
        assert_eq!(SessionError::MissingExecutable.stage(), Stage::Validate);
        assert_eq!(SessionError::MissingNode.stage(), Stage::Validate);
        assert_eq!(
            SessionError::Build(BuildError::UnsupportedSecurityType("x".into())).stage(),
            Stage::Build
        );
        assert_eq!(
            SessionError::Spawn(SpawnError::NotFound("/x".into())).stage(),
            Stage::Spawn
        );
        assert_eq!(SessionError::Apply("none".into()).stage(), Stage::Apply);
    }

    #[test]
    fn test_needs_permission() {
        let err = SessionError::Spawn(SpawnError::NotExecutable("/bin/xray".into()));
        assert!(err.needs_permission());
        let err = SessionError::Spawn(SpawnError::NotFound("/bin/xray".into()));
        assert!(!err.needs_permission());
    }

    #[test]
    fn test_link_error_message_names_segment() {
        let err = LinkError::malformed("identity", "missing '@'");
        assert_eq!(err.to_string(), "malformed link (identity): missing '@'");
    }
}
