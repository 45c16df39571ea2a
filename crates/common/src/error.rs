//! Error types for Meshplane

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using Meshplane Error
pub type Result<T> = std::result::Result<T, Error>;

/// Resource category that references a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkedResource {
    Route,
    NameServerGroup,
    Policy,
    SetupKey,
    User,
    NetworkRouter,
    DnsSettings,
}

impl LinkedResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Route => "route",
            Self::NameServerGroup => "name server groups",
            Self::Policy => "policy",
            Self::SetupKey => "setup key",
            Self::User => "user",
            Self::NetworkRouter => "network router",
            Self::DnsSettings => "dns settings",
        }
    }
}

impl std::fmt::Display for LinkedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group deletion blocked by a resource still pointing at it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("group has been linked to {resource}: {name}")]
pub struct GroupLinkError {
    /// Category of the referencing resource
    pub resource: LinkedResource,
    /// Name (or ID when unnamed) of the referencing resource
    pub name: String,
}

/// Meshplane error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed input, no state was changed
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Linked(#[from] GroupLinkError),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{kind}: {id} not found")]
    NotFound { kind: String, id: String },

    #[error("{kind}: {id} already exists")]
    AlreadyExists { kind: String, id: String },

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Error::PermissionDenied(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Referencing category when this is a link error
    pub fn linked_resource(&self) -> Option<LinkedResource> {
        match self {
            Error::Linked(e) => Some(e.resource),
            _ => None,
        }
    }
}

/// Failure of one item inside a batch operation
#[derive(Debug)]
pub struct ItemError {
    pub id: String,
    pub error: Error,
}

/// Aggregate of per-item failures for multi-ID operations.
///
/// Items are kept in the order they were processed. An empty batch is
/// success, see [`BatchError::into_result`].
#[derive(Debug, Default)]
pub struct BatchError {
    pub errors: Vec<ItemError>,
}

impl BatchError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: impl Into<String>, error: Error) {
        self.errors.push(ItemError {
            id: id.into(),
            error,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemError> {
        self.errors.iter()
    }

    /// Failed item IDs in processing order
    pub fn failed_ids(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.id.as_str()).collect()
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Batch(self))
        }
    }
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} item(s) failed", self.errors.len())?;
        for (i, item) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}: {}", sep, item.id, item.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}
