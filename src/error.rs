// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Everything that can go wrong while checking, applying, transforming, or
//! committing an operation. Each variant has a stable machine-readable code
//! that travels over the wire in an [`ErrorEnvelope`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OtError {
    #[error("operation is badly formed: {0}")]
    BadlyFormed(String),

    #[error("type '{0}' is not registered")]
    TypeNotRecognized(String),

    #[error("document was already created")]
    AlreadyCreated,

    #[error("document does not exist")]
    DoesNotExist,

    #[error("document was deleted")]
    WasDeleted,

    #[error("operation has no edit payload")]
    OpNotProvided,

    #[error("op version {op} does not match snapshot version {snapshot}")]
    VersionMismatchOnApply { op: u64, snapshot: u64 },

    #[error("op versions {op} and {applied} do not match")]
    VersionMismatchOnTransform { op: u64, applied: u64 },

    #[error("operation was already submitted")]
    OpAlreadySubmitted,

    #[error("missing ops needed to transform from version {from} to version {to}")]
    TransformOpsNotFound { from: u64, to: u64 },

    #[error("commit conflicted {0} times, giving up")]
    MaxSubmitRetriesExceeded(u32),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("type '{0}' does not support compose")]
    ComposeNotSupported(&'static str),

    #[error("type '{0}' does not support invert")]
    InvertNotSupported(&'static str),

    /// An error reported by the server for an op this client submitted.
    #[error("{}: {}", .0.code, .0.message)]
    Server(ErrorEnvelope),
}

impl OtError {
    /// The stable machine-readable code for this error.
    pub fn code(&self) -> &str {
        match self {
            Self::BadlyFormed(_) => "BadlyFormed",
            Self::TypeNotRecognized(_) => "TypeNotRecognized",
            Self::AlreadyCreated => "AlreadyCreated",
            Self::DoesNotExist => "DoesNotExist",
            Self::WasDeleted => "WasDeleted",
            Self::OpNotProvided => "OpNotProvided",
            Self::VersionMismatchOnApply { .. } => "VersionMismatchOnApply",
            Self::VersionMismatchOnTransform { .. } => "VersionMismatchOnTransform",
            Self::OpAlreadySubmitted => "OpAlreadySubmitted",
            Self::TransformOpsNotFound { .. } => "TransformOpsNotFound",
            Self::MaxSubmitRetriesExceeded(_) => "MaxSubmitRetriesExceeded",
            Self::ConnectionClosed => "ConnectionClosed",
            Self::ComposeNotSupported(_) => "ComposeNotSupported",
            Self::InvertNotSupported(_) => "InvertNotSupported",
            Self::Server(envelope) => &envelope.code,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        match self {
            Self::Server(envelope) => envelope.clone(),
            other => ErrorEnvelope {
                code: other.code().to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl From<ErrorEnvelope> for OtError {
    fn from(envelope: ErrorEnvelope) -> Self {
        Self::Server(envelope)
    }
}

/// The error shape that travels in server replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
}
