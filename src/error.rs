// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contains the error type for this library.

#![allow(clippy::default_trait_access)]

use chrono::{DateTime, Utc};
use snafu::{Backtrace, Snafu};
use std::path::PathBuf;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for this library.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    /// The repository has not been initialized and the requested operation
    /// needs signed metadata to exist.
    #[snafu(display("Repository has not been initialized"))]
    RepoNotInitialized,

    /// Neither the remote server nor the local cache know about this GUN.
    #[snafu(display("Repository does not exist"))]
    RepositoryNotExist,

    /// The server was asked to manage a role it may not manage.
    #[snafu(display("The server may not manage the {} key", role))]
    InvalidRemoteRole { role: String },

    #[snafu(display("Role {} is invalid: {}", role, reason))]
    InvalidRole {
        role: String,
        reason: &'static str,
    },

    #[snafu(display("Role {} does not exist", role))]
    NoSuchRole { role: String },

    #[snafu(display("Metadata for {} expired at {}", role, expired_at))]
    Expired {
        role: String,
        expired_at: DateTime<Utc>,
    },

    #[snafu(display("Metadata for {} was not found", role))]
    MetaNotFound { role: String },

    #[snafu(display("The server is unavailable (HTTP status {})", code))]
    ServerUnavailable { code: u16 },

    /// The role hierarchy described by the root metadata is unusable, for
    /// example a base role record is missing entirely.
    #[snafu(display("Bad role hierarchy: {}", reason))]
    BadHierarchy { reason: &'static str },

    /// No locally held private key is authorized to sign the role. The
    /// publish flow treats this as recoverable for server-managed roles.
    #[snafu(display("No signing keys available for role {}", role))]
    NoKeys { role: String },

    #[snafu(display("Signing {} produced {} of {} required signatures", role, found, needed))]
    InsufficientSignatures {
        role: String,
        found: usize,
        needed: u64,
    },

    #[snafu(display("Maximum passphrase attempts exceeded"))]
    AttemptsExceeded,

    #[snafu(display("Invalid passphrase or operation aborted"))]
    PasswordInvalid,

    #[snafu(display("No trusted certificates found for {}", gun))]
    NoCertificatesFound { gun: String },

    #[snafu(display("No trust data for {}", name))]
    NoTrustData { name: String },

    #[snafu(display("Could not validate {} against the trust anchor: {}", gun, reason))]
    RootValidationFail { gun: String, reason: &'static str },

    #[snafu(display(
        "Signature threshold for {} not met: {} of {} signatures verified",
        role,
        verified,
        threshold
    ))]
    VerificationFail {
        role: String,
        verified: usize,
        threshold: u64,
    },

    #[snafu(display(
        "Version rollback for {}: fetched version {} but version {} is already trusted",
        role,
        fetched,
        current
    ))]
    LowVersion {
        role: String,
        fetched: u64,
        current: u64,
    },

    #[snafu(display(
        "Hash mismatch for {}: calculated {} but expected {}",
        context,
        calculated,
        expected
    ))]
    HashMismatch {
        context: String,
        calculated: String,
        expected: String,
    },

    #[snafu(display("Downloaded {} exceeds the maximum size of {} bytes", specifier, max_size))]
    MaxSizeExceeded {
        max_size: u64,
        specifier: &'static str,
    },

    /// A delegated role may carry paths or path hash prefixes, never both.
    #[snafu(display("Role {} may not have both paths and path hash prefixes", role))]
    PathConflict { role: String },

    #[snafu(display("Target {} metadata must include a 32-byte sha256 digest", path))]
    InvalidTargetMeta { path: String },

    #[snafu(display("Unknown change action '{}'", action))]
    UnknownChangeAction { action: String },

    #[snafu(display("Failed to parse {} metadata: {}", role, source))]
    ParseMetadata {
        role: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to serialize {}: {}", what, source))]
    JsonSerialization {
        what: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to decode {} change content: {}", kind, source))]
    ChangeContent {
        kind: &'static str,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to transfer {}: {}", url, source))]
    Transport {
        url: String,
        source: reqwest::Error,
    },

    #[snafu(display("Failed to parse URL from {}: {}", url, source))]
    UrlParse {
        url: String,
        source: url::ParseError,
    },

    #[snafu(display("Failed to read {}: {}", path.display(), source))]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to write {}: {}", path.display(), source))]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to remove {}: {}", path.display(), source))]
    FileRemove {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to create directory {}: {}", path.display(), source))]
    DirCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to list directory {}: {}", path.display(), source))]
    DirRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Private key {} was not found", key_id))]
    KeyNotFound { key_id: String },

    #[snafu(display("Unrecognized or corrupt private key"))]
    KeyUnrecognized,

    #[snafu(display("Rejected private key: {}", source))]
    KeyRejected { source: ring::error::KeyRejected },

    #[snafu(display("Failed to sign message"))]
    Sign { source: ring::error::Unspecified },

    #[snafu(display("Failed to generate a {} key", algorithm))]
    KeyGeneration { algorithm: &'static str },

    #[snafu(display("X.509 operation failed while {}: {}", context, source))]
    Certificate {
        context: &'static str,
        source: openssl::error::ErrorStack,
    },

    #[snafu(display("Schema error: {}", source))]
    Schema {
        #[snafu(backtrace)]
        source: crate::schema::Error,
    },
}

impl Error {
    /// True when the error means "the remote store answered, and it does not
    /// have this metadata" as opposed to a transport failure.
    pub fn is_meta_not_found(&self) -> bool {
        matches!(self, Error::MetaNotFound { .. })
    }
}
