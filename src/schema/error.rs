// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the schema objects.

use snafu::{Backtrace, Snafu};
use std::path::PathBuf;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for metadata schema objects.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("'{}' is not valid hexadecimal", s))]
    HexDecode { s: String, backtrace: Backtrace },

    #[snafu(display("'{}' is not valid base64", s))]
    Base64Decode { s: String, backtrace: Backtrace },

    #[snafu(display(
        "Key ID {} does not match calculated ID {}",
        keyid,
        calculated
    ))]
    InvalidKeyId {
        keyid: String,
        calculated: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Duplicate key ID {}", keyid))]
    DuplicateKeyId { keyid: String },

    #[snafu(display("Duplicate role {}", name))]
    DuplicateRole { name: String },

    #[snafu(display("Failed to serialize {} to JSON: {}", what, source))]
    JsonSerialization {
        what: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("'{}' is not a valid role name: {}", name, reason))]
    InvalidRoleName {
        name: String,
        reason: &'static str,
    },

    #[snafu(display("Target not found: {}", name))]
    TargetNotFound { name: String },

    #[snafu(display("Role not found: {}", name))]
    RoleNotFound { name: String },

    #[snafu(display("Target {} is not a file", path.display()))]
    TargetNotAFile { path: PathBuf, backtrace: Backtrace },

    #[snafu(display("Failed to open {}: {}", path.display(), source))]
    FileOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to read {}: {}", path.display(), source))]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse X.509 certificate: {}", source))]
    CertificateParse {
        source: openssl::error::ErrorStack,
    },

    #[snafu(display("Unsupported public key inside X.509 certificate"))]
    CertificateKeyType { backtrace: Backtrace },
}
