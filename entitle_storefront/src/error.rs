// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

use entitle_jws::JwsError;

/// Errors returned by receipt verification.
///
/// Every variant is reported to the client the same way; the distinction is
/// kept for logs and metrics.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// A storefront credential needed by the chosen protocol is not configured.
    #[error("storefront {0} is not configured")]
    ConfigMissing(&'static str),

    /// Token decoding, service token minting or signature checks failed.
    #[error(transparent)]
    Token(#[from] JwsError),

    /// The legacy endpoint answered with a non-zero status.
    #[error("receipt validation failed (status={0})")]
    ReceiptRejected(i64),

    #[error("no receipt info returned")]
    NoReceiptInfo,

    /// The lookup endpoint answered with an error status.
    #[error("storefront API status={status} body={body}")]
    LookupStatus { status: u16, body: String },

    #[error("signedTransactionInfo missing")]
    MissingSignedTransaction,

    /// The request could not be sent or its response could not be read.
    #[error("storefront request failed: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for VerifyError {
    fn from(err: reqwest::Error) -> Self {
        VerifyError::Transport(err.to_string())
    }
}
