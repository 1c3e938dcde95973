// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::confirmation::ConfirmationError;
use crate::price_oracle::PriceError;
use crate::store::StoreError;
use thiserror::Error;

/// Infrastructure and configuration failures of the settlement pipeline.
///
/// Semantic outcomes (rejections, lost races) are never errors; they travel
/// as `Verdict` and `ProcessOutcome` values instead.
#[derive(Debug, Error)]
pub enum SettlementError {
    // The inbound payload is not valid JSON
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    // No funding request with this id
    #[error("Funding request {0} not found")]
    RequestNotFound(u64),
    // Configuration rejected at startup
    #[error("Invalid configuration: {0}")]
    Config(String),
    // Ledger store failure
    #[error(transparent)]
    Store(#[from] StoreError),
    // Price lookup failure that could not be absorbed by the cache or fallback table
    #[error(transparent)]
    Price(#[from] PriceError),
    // Confirmation source failure
    #[error(transparent)]
    Confirmation(#[from] ConfirmationError),
    // The eligibility collaborator could not answer
    #[error("Eligibility check failed: {0}")]
    Eligibility(String),
    // Uncategorized error
    #[error("{0}")]
    Generic(String),
}

impl SettlementError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            SettlementError::MalformedPayload(_) => "malformed_payload",
            SettlementError::RequestNotFound(_) => "request_not_found",
            SettlementError::Config(_) => "config",
            SettlementError::Store(_) => "store",
            SettlementError::Price(_) => "price",
            SettlementError::Confirmation(_) => "confirmation",
            SettlementError::Eligibility(_) => "eligibility",
            SettlementError::Generic(_) => "generic",
        }
    }

    /// Whether the Reaper's next tick may succeed where this attempt failed.
    pub fn is_transient(&self) -> bool {
        match self {
            SettlementError::Store(StoreError::Unavailable(_))
            | SettlementError::Confirmation(_)
            | SettlementError::Eligibility(_) => true,
            SettlementError::Price(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<anyhow::Error> for SettlementError {
    fn from(err: anyhow::Error) -> Self {
        Self::Generic(err.to_string())
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_labels() {
        let errors = vec![
            (
                SettlementError::MalformedPayload("eof".to_string()),
                "malformed_payload",
            ),
            (SettlementError::RequestNotFound(7), "request_not_found"),
            (SettlementError::Config("x".to_string()), "config"),
            (
                SettlementError::Store(StoreError::Unavailable("down".to_string())),
                "store",
            ),
            (
                SettlementError::Price(PriceError::Source("timeout".to_string())),
                "price",
            ),
            (
                SettlementError::Eligibility("503".to_string()),
                "eligibility",
            ),
            (SettlementError::Generic("x".to_string()), "generic"),
        ];

        for (error, expected_type) in errors {
            assert_eq!(error.error_type(), expected_type, "error_type mismatch");
        }
    }

    /// error_type values end up as Prometheus label values
    #[test]
    fn test_error_type_valid_prometheus_labels() {
        let errors_to_test = vec![
            SettlementError::MalformedPayload(String::new()),
            SettlementError::RequestNotFound(1),
            SettlementError::Store(StoreError::Internal(String::new())),
            SettlementError::Confirmation(ConfirmationError::Rpc(String::new())),
        ];

        for error in errors_to_test {
            let error_type = error.error_type();
            assert!(!error_type.is_empty());
            for c in error_type.chars() {
                assert!(
                    c.is_ascii_lowercase() || c == '_',
                    "error_type '{}' contains invalid character '{}' for Prometheus label",
                    error_type,
                    c
                );
            }
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(SettlementError::Store(StoreError::Unavailable("pool".into())).is_transient());
        assert!(SettlementError::Price(PriceError::Source("cmc".into())).is_transient());
        assert!(!SettlementError::Store(StoreError::NotFound(3)).is_transient());
        assert!(!SettlementError::Config("bad".into()).is_transient());
        assert!(!SettlementError::MalformedPayload("bad".into()).is_transient());
    }
}
