// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for every pipeline stage.

/// Fatal at startup; the process does not start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Missing required configuration: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("Unknown timezone '{0}'")]
    InvalidTimezone(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unable to load TLS material from {path}: {reason}")]
    Tls { path: String, reason: String },
}

/// Raised while turning a request body into an [`crate::event::Event`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Malformed JSON: {0}")]
    Json(String),

    #[error("Unsupported message type")]
    UnsupportedType(Option<String>),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid flow_url '{0}'")]
    InvalidFlowUrl(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("Bucket for sid {sid} has no event with a start time")]
    MissingStartTime { sid: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("{0}")]
    Other(String),
}

/// Terminal failure for one digest; it is dropped afterwards.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: TransportError,
    },

    #[error("Shutdown requested after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_are_listed_together() {
        let error = ConfigError::Missing(vec![
            "TELEGRAM_BOT_TOKEN".to_string(),
            "WEBHOOK_SECRET_TOKEN".to_string(),
        ]);
        assert_eq!(
            error.to_string(),
            "Missing required configuration: TELEGRAM_BOT_TOKEN, WEBHOOK_SECRET_TOKEN"
        );
    }

    #[test]
    fn test_delivery_error_display() {
        let error = DeliveryError::RetriesExhausted {
            attempts: 3,
            last: TransportError::Other("connection reset".to_string()),
        };
        assert_eq!(
            error.to_string(),
            "Gave up after 3 attempts: connection reset"
        );
    }
}
