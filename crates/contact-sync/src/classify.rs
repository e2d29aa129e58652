//! Pure decision logic of the per-datasource sync loop, factored out of the
//! worker so the branch table is testable without I/O.

use crate::client::{AlertingConfig, ApiError, ContactPoint};

const NOT_FOUND: u16 = 404;
const BAD_REQUEST: u16 = 400;

/// What the worker should do with a datasource after its config fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    /// Config present: create the contact point.
    Create,
    /// Backend alerting is uninitialized for this datasource: initialize
    /// the alertmanager, then attempt creation anyway.
    InitializeThenCreate,
    /// The backend rejected the datasource outright: skip it, permanently.
    SkipPermanently,
    /// Ambiguous failure: attempt no creation and retry the datasource.
    Retry,
}

pub fn config_action(config: &Result<AlertingConfig, ApiError>) -> ConfigAction {
    match config {
        Ok(_) => ConfigAction::Create,
        Err(error) => match error.status() {
            Some(NOT_FOUND) => ConfigAction::InitializeThenCreate,
            Some(BAD_REQUEST) => ConfigAction::SkipPermanently,
            _ => ConfigAction::Retry,
        },
    }
}

/// Outcome of one datasource within one sync round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    SkippedPermanently,
    Retry,
}

/// Classify a datasource's round from its config fetch and creation results.
/// `creation` is None when no creation call was attempted. An attempted
/// creation that produced nothing classifies as Retry regardless of how the
/// config fetch went.
pub fn classify(
    config: &Result<AlertingConfig, ApiError>,
    creation: Option<&Option<ContactPoint>>,
) -> AttemptOutcome {
    match (config_action(config), creation) {
        (_, Some(Some(_))) => AttemptOutcome::Succeeded,
        (_, Some(None)) => AttemptOutcome::Retry,
        (ConfigAction::SkipPermanently, None) => AttemptOutcome::SkippedPermanently,
        (_, None) => AttemptOutcome::Retry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_ok() -> Result<AlertingConfig, ApiError> {
        Ok(AlertingConfig {
            alertmanager_config: json!({}),
            template_files: None,
        })
    }

    fn config_err(status: u16) -> Result<AlertingConfig, ApiError> {
        Err(ApiError::Status {
            status,
            message: String::new(),
        })
    }

    fn created() -> Option<ContactPoint> {
        Some(ContactPoint {
            name: "contact-point-42".to_string(),
        })
    }

    #[test]
    fn config_fetch_branch_table() {
        assert_eq!(config_action(&config_ok()), ConfigAction::Create);
        assert_eq!(
            config_action(&config_err(404)),
            ConfigAction::InitializeThenCreate
        );
        assert_eq!(config_action(&config_err(400)), ConfigAction::SkipPermanently);
        assert_eq!(config_action(&config_err(500)), ConfigAction::Retry);
        assert_eq!(config_action(&config_err(502)), ConfigAction::Retry);
    }

    #[test]
    fn successful_creation_wins() {
        assert_eq!(
            classify(&config_ok(), Some(&created())),
            AttemptOutcome::Succeeded
        );
        // Creation after initializing an absent alertmanager.
        assert_eq!(
            classify(&config_err(404), Some(&created())),
            AttemptOutcome::Succeeded
        );
    }

    #[test]
    fn absent_creation_result_always_retries() {
        assert_eq!(classify(&config_ok(), Some(&None)), AttemptOutcome::Retry);
        assert_eq!(classify(&config_err(404), Some(&None)), AttemptOutcome::Retry);
    }

    #[test]
    fn bad_request_skips_permanently() {
        assert_eq!(
            classify(&config_err(400), None),
            AttemptOutcome::SkippedPermanently
        );
    }

    #[test]
    fn ambiguous_config_failures_retry_without_creation() {
        assert_eq!(classify(&config_err(500), None), AttemptOutcome::Retry);
        assert_eq!(classify(&config_err(503), None), AttemptOutcome::Retry);
    }
}
