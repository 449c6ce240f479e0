//! Text shown to players when their data cannot be loaded.

use rampart_retry::OpenFailure;

/// The stored record is newer than this server understands.
pub const BACKWARDS_COMPATIBILITY_MESSAGE: &str = "You joined an old server which does not support your saved data. Please try joining a different server. If this issue persists, contact a developer.";

/// The backend kept failing until retries ran out.
pub const BACKEND_SERVICE_MESSAGE: &str =
    "Failed to load data due to a backend service issue. Try again later.";

/// The server stopped while the player's data was loading.
pub const SHUTTING_DOWN_MESSAGE: &str = "The server is shutting down. Try again later.";

/// The client asked for data it has no session for.
pub const MISSING_DOCUMENT_MESSAGE: &str =
    "Failed to get document. Please screenshot and report this issue to a developer";

/// The disconnect message for a failed open.
pub fn disconnect_message(failure: &OpenFailure) -> String {
    match failure {
        OpenFailure::BackwardsCompatibility(_) => BACKWARDS_COMPATIBILITY_MESSAGE.to_string(),
        OpenFailure::BackendService { .. } => BACKEND_SERVICE_MESSAGE.to_string(),
        OpenFailure::ShuttingDown => SHUTTING_DOWN_MESSAGE.to_string(),
        OpenFailure::ExhaustedRetries { .. } | OpenFailure::Other(_) => format!(
            "Failed to load data: {failure}. Please screenshot and report this issue to a developer"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_message_backwards_compatibility() {
        let failure = OpenFailure::BackwardsCompatibility("v9".into());
        assert_eq!(disconnect_message(&failure), BACKWARDS_COMPATIBILITY_MESSAGE);
    }

    #[test]
    fn test_disconnect_message_backend_service() {
        let failure = OpenFailure::BackendService {
            attempts: 5,
            detail: "throttled".into(),
        };
        assert_eq!(disconnect_message(&failure), BACKEND_SERVICE_MESSAGE);
    }

    #[test]
    fn test_disconnect_message_other_includes_detail() {
        let failure = OpenFailure::Other("open of document 7 was abandoned".into());
        assert_eq!(
            disconnect_message(&failure),
            "Failed to load data: open of document 7 was abandoned. Please screenshot and report this issue to a developer"
        );
    }

    #[test]
    fn test_disconnect_message_shutting_down_asks_to_retry() {
        let message = disconnect_message(&OpenFailure::ShuttingDown);
        assert_eq!(message, SHUTTING_DOWN_MESSAGE);
        assert!(!message.contains("report"));
    }
}
