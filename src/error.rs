use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum HaMqttError {
    #[error("Failed to connect to MQTT broker {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Required field missing: {0}")]
    MissingField(&'static str),

    #[error("Invalid identifier {0:?}: must be non-empty and contain no '/', '+' or '#'")]
    InvalidId(String),

    #[error("Unknown component type: {0}")]
    UnknownComponentType(String),

    #[error("Message cannot be empty on topic {0}")]
    MissingMessage(String),

    #[error("Shared topic {0} cannot be subscribed to")]
    SharedTopicSubscribe(String),

    #[error("Shared topic {topic} already has an entry {key:?}")]
    DuplicateEntry { topic: String, key: String },

    #[error("Climate mode {0} is not enabled")]
    UnsupportedMode(String),

    #[error("{failed} of {total} state updates failed")]
    UpdatesFailed { failed: usize, total: usize },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    ClientError(#[from] rumqttc::ClientError),

    #[error(transparent)]
    SerdeYamlError(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, HaMqttError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_missing_message() {
        let err = HaMqttError::MissingMessage("a/b".to_string());
        assert_eq!(err.to_string(), "Message cannot be empty on topic a/b");
    }

    #[test]
    fn test_display_updates_failed() {
        let err = HaMqttError::UpdatesFailed {
            failed: 2,
            total: 5,
        };
        assert_eq!(err.to_string(), "2 of 5 state updates failed");
    }
}
