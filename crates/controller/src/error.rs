use thiserror::Error;

/// Failure to process one key. Always retried through the queue's rate limiter.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("error fetching object with key {key} from store: {source}")]
    Lookup {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to marshal {key}: {source}")]
    Marshal {
        key: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("event sink closed")]
    SinkClosed,
}
