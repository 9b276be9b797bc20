//! Wire payloads exchanged between the two services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::RequestId;

/// Body of a successful `GET /greet`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    pub message: String,

    /// Correlation id of the request that produced this greeting.
    pub request_id: String,

    /// UTC time the greeting was generated.
    pub timestamp: DateTime<Utc>,
}

impl Greeting {
    /// Build a greeting stamped with the current time.
    pub fn new(message: impl Into<String>, request_id: &RequestId) -> Self {
        Self {
            message: message.into(),
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}
