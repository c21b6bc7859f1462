//! JSON envelopes exchanged with the secrets authority.

use serde::{Deserialize, Serialize};

use super::SecretPayload;

/// Body sent with `POST` fetches. Currently carries nothing.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SecretFetchRequest {}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretFetchResponse {
    pub data: String,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
}

impl From<SecretFetchResponse> for SecretPayload {
    fn from(response: SecretFetchResponse) -> Self {
        SecretPayload::new(response.data).with_timestamps(response.created, response.updated)
    }
}
