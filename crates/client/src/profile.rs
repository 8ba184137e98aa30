//! Operator profile lookup against the account service.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use megatrade_protocol::OperatorIdentity;

use crate::error::FetchError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Display fields of an operator account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountProfile {
    pub avatar_url: String,
    pub display_name: String,
}

impl AccountProfile {
    /// Build the session identity for `operator_id` from this profile.
    pub fn into_identity(self, operator_id: &str, is_operator: bool) -> OperatorIdentity {
        OperatorIdentity {
            id: operator_id.to_string(),
            is_operator,
            avatar_url: self.avatar_url,
            display_name: self.display_name,
        }
    }
}

/// Resolves an operator id to profile fields.
pub trait ProfileLoader: Send + Sync + 'static {
    fn fetch_profile(
        &self,
        operator_id: &str,
    ) -> impl Future<Output = Result<AccountProfile, FetchError>> + Send;
}

/// Account service envelope: `{ error, message, data }`
#[derive(Debug, Deserialize)]
struct AccountResponse {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<AccountData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountData {
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
}

/// HTTP client for `GET {base_url}/admin/account/{operator_id}`
#[derive(Debug, Clone)]
pub struct HttpProfileLoader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProfileLoader {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn account_url(&self, operator_id: &str) -> String {
        format!(
            "{}/admin/account/{}",
            self.base_url,
            urlencoding::encode(operator_id)
        )
    }
}

impl ProfileLoader for HttpProfileLoader {
    async fn fetch_profile(&self, operator_id: &str) -> Result<AccountProfile, FetchError> {
        let url = self.account_url(operator_id);
        debug!(
            component = "profile",
            event = "profile.fetch.started",
            operator_id = %operator_id,
            url = %url,
        );

        let resp = self.client.get(&url).send().await.map_err(|e| {
            warn!(
                component = "profile",
                event = "profile.fetch.unreachable",
                operator_id = %operator_id,
                error = %e,
                "Account service unreachable"
            );
            FetchError::new(format!("Could not reach the account service: {e}"))
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| FetchError::new(format!("Failed to read account response: {e}")))?;

        let body: Option<AccountResponse> = serde_json::from_str(&text).ok();
        if !status.is_success() {
            let message = body
                .and_then(|b| b.message)
                .unwrap_or_else(|| format!("Account service returned {status}"));
            return Err(FetchError::new(message));
        }

        let body = body.ok_or_else(|| FetchError::new("Malformed account response"))?;
        profile_from_response(body)
    }
}

fn profile_from_response(body: AccountResponse) -> Result<AccountProfile, FetchError> {
    if body.error {
        return Err(FetchError::new(
            body.message
                .unwrap_or_else(|| "Failed to load account".to_string()),
        ));
    }

    let data = body
        .data
        .ok_or_else(|| FetchError::new("Account response has no data"))?;

    Ok(AccountProfile {
        avatar_url: data.avatar.unwrap_or_default(),
        display_name: display_name(data.first_name.as_deref(), data.last_name.as_deref()),
    })
}

fn display_name(first: Option<&str>, last: Option<&str>) -> String {
    [first, last]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
