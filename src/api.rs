use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("the server rejected the access token (HTTP {0})")]
    Unauthorized(u16),
    #[error("unexpected status: {0}")]
    Status(u16),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(rename = "accountID", alias = "id")]
    pub account_id: Option<String>,
    pub network: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AccountsResponse {
    List(Vec<Account>),
    Wrapped { items: Vec<Account> },
}

#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    /// Lists the accounts the token can see. Used to verify a token before
    /// storing it.
    pub async fn list_accounts(&self, token: &str) -> Result<Vec<Account>, ApiError> {
        let url = format!("{}/v1/accounts", self.base_url);
        let response = self.http.get(url).bearer_auth(token).send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }

        // Any successful answer proves the token; the listing is best effort.
        let body: Value = response.json().await?;
        Ok(match serde_json::from_value(body) {
            Ok(AccountsResponse::List(accounts)) => accounts,
            Ok(AccountsResponse::Wrapped { items }) => items,
            Err(error) => {
                debug!(%error, "unrecognised accounts payload");
                Vec::new()
            }
        })
    }
}
