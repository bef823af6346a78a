/// Hetzner Robot webservice client
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::{Result, RobotError};
use crate::config::RobotConfig;

/// Form body as ordered key/value pairs (keys may repeat, e.g. `server[]`)
pub type Form = [(String, String)];

/// Status and body of a webservice response
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: String,
}

/// Robot webservice client
#[derive(Clone)]
pub struct RobotClient {
    client: Client,
    config: Arc<RobotConfig>,
}

impl RobotClient {
    /// Create a new Robot client from resolved configuration
    pub fn new(config: RobotConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(RobotError::Http)?;

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Send an authenticated request and return status and body untouched.
    ///
    /// A form, when given, is sent as `application/x-www-form-urlencoded`.
    pub async fn send(&self, method: Method, path: &str, form: Option<&Form>) -> Result<RawResponse> {
        let url = format!("{}{}", self.config.base_url, path);
        debug!(method = %method, url = %url, "Robot request");

        let mut request = self
            .client
            .request(method, &url)
            .basic_auth(&self.config.username, Some(self.config.password()));
        if let Some(form) = form {
            request = request.form(form);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        Ok(RawResponse { status, body })
    }

    /// Map a raw response onto the success family, `NotFound` or an API error
    fn check(raw: RawResponse, path: &str) -> Result<RawResponse> {
        match raw.status {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => {
                Ok(raw)
            }
            StatusCode::NOT_FOUND => Err(RobotError::NotFound(format!(
                "{path}: {}",
                raw.body.trim()
            ))),
            status => Err(RobotError::Api {
                status: status.as_u16(),
                body: raw.body,
            }),
        }
    }

    fn decode<T: DeserializeOwned>(raw: RawResponse, path: &str) -> Result<T> {
        serde_json::from_str(&raw.body).map_err(|e| {
            warn!(path = %path, error = %e, "Failed to parse Robot response");
            RobotError::Decode(e)
        })
    }

    /// GET and decode JSON
    pub(crate) async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let raw = self.send(Method::GET, path, None).await?;
        Self::decode(Self::check(raw, path)?, path)
    }

    /// POST a form and decode JSON
    pub(crate) async fn post_form<T: DeserializeOwned>(&self, path: &str, form: &Form) -> Result<T> {
        let raw = self.send(Method::POST, path, Some(form)).await?;
        Self::decode(Self::check(raw, path)?, path)
    }

    /// POST a form, ignoring any response body
    pub(crate) async fn post_form_empty(&self, path: &str, form: &Form) -> Result<()> {
        let raw = self.send(Method::POST, path, Some(form)).await?;
        Self::check(raw, path).map(|_| ())
    }

    /// DELETE, optionally with a form body
    pub(crate) async fn delete(&self, path: &str, form: Option<&Form>) -> Result<()> {
        let raw = self.send(Method::DELETE, path, form).await?;
        Self::check(raw, path).map(|_| ())
    }
}

/// Build an owned form from borrowed pairs
pub(crate) fn form<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Vec<(String, String)>
where
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use wiremock::MockServer;

    pub const USERNAME: &str = "robot-user";
    pub const PASSWORD: &str = "robot-pass";

    /// Client pointed at a wiremock server
    pub async fn setup() -> (MockServer, RobotClient) {
        let mock_server = MockServer::start().await;
        let config = RobotConfig::new(USERNAME, PASSWORD, mock_server.uri()).unwrap();
        let client = RobotClient::new(config).unwrap();
        (mock_server, client)
    }

    /// Decode the urlencoded body of a captured request
    pub fn form_pairs(request: &wiremock::Request) -> Vec<(String, String)> {
        url::form_urlencoded::parse(&request.body)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }
}
