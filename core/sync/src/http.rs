//! REST adapter for the remote entity API.

use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use fieldsync_common::{Error, Result};

use crate::remote::{RemoteEntity, RemoteEntityClient};

/// Entity client speaking plain JSON over HTTP.
///
/// Entities live at `{base}/{entity_type}/{id}`:
/// - `POST {base}/{entity_type}` creates
/// - `GET`, `PUT` and `DELETE {base}/{entity_type}/{id}` read, update and delete
pub struct HttpEntityClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpEntityClient {
    /// Create a client for the API rooted at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidInput(format!(
                "Endpoint cannot be used as a base URL: {}",
                base_url
            )));
        }

        let http = Client::builder()
            .user_agent(concat!("fieldsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            token: None,
        })
    }

    /// Send a bearer token with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Build `{base}/{segments...}`, escaping each segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(e.to_string())
            } else {
                Error::Network(e.to_string())
            }
        })
    }

    /// Handle API response with error checking.
    async fn handle_response(&self, response: reqwest::Response) -> Result<RemoteEntity> {
        let status = response.status();

        if status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|e| Error::Network(format!("Failed to read response: {}", e)))?;
            if body.trim().is_empty() {
                return Ok(RemoteEntity::from_json(Value::Null));
            }
            let value = serde_json::from_str(&body).unwrap_or(Value::Null);
            Ok(RemoteEntity::from_json(value))
        } else if status == StatusCode::NOT_FOUND {
            Err(Error::NotFound("Resource not found".to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Remote {
                status: status.as_u16(),
                message: body,
            })
        }
    }
}

#[async_trait]
impl RemoteEntityClient for HttpEntityClient {
    async fn create(&self, entity_type: &str, payload: &Value) -> Result<RemoteEntity> {
        let url = self.url(&[entity_type]);
        debug!("POST {}", url);
        let response = self
            .send(self.request(Method::POST, url).json(payload))
            .await?;
        self.handle_response(response).await
    }

    async fn read(&self, entity_type: &str, id: &str) -> Result<RemoteEntity> {
        let url = self.url(&[entity_type, id]);
        debug!("GET {}", url);
        let response = self.send(self.request(Method::GET, url)).await?;
        self.handle_response(response).await
    }

    async fn update(&self, entity_type: &str, id: &str, payload: &Value) -> Result<RemoteEntity> {
        let url = self.url(&[entity_type, id]);
        debug!("PUT {}", url);
        let response = self
            .send(self.request(Method::PUT, url).json(payload))
            .await?;
        self.handle_response(response).await
    }

    async fn delete(&self, entity_type: &str, id: &str) -> Result<()> {
        let url = self.url(&[entity_type, id]);
        debug!("DELETE {}", url);
        let response = self.send(self.request(Method::DELETE, url)).await?;
        self.handle_response(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_urls() {
        let client = HttpEntityClient::new("https://api.example.com/v1").unwrap();
        assert_eq!(
            client.url(&["tasks"]).as_str(),
            "https://api.example.com/v1/tasks"
        );
        assert_eq!(
            client.url(&["tasks", "42"]).as_str(),
            "https://api.example.com/v1/tasks/42"
        );
    }

    #[test]
    fn test_trailing_slash_and_escaping() {
        let client = HttpEntityClient::new("https://api.example.com/v1/").unwrap();
        assert_eq!(
            client.url(&["daily_reports", "a/b c"]).as_str(),
            "https://api.example.com/v1/daily_reports/a%2Fb%20c"
        );
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(matches!(
            HttpEntityClient::new("not a url"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            HttpEntityClient::new("mailto:ops@example.com"),
            Err(Error::InvalidInput(_))
        ));
    }
}
