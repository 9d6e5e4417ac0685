//! Remote provisioning API client.
//!
//! Speaks a small REST protocol:
//! - `POST   {endpoint}/resources`       create, body is the resolved resource
//! - `PUT    {endpoint}/resources/{id}`  update in place
//! - `DELETE {endpoint}/resources/{id}`  delete
//!
//! Every request carries an `Idempotency-Key` header. Responses to create and
//! update are `{"id": "...", "outputs": {...}}`.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, header};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ProviderError, Result, StackError};

use super::{ProvisionedResource, Provider, ResolvedResource};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Header carrying the idempotency token.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// HTTP provisioning client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Bearer token, if any.
    token: Option<String>,
}

impl HttpProvider {
    /// Creates a new client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| StackError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        let builder = builder
            .header(header::ACCEPT, "application/json")
            .header(IDEMPOTENCY_HEADER, token);

        match &self.token {
            Some(bearer) => builder.header(header::AUTHORIZATION, format!("Bearer {bearer}")),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        resource: &str,
        operation: &str,
    ) -> Result<Response> {
        let response = builder.send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!("request timed out: {e}")
            } else {
                format!("request failed: {e}")
            };
            StackError::Provider(ProviderError::transient(resource, operation, message))
        })?;

        let status = response.status();
        trace!("{operation} {resource}: HTTP {status}");

        if status.is_success() {
            return Ok(response);
        }

        Err(classify(response, resource, operation).await)
    }

    async fn parse(response: Response, resource: &str, operation: &str) -> Result<ProvisionedResource> {
        response.json::<ProvisionedResource>().await.map_err(|e| {
            StackError::Provider(ProviderError::permanent(
                resource,
                operation,
                format!("invalid response body: {e}"),
            ))
        })
    }
}

/// Maps an unsuccessful response to a provider error.
///
/// 404 is `NotFound`; 408, 409, 429 and 5xx are transient; everything else
/// is permanent.
async fn classify(response: Response, resource: &str, operation: &str) -> StackError {
    let status = response.status();
    let retry_after_secs = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    };

    if status == StatusCode::NOT_FOUND {
        return StackError::Provider(ProviderError::NotFound {
            provider_id: resource.to_string(),
        });
    }

    let transient = status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_MANY_REQUESTS
        );

    if transient {
        StackError::Provider(ProviderError::Transient {
            resource: resource.to_string(),
            operation: operation.to_string(),
            message,
            retry_after_secs,
        })
    } else {
        StackError::Provider(ProviderError::permanent(resource, operation, message))
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create(&self, resource: &ResolvedResource, token: &str) -> Result<ProvisionedResource> {
        let url = format!("{}/resources", self.endpoint);
        debug!("POST {url} ({})", resource.identity());

        let builder = self.request(self.client.post(&url).json(resource), token);
        let response = self.send(builder, &resource.name, "create").await?;
        Self::parse(response, &resource.name, "create").await
    }

    async fn update(
        &self,
        provider_id: &str,
        resource: &ResolvedResource,
        token: &str,
    ) -> Result<ProvisionedResource> {
        let url = format!("{}/resources/{provider_id}", self.endpoint);
        debug!("PUT {url} ({})", resource.identity());

        let builder = self.request(self.client.put(&url).json(resource), token);
        let response = self
            .send(builder, &resource.name, "update")
            .await
            .map_err(|e| not_found_as(e, provider_id))?;
        Self::parse(response, &resource.name, "update").await
    }

    async fn delete(&self, provider_id: &str, token: &str) -> Result<()> {
        let url = format!("{}/resources/{provider_id}", self.endpoint);
        debug!("DELETE {url}");

        let builder = self.request(self.client.delete(&url), token);
        self.send(builder, provider_id, "delete").await?;
        Ok(())
    }
}

/// Reports `NotFound` under the provider id rather than the resource name.
fn not_found_as(error: StackError, provider_id: &str) -> StackError {
    match error {
        StackError::Provider(ProviderError::NotFound { .. }) => {
            StackError::Provider(ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            })
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceType;
    use std::collections::BTreeMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn vpc() -> ResolvedResource {
        let mut properties = serde_json::Map::new();
        properties.insert(String::from("cidr"), serde_json::json!("10.0.0.0/16"));
        ResolvedResource {
            stack: String::from("demo-dev"),
            name: String::from("vpc"),
            resource_type: ResourceType::Network,
            properties,
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_sends_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources"))
            .and(header(IDEMPOTENCY_HEADER, "tok-1"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "vpc-123",
                "outputs": { "id": "vpc-123", "cidr": "10.0.0.0/16" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), Some(String::from("secret"))).unwrap();
        let created = provider.create(&vpc(), "tok-1").await.unwrap();

        assert_eq!(created.provider_id, "vpc-123");
        assert_eq!(created.outputs["cidr"], serde_json::json!("10.0.0.0/16"));
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None).unwrap();
        let err = provider.create(&vpc(), "tok").await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_secs(), Some(7));
    }

    #[tokio::test]
    async fn test_client_errors_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("cidr overlaps"))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None).unwrap();
        let err = provider.create(&vpc(), "tok").await.unwrap_err();

        assert!(!err.is_retryable());
        assert!(err.to_string().contains("cidr overlaps"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/resources/vpc-404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&format!("{}/", server.uri()), None).unwrap();
        let err = provider.delete("vpc-404", "tok").await.unwrap_err();

        assert!(matches!(
            err,
            StackError::Provider(ProviderError::NotFound { ref provider_id }) if provider_id == "vpc-404"
        ));
    }

    #[tokio::test]
    async fn test_update_puts_to_resource_path() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/resources/vpc-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "vpc-1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None).unwrap();
        let updated = provider.update("vpc-1", &vpc(), "tok").await.unwrap();

        assert_eq!(updated.provider_id, "vpc-1");
        assert!(updated.outputs.is_empty());
    }
}
