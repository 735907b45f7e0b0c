use std::fmt::Debug;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use super::{CapCheckResponse, CapQuery};
use crate::{Error, Result};

/// Source of current spend for the caps matching a call.
#[async_trait]
pub trait CapService: Send + Sync + Debug {
    async fn check(&self, query: &CapQuery) -> Result<CapCheckResponse>;
}

/// `GET {endpoint}?provider=..&model=..&customer_id=..&agent=..` on the
/// collector.
#[derive(Debug, Clone)]
pub struct HttpCapService {
    client: reqwest::Client,
    url: Url,
    api_key: Option<SecretString>,
}

impl HttpCapService {
    pub fn new(url: Url, api_key: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            api_key,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl CapService for HttpCapService {
    async fn check(&self, query: &CapQuery) -> Result<CapCheckResponse> {
        let mut url = self.url.clone();
        url.query_pairs_mut().extend_pairs(query.query_pairs());
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Collector {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_sends_filters_and_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/caps/check"))
            .and(query_param("provider", "openai"))
            .and(query_param("agent", "agent:researcher"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "allowed": true, "exceeded_caps": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let service = HttpCapService::new(
            format!("{}/api/caps/check", server.uri()).parse().unwrap(),
            Some(SecretString::from("secret".to_string())),
        );
        let response = service
            .check(&CapQuery {
                provider: "openai".into(),
                agent: Some("agent:researcher".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn test_non_success_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;
        let service = HttpCapService::new(server.uri().parse().unwrap(), None);
        let err = service.check(&CapQuery::default()).await.unwrap_err();
        assert!(matches!(err, Error::Collector { status: 401, .. }));
    }
}
