use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use super::pipeline::PendingCall;
use super::stream::TrackedStream;
use crate::Result;
use crate::instrument::Instrumentation;

/// A `reqwest::Client` whose calls are tracked.
///
/// Requests and responses pass through unchanged. Tracking problems are
/// logged and never reach the caller; the only new error a call can return
/// is [`Error::CapExceeded`](crate::Error::CapExceeded), before anything is
/// sent.
#[derive(Debug, Clone)]
pub struct TrackedClient {
    inner: reqwest::Client,
    tracker: Instrumentation,
}

impl TrackedClient {
    pub(crate) fn new(inner: reqwest::Client, tracker: Instrumentation) -> Self {
        Self { inner, tracker }
    }

    pub fn get<U: reqwest::IntoUrl>(&self, url: U) -> TrackedRequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post<U: reqwest::IntoUrl>(&self, url: U) -> TrackedRequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn put<U: reqwest::IntoUrl>(&self, url: U) -> TrackedRequestBuilder {
        self.request(Method::PUT, url)
    }

    pub fn delete<U: reqwest::IntoUrl>(&self, url: U) -> TrackedRequestBuilder {
        self.request(Method::DELETE, url)
    }

    pub fn request<U: reqwest::IntoUrl>(&self, method: Method, url: U) -> TrackedRequestBuilder {
        TrackedRequestBuilder {
            builder: self.inner.request(method, url),
            client: self.clone(),
        }
    }

    pub async fn execute(&self, request: reqwest::Request) -> Result<TrackedResponse> {
        if !self.tracker.is_enabled() {
            let response = self.inner.execute(request).await?;
            return Ok(TrackedResponse {
                response,
                call: None,
            });
        }

        let mut call = self.tracker.begin_call(
            request.method().as_str(),
            request.url(),
            request.headers(),
            request.body().and_then(reqwest::Body::as_bytes),
        );
        call.admit().await?;

        match self.inner.execute(request).await {
            Ok(response) => {
                call.set_status(response.status().as_u16());
                Ok(TrackedResponse {
                    response,
                    call: Some(call),
                })
            }
            Err(e) => {
                call.fail(&e);
                Err(e.into())
            }
        }
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.tracker
    }
}

/// Mirrors the parts of `reqwest::RequestBuilder` API clients use.
#[derive(Debug)]
pub struct TrackedRequestBuilder {
    builder: reqwest::RequestBuilder,
    client: TrackedClient,
}

impl TrackedRequestBuilder {
    /// Invalid names or values surface as an error from `send`.
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.builder = self.builder.header(key, value);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.builder = self.builder.headers(headers);
        self
    }

    pub fn bearer_auth(mut self, token: impl std::fmt::Display) -> Self {
        self.builder = self.builder.bearer_auth(token);
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, json: &T) -> Self {
        self.builder = self.builder.json(json);
        self
    }

    pub fn body(mut self, body: impl Into<reqwest::Body>) -> Self {
        self.builder = self.builder.body(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.builder = self.builder.timeout(timeout);
        self
    }

    pub async fn send(self) -> Result<TrackedResponse> {
        let request = self.builder.build()?;
        self.client.execute(request).await
    }
}

/// Response of a tracked call. Reading the body records the call; so does
/// dropping the response unread.
#[derive(Debug)]
pub struct TrackedResponse {
    response: reqwest::Response,
    call: Option<PendingCall>,
}

impl TrackedResponse {
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.response.headers()
    }

    pub fn url(&self) -> &Url {
        self.response.url()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    pub async fn bytes(self) -> Result<Bytes> {
        let Self { response, call } = self;
        let status = response.status().as_u16();
        match response.bytes().await {
            Ok(body) => {
                if let Some(call) = call {
                    call.finish_body(status, &body);
                }
                Ok(body)
            }
            Err(e) => {
                if let Some(call) = call {
                    call.fail(&e);
                }
                Err(e.into())
            }
        }
    }

    pub async fn text(self) -> Result<String> {
        let body = self.bytes().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let body = self.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Streams the body; the call is recorded when the stream ends or is
    /// dropped.
    pub fn bytes_stream(self) -> TrackedStream<impl Stream<Item = reqwest::Result<Bytes>>> {
        let Self { response, call } = self;
        TrackedStream::new(response.bytes_stream(), call)
    }

    /// Hands back the raw response. The call is recorded now, without its
    /// body.
    pub fn into_inner(self) -> reqwest::Response {
        let Self { response, call } = self;
        drop(call);
        response
    }
}
