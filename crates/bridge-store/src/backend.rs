//! Shared HTTP client for the backend contract.
//!
//! Every call carries the shared secret in `X-API-Key` and is bounded by the
//! client-wide timeout.

use std::time::Duration;

use bridge_core::ApiKey;
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Clone, Debug)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: ApiKey,
}

impl BackendClient {
    pub fn new(base_url: &str, api_key: ApiKey, timeout: Duration) -> Result<Self, StoreError> {
        let base_url =
            Url::parse(base_url.trim_end_matches('/')).map_err(|e| StoreError::Url(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Url(format!("{base_url} cannot be a base")));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    /// Build a URL under the base, percent-encoding each segment.
    pub fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    pub fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        self.http
            .request(method, self.url(segments))
            .header(API_KEY_HEADER, self.api_key.expose())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, StoreError> {
        let resp = self.request(Method::GET, segments).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        body: &B,
    ) -> Result<(), StoreError> {
        let resp = self.request(method, segments).json(body).send().await?;
        check(resp).await?;
        Ok(())
    }

    pub async fn delete(&self, segments: &[&str]) -> Result<(), StoreError> {
        let resp = self.request(Method::DELETE, segments).send().await?;
        check(resp).await?;
        Ok(())
    }
}

/// Turn non-2xx responses into `StoreError::Status`.
async fn check(resp: Response) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}
