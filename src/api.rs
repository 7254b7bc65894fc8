use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::protocol::{self, DEFAULT_BASE_URL};
use crate::types::{Device, FanState};
use crate::{Error, Result};

/// HTTP client for the Honeywell Home REST API.
///
/// Holds the bearer token in a shared slot so that an out-of-band OAuth
/// refresher can swap it without touching the sync engine: clone the
/// client, keep the clone, call [`ApiClient::set_access_token`] whenever
/// a new token is minted.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    token: Arc<RwLock<String>>,
}

impl ApiClient {
    pub fn new(access_token: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("honeywell-home/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            token: Arc::new(RwLock::new(access_token.into())),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Consumer key sent as the `apikey` query parameter, required by the
    /// hosted API (mock servers don't care).
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Install a freshly minted access token. Takes effect on the next
    /// request; in-flight requests keep the token they started with.
    pub fn set_access_token(&self, token: impl Into<String>) {
        *self.token.write().expect("token lock poisoned") = token.into();
    }

    pub async fn get_device(&self, device_id: &str, location_id: &str) -> Result<Device> {
        let url = format!("{}{}", self.base_url, protocol::thermostat_path(device_id));
        debug!(url = %url, "fetching device resource");
        let resp = self
            .with_params(self.http.get(&url), location_id)
            .send()
            .await?;
        Ok(Self::checked(resp).await?.json().await?)
    }

    pub async fn get_fan(&self, device_id: &str, location_id: &str) -> Result<FanState> {
        let url = format!("{}{}", self.base_url, protocol::fan_path(device_id));
        debug!(url = %url, "fetching fan sub-resource");
        let resp = self
            .with_params(self.http.get(&url), location_id)
            .send()
            .await?;
        Ok(Self::checked(resp).await?.json().await?)
    }

    pub async fn post_thermostat(
        &self,
        device_id: &str,
        location_id: &str,
        payload: &Value,
    ) -> Result<()> {
        let url = format!("{}{}", self.base_url, protocol::thermostat_path(device_id));
        debug!(url = %url, "pushing thermostat changes");
        let resp = self
            .with_params(self.http.post(&url), location_id)
            .json(payload)
            .send()
            .await?;
        Self::checked(resp).await?;
        Ok(())
    }

    pub async fn post_fan(
        &self,
        device_id: &str,
        location_id: &str,
        payload: &Value,
    ) -> Result<()> {
        let url = format!("{}{}", self.base_url, protocol::fan_path(device_id));
        debug!(url = %url, "pushing fan changes");
        let resp = self
            .with_params(self.http.post(&url), location_id)
            .json(payload)
            .send()
            .await?;
        Self::checked(resp).await?;
        Ok(())
    }

    fn with_params(
        &self,
        req: reqwest::RequestBuilder,
        location_id: &str,
    ) -> reqwest::RequestBuilder {
        let token = self.token.read().expect("token lock poisoned");
        let req = req
            .bearer_auth(&*token)
            .query(&[("locationId", location_id)]);
        match &self.api_key {
            Some(key) => req.query(&[("apikey", key)]),
            None => req,
        }
    }

    /// The API reports failures as non-2xx with a JSON body; surface the
    /// body text as the opaque error message.
    async fn checked(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(Error::Api {
            status: status.as_u16(),
            message,
        })
    }
}
