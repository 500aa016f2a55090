//! HTTP adapter for the external lookup service.
//!
//! The upstream is untrusted and possibly slow; every call is bounded by the
//! client-wide timeout and every failure (transport, status, decode) maps to
//! `Error::Upstream` so the gate leaves quota untouched.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use nlb_core::{
    lookup::{LookupClient, SubscriberRecord},
    term::CanonicalTerm,
    Error, Result,
};

#[derive(Clone, Debug)]
pub struct HttpLookupClient {
    api_url: String,
    api_key: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Vec<SubscriberRecord>,
}

impl HttpLookupClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("lookup http client: {e}")))?;

        Ok(Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            http,
        })
    }
}

#[async_trait]
impl LookupClient for HttpLookupClient {
    async fn fetch(&self, term: &CanonicalTerm) -> Result<Vec<SubscriberRecord>> {
        let resp = self
            .http
            .get(&self.api_url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("type", "mobile"),
                ("term", term.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("lookup request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "lookup returned status {}",
                resp.status()
            )));
        }

        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("lookup decode failed: {e}")))?;

        Ok(envelope.result)
    }
}
