//! Port for the external lookup service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{term::CanonicalTerm, Result};

/// One subscriber record as returned by the lookup service.
///
/// The schema is pass-through: fields the upstream omits stay `None` and are
/// dropped from the rendered reply.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubscriberRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub father_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_mobile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// External lookup service. Untrusted and possibly slow or unavailable;
/// implementations bound each call with a fixed timeout and map transport or
/// decode failures to `Error::Upstream`.
#[async_trait]
pub trait LookupClient: Send + Sync {
    async fn fetch(&self, term: &CanonicalTerm) -> Result<Vec<SubscriberRecord>>;
}
