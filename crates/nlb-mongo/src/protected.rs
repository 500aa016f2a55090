//! Protected-term registry documents.

use async_trait::async_trait;
use bson::{doc, oid::ObjectId};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};

use nlb_core::{store::ProtectedRegistry, Result};

use crate::{store_err, MongoStore};

pub const PROTECTED_COLLECTION: &str = "protected_terms";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtectedDoc {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub term: String,
}

#[async_trait]
impl ProtectedRegistry for MongoStore {
    async fn contains(&self, term: &str) -> Result<bool> {
        let found = self
            .protected
            .find_one(doc! { "term": term })
            .await
            .map_err(store_err)?;
        Ok(found.is_some())
    }

    async fn add(&self, term: &str) -> Result<bool> {
        // Upsert against the unique index; `upserted_id` tells us whether the
        // term was new.
        let res = self
            .protected
            .update_one(doc! { "term": term }, doc! { "$setOnInsert": { "term": term } })
            .upsert(true)
            .await
            .map_err(store_err)?;
        Ok(res.upserted_id.is_some())
    }

    async fn remove(&self, term: &str) -> Result<bool> {
        let res = self
            .protected
            .delete_one(doc! { "term": term })
            .await
            .map_err(store_err)?;
        Ok(res.deleted_count > 0)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let cursor = self.protected.find(doc! {}).await.map_err(store_err)?;
        let docs: Vec<ProtectedDoc> = cursor.try_collect().await.map_err(store_err)?;
        Ok(docs.into_iter().map(|d| d.term).collect())
    }
}
