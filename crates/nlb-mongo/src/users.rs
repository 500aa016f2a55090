//! User quota documents.

use async_trait::async_trait;
use bson::{doc, Bson};
use chrono::NaiveDate;
use futures_util::stream::{BoxStream, StreamExt};
use mongodb::options::ReturnDocument;
use serde::{Deserialize, Serialize};

use nlb_core::{
    domain::{UserId, UserRecord},
    store::UserStore,
    Error, Result,
};

use crate::{store_err, MongoStore};

pub const USER_COLLECTION: &str = "users";

/// User document as stored in MongoDB.
///
/// `last_grant_date` is kept as an ISO `YYYY-MM-DD` string: the grant is a
/// calendar-date condition, and the string form compares and `$ne`-matches
/// without timezone anomalies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserDoc {
    #[serde(rename = "_id")]
    pub id: i64,
    pub credits: i64,
    #[serde(default)]
    pub unlimited: bool,
    #[serde(default)]
    pub last_grant_date: Option<String>,
    pub created_at: bson::DateTime,
}

impl UserDoc {
    pub fn into_record(self) -> UserRecord {
        UserRecord {
            id: UserId(self.id),
            credits: self.credits,
            unlimited: self.unlimited,
            last_grant_date: self.last_grant_date.and_then(|s| s.parse().ok()),
            created_at: self.created_at.to_chrono(),
        }
    }
}

#[async_trait]
impl UserStore for MongoStore {
    async fn get(&self, id: UserId) -> Result<Option<UserRecord>> {
        let doc = self
            .users
            .find_one(doc! { "_id": id.0 })
            .await
            .map_err(store_err)?;
        Ok(doc.map(UserDoc::into_record))
    }

    async fn create_if_absent(&self, id: UserId, initial_credits: i64) -> Result<UserRecord> {
        let update = doc! { "$setOnInsert": {
            "credits": initial_credits,
            "unlimited": false,
            "last_grant_date": Bson::Null,
            "created_at": bson::DateTime::now(),
        } };

        let doc = self
            .users
            .find_one_and_update(doc! { "_id": id.0 }, update)
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(store_err)?;

        doc.map(UserDoc::into_record)
            .ok_or_else(|| Error::Store("upsert returned no document".to_string()))
    }

    async fn consume_credit(&self, id: UserId) -> Result<Option<i64>> {
        let filter = doc! {
            "_id": id.0,
            "unlimited": { "$ne": true },
            "credits": { "$gt": 0 },
        };
        let update = doc! { "$inc": { "credits": -1 } };

        let updated = self
            .users
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .await
            .map_err(store_err)?;

        Ok(updated.map(|d| d.credits))
    }

    async fn grant_daily(&self, id: UserId, today: NaiveDate, amount: i64) -> Result<bool> {
        let today = today.format("%Y-%m-%d").to_string();
        // Missing and null both satisfy `$ne`, so never-granted users match.
        let filter = doc! { "_id": id.0, "last_grant_date": { "$ne": today.clone() } };
        let update = doc! {
            "$inc": { "credits": amount },
            "$set": { "last_grant_date": today },
        };

        let res = self
            .users
            .update_one(filter, update)
            .await
            .map_err(store_err)?;
        Ok(res.modified_count > 0)
    }

    async fn set_unlimited(&self, id: UserId, unlimited: bool) -> Result<()> {
        let update = doc! {
            "$set": { "unlimited": unlimited },
            "$setOnInsert": {
                "credits": 0i64,
                "last_grant_date": Bson::Null,
                "created_at": bson::DateTime::now(),
            },
        };
        self.users
            .update_one(doc! { "_id": id.0 }, update)
            .upsert(true)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn adjust_credits(&self, id: UserId, delta: i64) -> Result<()> {
        // Pipeline update so the clamp at 0 happens server-side in the same
        // atomic operation as the increment.
        let pipeline = vec![doc! { "$set": {
            "credits": { "$max": [0, { "$add": [ { "$ifNull": ["$credits", 0] }, delta ] }] },
            "unlimited": { "$ifNull": ["$unlimited", false] },
            "last_grant_date": { "$ifNull": ["$last_grant_date", Bson::Null] },
            "created_at": { "$ifNull": ["$created_at", "$$NOW"] },
        } }];

        self.users
            .update_one(doc! { "_id": id.0 }, pipeline)
            .upsert(true)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn all_users(&self) -> Result<BoxStream<'static, Result<UserRecord>>> {
        let cursor = self.users.find(doc! {}).await.map_err(store_err)?;
        Ok(cursor
            .map(|item| item.map(UserDoc::into_record).map_err(store_err))
            .boxed())
    }

    async fn count(&self) -> Result<u64> {
        self.users
            .count_documents(doc! {})
            .await
            .map_err(store_err)
    }
}
