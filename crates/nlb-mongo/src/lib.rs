//! MongoDB adapter for the user store and the protected-term registry.
//!
//! All credit mutations are single-document conditional updates executed by
//! the server; there is no read-then-write anywhere in this crate.

use bson::doc;
use mongodb::{options::IndexOptions, Client, Collection, IndexModel};
use tracing::info;

use nlb_core::{Error, Result};

mod protected;
mod users;

pub use protected::{ProtectedDoc, PROTECTED_COLLECTION};
pub use users::{UserDoc, USER_COLLECTION};

/// Handle to the bot's MongoDB collections. Cheap to clone.
#[derive(Clone)]
pub struct MongoStore {
    pub(crate) users: Collection<UserDoc>,
    pub(crate) protected: Collection<ProtectedDoc>,
}

impl MongoStore {
    /// Connect, verify with a ping and apply indexes. Fails fast instead of
    /// hanging on an unreachable server.
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self> {
        let timeout_uri = if uri.contains('?') {
            format!("{uri}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000")
        } else {
            format!("{uri}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000")
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| Error::Store(format!("failed to connect to MongoDB: {e}")))?;

        let db = client.database(db_name);
        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| Error::Store(format!("MongoDB ping failed: {e}")))?;

        let store = Self {
            users: db.collection(USER_COLLECTION),
            protected: db.collection(PROTECTED_COLLECTION),
        };

        let term_unique = IndexModel::builder()
            .keys(doc! { "term": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .name("term_unique".to_string())
                    .build(),
            )
            .build();
        store
            .protected
            .create_index(term_unique)
            .await
            .map_err(|e| Error::Store(format!("failed to create indexes: {e}")))?;

        info!("connected to MongoDB database '{db_name}'");
        Ok(store)
    }
}

pub(crate) fn store_err(e: mongodb::error::Error) -> Error {
    Error::Store(e.to_string())
}
