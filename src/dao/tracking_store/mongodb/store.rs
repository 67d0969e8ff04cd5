use std::{sync::Arc, time::SystemTime};

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Client, Collection, Database, IndexModel,
    bson::{DateTime, Document, doc},
    error::Error as MongoError,
    options::{IndexOptions, ReturnDocument},
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult, duplicate_index},
    models::{MongoEventDocument, MongoSessionDocument, doc_id},
};
use crate::dao::{
    models::{EventEntity, NewEvent, NewSession, SessionEntity},
    storage::{
        ACTIVE_SESSION_CONSTRAINT, IDEMPOTENCY_KEY_CONSTRAINT, SESSION_KEY_CONSTRAINT,
        StorageResult,
    },
    tracking_store::TrackingStore,
};

const SESSION_COLLECTION_NAME: &str = "sessions";
const EVENT_COLLECTION_NAME: &str = "events";

/// [`TrackingStore`] backed by MongoDB collections.
#[derive(Clone)]
pub struct MongoTrackingStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    #[allow(dead_code)]
    client: Client,
    database: Database,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        Ok(())
    }
}

impl MongoTrackingStore {
    /// Establish a connection to MongoDB and ensure the constraint indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) =
            establish_connection(&config.options, &config.database_name).await?;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState { client, database }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let sessions = self.sessions().await;
        let session_indexes = [
            (
                SESSION_KEY_CONSTRAINT,
                doc! {"session_key": 1},
                None::<Document>,
            ),
            (
                ACTIVE_SESSION_CONSTRAINT,
                doc! {"event_id": 1},
                Some(doc! {"is_active": true}),
            ),
        ];
        for (name, keys, partial) in session_indexes {
            create_unique_index(&sessions, SESSION_COLLECTION_NAME, name, keys, partial).await?;
        }

        let events = self.events().await;
        create_unique_index(
            &events,
            EVENT_COLLECTION_NAME,
            IDEMPOTENCY_KEY_CONSTRAINT,
            doc! {"session_id": 1, "client_idempotency_key": 1},
            Some(doc! {"live": true, "client_idempotency_key": {"$type": "string"}}),
        )
        .await?;

        let order_index = IndexModel::builder()
            .keys(doc! {"session_id": 1, "created_at": 1, "sequence": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("event_order_idx".to_owned()))
                    .build(),
            )
            .build();
        events
            .create_index(order_index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: EVENT_COLLECTION_NAME,
                index: "event_order_idx",
                source,
            })?;

        Ok(())
    }

    async fn sessions(&self) -> Collection<MongoSessionDocument> {
        let guard = self.inner.state.read().await;
        guard
            .database
            .collection::<MongoSessionDocument>(SESSION_COLLECTION_NAME)
    }

    async fn events(&self) -> Collection<MongoEventDocument> {
        let guard = self.inner.state.read().await;
        guard
            .database
            .collection::<MongoEventDocument>(EVENT_COLLECTION_NAME)
    }

    async fn find_session_by(&self, filter: Document, label: String) -> MongoResult<Option<SessionEntity>> {
        self.sessions()
            .await
            .find_one(filter)
            .await
            .map_err(|source| MongoDaoError::LoadSession { id: label, source })?
            .map(SessionEntity::try_from)
            .transpose()
    }

    async fn update_session(
        &self,
        id: Uuid,
        filter: Document,
        update: Document,
    ) -> MongoResult<Option<SessionEntity>> {
        let updated = self
            .sessions()
            .await
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|source| MongoDaoError::SaveSession {
                id: id.to_string(),
                source,
            })?;

        match updated {
            Some(document) => Ok(Some(document.try_into()?)),
            // Guard in the filter did not match: report the row as it currently stands.
            None => self.find_session_by(doc_id(id), id.to_string()).await,
        }
    }

    async fn create_session(&self, session: NewSession) -> MongoResult<SessionEntity> {
        let entity = session.into_entity(Uuid::new_v4(), SystemTime::now());
        let document: MongoSessionDocument = entity.clone().into();
        self.sessions()
            .await
            .insert_one(&document)
            .await
            .map_err(|source| {
                classify_write(source, |source| MongoDaoError::SaveSession {
                    id: entity.id.to_string(),
                    source,
                })
            })?;
        Ok(entity)
    }

    async fn insert_event(&self, event: NewEvent) -> MongoResult<EventEntity> {
        let session_id = event.session_id;
        let counter = self
            .sessions()
            .await
            .find_one_and_update(doc_id(session_id), doc! {"$inc": {"next_sequence": 1_i64}})
            .return_document(ReturnDocument::After)
            .await
            .map_err(|source| MongoDaoError::SaveEvent {
                session_id: session_id.to_string(),
                source,
            })?
            .ok_or_else(|| MongoDaoError::InvalidDocument {
                id: session_id.to_string(),
                reason: "session vanished while allocating an event sequence".into(),
            })?;

        let entity = event.into_entity(
            Uuid::new_v4(),
            counter.next_sequence.max(0) as u64,
            SystemTime::now(),
        );
        let document: MongoEventDocument = entity.clone().into();
        self.events()
            .await
            .insert_one(&document)
            .await
            .map_err(|source| {
                classify_write(source, |source| MongoDaoError::SaveEvent {
                    session_id: session_id.to_string(),
                    source,
                })
            })?;
        Ok(entity)
    }

    async fn find_event_by(&self, session_id: Uuid, filter: Document) -> MongoResult<Option<EventEntity>> {
        self.events()
            .await
            .find_one(filter)
            .await
            .map_err(|source| MongoDaoError::LoadEvents {
                session_id: session_id.to_string(),
                source,
            })?
            .map(EventEntity::try_from)
            .transpose()
    }

    async fn soft_delete_event(
        &self,
        session_id: Uuid,
        event_id: Uuid,
        deleted_at: SystemTime,
    ) -> MongoResult<Option<EventEntity>> {
        let filter = doc! {
            "_id": event_id.to_string(),
            "session_id": session_id.to_string(),
            "live": true,
        };
        let update = doc! {
            "$set": {"live": false, "deleted_at": DateTime::from_system_time(deleted_at)}
        };
        let updated = self
            .events()
            .await
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|source| MongoDaoError::SaveEvent {
                session_id: session_id.to_string(),
                source,
            })?;

        match updated {
            Some(document) => Ok(Some(document.try_into()?)),
            None => {
                self.find_event_by(
                    session_id,
                    doc! {"_id": event_id.to_string(), "session_id": session_id.to_string()},
                )
                .await
            }
        }
    }

    async fn list_events(&self, session_id: Uuid, include_deleted: bool) -> MongoResult<Vec<EventEntity>> {
        let mut filter = doc! {"session_id": session_id.to_string()};
        if !include_deleted {
            filter.insert("live", true);
        }

        let documents: Vec<MongoEventDocument> = self
            .events()
            .await
            .find(filter)
            .sort(doc! {"created_at": 1, "sequence": 1, "_id": 1})
            .await
            .map_err(|source| MongoDaoError::LoadEvents {
                session_id: session_id.to_string(),
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::LoadEvents {
                session_id: session_id.to_string(),
                source,
            })?;

        documents.into_iter().map(EventEntity::try_from).collect()
    }

    async fn list_completed_sessions(&self) -> MongoResult<Vec<SessionEntity>> {
        let documents: Vec<MongoSessionDocument> = self
            .sessions()
            .await
            .find(doc! {"is_active": false})
            .sort(doc! {"started_at": 1, "_id": 1})
            .await
            .map_err(|source| MongoDaoError::ListSessions { source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::ListSessions { source })?;

        documents.into_iter().map(SessionEntity::try_from).collect()
    }
}

async fn create_unique_index<T>(
    collection: &Collection<T>,
    collection_name: &'static str,
    name: &'static str,
    keys: Document,
    partial: Option<Document>,
) -> MongoResult<()>
where
    T: Send + Sync,
{
    let index = IndexModel::builder()
        .keys(keys)
        .options(
            IndexOptions::builder()
                .name(Some(name.to_owned()))
                .unique(Some(true))
                .partial_filter_expression(partial)
                .build(),
        )
        .build();

    collection
        .create_index(index)
        .await
        .map_err(|source| MongoDaoError::EnsureIndex {
            collection: collection_name,
            index: name,
            source,
        })?;
    Ok(())
}

/// Turn duplicate-key write errors into constraint conflicts, wrapping anything else.
fn classify_write(
    source: MongoError,
    wrap: impl FnOnce(MongoError) -> MongoDaoError,
) -> MongoDaoError {
    let constraint = duplicate_index(&source).map(|message| {
        [
            ACTIVE_SESSION_CONSTRAINT,
            IDEMPOTENCY_KEY_CONSTRAINT,
            SESSION_KEY_CONSTRAINT,
        ]
        .into_iter()
        .find(|name| message.contains(name))
        .unwrap_or(SESSION_KEY_CONSTRAINT)
    });

    match constraint {
        Some(constraint) => MongoDaoError::Duplicate { constraint },
        None => wrap(source),
    }
}

impl TrackingStore for MongoTrackingStore {
    fn create_session(&self, session: NewSession) -> BoxFuture<'static, StorageResult<SessionEntity>> {
        let store = self.clone();
        Box::pin(async move { store.create_session(session).await.map_err(Into::into) })
    }

    fn complete_session(
        &self,
        id: Uuid,
        ended_at: SystemTime,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let filter = doc! {"_id": id.to_string(), "is_active": true};
            let update = doc! {
                "$set": {"is_active": false, "ended_at": DateTime::from_system_time(ended_at)}
            };
            store
                .update_session(id, filter, update)
                .await
                .map_err(Into::into)
        })
    }

    fn attach_game(
        &self,
        id: Uuid,
        game_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let filter = doc! {"_id": id.to_string(), "derived_game_id": null};
            let update = doc! {"$set": {"derived_game_id": game_id.to_string()}};
            store
                .update_session(id, filter, update)
                .await
                .map_err(Into::into)
        })
    }

    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_session_by(doc_id(id), id.to_string())
                .await
                .map_err(Into::into)
        })
    }

    fn find_active_session_by_event(
        &self,
        event_id: i64,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_session_by(
                    doc! {"event_id": event_id, "is_active": true},
                    format!("active for event {event_id}"),
                )
                .await
                .map_err(Into::into)
        })
    }

    fn find_session_by_key(
        &self,
        session_key: String,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let label = format!("key {session_key}");
            store
                .find_session_by(doc! {"session_key": session_key}, label)
                .await
                .map_err(Into::into)
        })
    }

    fn list_completed_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list_completed_sessions().await.map_err(Into::into) })
    }

    fn insert_event(&self, event: NewEvent) -> BoxFuture<'static, StorageResult<EventEntity>> {
        let store = self.clone();
        Box::pin(async move { store.insert_event(event).await.map_err(Into::into) })
    }

    fn find_event(
        &self,
        session_id: Uuid,
        event_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<EventEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_event_by(
                    session_id,
                    doc! {"_id": event_id.to_string(), "session_id": session_id.to_string()},
                )
                .await
                .map_err(Into::into)
        })
    }

    fn find_event_by_idempotency_key(
        &self,
        session_id: Uuid,
        key: String,
    ) -> BoxFuture<'static, StorageResult<Option<EventEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_event_by(
                    session_id,
                    doc! {
                        "session_id": session_id.to_string(),
                        "client_idempotency_key": key,
                        "live": true,
                    },
                )
                .await
                .map_err(Into::into)
        })
    }

    fn soft_delete_event(
        &self,
        session_id: Uuid,
        event_id: Uuid,
        deleted_at: SystemTime,
    ) -> BoxFuture<'static, StorageResult<Option<EventEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .soft_delete_event(session_id, event_id, deleted_at)
                .await
                .map_err(Into::into)
        })
    }

    fn list_events(
        &self,
        session_id: Uuid,
        include_deleted: bool,
    ) -> BoxFuture<'static, StorageResult<Vec<EventEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .list_events(session_id, include_deleted)
                .await
                .map_err(Into::into)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
