use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::future::BoxFuture;
use reqwest::{Client, Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::from_value;
use uuid::Uuid;

use crate::dao::{
    models::{EventEntity, NewEvent, NewSession, SessionEntity},
    storage::{
        ACTIVE_SESSION_CONSTRAINT, IDEMPOTENCY_KEY_CONSTRAINT, SESSION_KEY_CONSTRAINT,
        StorageResult,
    },
    tracking_store::{TrackingStore, event_order},
};

use super::{
    config::CouchConfig,
    error::{CouchDaoError, CouchResult},
    models::{
        AllDocsResponse, CouchEventDocument, CouchPointerDocument, CouchSessionDocument,
        END_SUFFIX, SESSION_PREFIX, active_session_doc_id, event_prefix, idempotency_doc_id,
        session_doc_id, session_key_doc_id,
    },
};

const MAX_REVISION_RETRIES: u32 = 8;
/// How long a pointer whose target document does not exist yet is treated as in flight.
const CLAIM_GRACE: Duration = Duration::from_secs(60);

/// What a pointer's target looks like when another writer wants the same claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    /// Target not written yet, or lost by a writer that crashed mid-insert.
    Missing,
    /// Active session or live event.
    Holding,
    /// Completed session or retracted event whose pointer was not released.
    Released,
}

fn may_reclaim(holder: Holder, pointer: &CouchPointerDocument, now: SystemTime) -> bool {
    match holder {
        Holder::Holding => false,
        Holder::Released => true,
        Holder::Missing => pointer.age(now) >= CLAIM_GRACE,
    }
}

/// [`TrackingStore`] backed by a CouchDB database.
#[derive(Clone)]
pub struct CouchTrackingStore {
    client: Client,
    base_url: Arc<str>,
    database: Arc<str>,
    auth: Option<(Arc<str>, Arc<str>)>,
}

impl CouchTrackingStore {
    /// Establish a connection to CouchDB and ensure the database exists.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| CouchDaoError::ClientBuilder { source })?;

        let base_url = Arc::<str>::from(config.base_url.trim_end_matches('/'));
        let database = Arc::<str>::from(config.database);
        let auth = config
            .username
            .zip(config.password)
            .map(|(u, p)| (Arc::<str>::from(u), Arc::<str>::from(p)));

        let store = Self {
            client,
            base_url,
            database,
            auth,
        };

        store.ensure_database().await?;
        Ok(store)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}/{}", self.base_url, self.database, path);
        self.authenticated(self.client.request(method, url))
    }

    fn authenticated(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth {
            Some((ref user, ref pass)) => builder.basic_auth(user.as_ref(), Some(pass.as_ref())),
            None => builder,
        }
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let database = self.database.to_string();
        let url = format!("{}/{}", self.base_url, self.database);

        let response = self
            .authenticated(self.client.get(&url))
            .send()
            .await
            .map_err(|source| CouchDaoError::DatabaseQuery {
                database: database.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                let create = self
                    .authenticated(self.client.put(&url))
                    .send()
                    .await
                    .map_err(|source| CouchDaoError::DatabaseCreate {
                        database: database.clone(),
                        source,
                    })?;
                // 412 means a concurrent instance created it first.
                if create.status().is_success() || create.status() == StatusCode::PRECONDITION_FAILED {
                    Ok(())
                } else {
                    Err(CouchDaoError::DatabaseStatus {
                        database,
                        status: create.status(),
                    })
                }
            }
            other => Err(CouchDaoError::DatabaseStatus {
                database,
                status: other,
            }),
        }
    }

    async fn get_document<T>(&self, doc_id: &str) -> CouchResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let response = self
            .request(Method::GET, doc_id)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                response.json::<T>().await.map(Some).map_err(|source| {
                    CouchDaoError::DecodeResponse {
                        path: doc_id.to_string(),
                        source,
                    }
                })
            }
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn put_document<T>(&self, doc_id: &str, document: &T) -> CouchResult<()>
    where
        T: ?Sized + Serialize,
    {
        let response = self
            .request(Method::PUT, doc_id)
            .json(document)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(CouchDaoError::DocumentConflict {
                path: doc_id.to_string(),
            }),
            status => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status,
            }),
        }
    }

    async fn delete_document(&self, doc_id: &str, rev: &str) -> CouchResult<()> {
        let response = self
            .request(Method::DELETE, doc_id)
            .query(&[("rev", rev)])
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            StatusCode::CONFLICT => Err(CouchDaoError::DocumentConflict {
                path: doc_id.to_string(),
            }),
            status => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status,
            }),
        }
    }

    async fn list_documents<T>(&self, prefix: &str) -> CouchResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        const ALL_DOCS: &str = "_all_docs";
        let query = [
            ("include_docs", "true".to_string()),
            ("startkey", format!("\"{}\"", prefix)),
            ("endkey", format!("\"{}{}\"", prefix, END_SUFFIX)),
        ];

        let response = self
            .request(Method::GET, ALL_DOCS)
            .query(&query)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: ALL_DOCS.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: ALL_DOCS.to_string(),
                status: response.status(),
            });
        }

        let payload = response.json::<AllDocsResponse>().await.map_err(|source| {
            CouchDaoError::DecodeResponse {
                path: ALL_DOCS.to_string(),
                source,
            }
        })?;

        let mut documents = Vec::new();
        for row in payload.rows {
            if let Some(doc) = row.doc {
                let parsed = from_value(doc).map_err(|source| CouchDaoError::DeserializeValue {
                    path: row.id.clone(),
                    source,
                })?;
                documents.push(parsed);
            }
        }

        Ok(documents)
    }

    /// Create a pointer document, reporting an existing one as a claimed constraint.
    async fn claim(&self, doc_id: &str, target: Uuid, constraint: &'static str) -> CouchResult<()> {
        let pointer = CouchPointerDocument::new(doc_id.to_string(), target);
        match self.put_document(doc_id, &pointer).await {
            Err(CouchDaoError::DocumentConflict { .. }) => {
                Err(CouchDaoError::ConstraintClaimed { constraint })
            }
            other => other,
        }
    }

    /// Delete a pointer document if it still references `target`.
    async fn release(&self, doc_id: &str, target: Uuid) -> CouchResult<()> {
        let Some(pointer) = self.get_document::<CouchPointerDocument>(doc_id).await? else {
            return Ok(());
        };
        match pointer.rev {
            Some(rev) if pointer.target == target => self.delete_document(doc_id, &rev).await,
            _ => Ok(()),
        }
    }

    /// Claim the active slot of an event, reclaiming it when the holder is no longer active.
    async fn claim_active_slot(&self, event_id: i64, session_id: Uuid) -> CouchResult<()> {
        let doc_id = active_session_doc_id(event_id);
        match self.claim(&doc_id, session_id, ACTIVE_SESSION_CONSTRAINT).await {
            Err(CouchDaoError::ConstraintClaimed { constraint }) => {
                let Some(pointer) = self.get_document::<CouchPointerDocument>(&doc_id).await? else {
                    return self.claim(&doc_id, session_id, constraint).await;
                };
                let holder = match self
                    .get_document::<CouchSessionDocument>(&session_doc_id(pointer.target))
                    .await?
                {
                    None => Holder::Missing,
                    Some(doc) if doc.session.is_active => Holder::Holding,
                    Some(_) => Holder::Released,
                };
                if !may_reclaim(holder, &pointer, SystemTime::now()) {
                    return Err(CouchDaoError::ConstraintClaimed { constraint });
                }
                self.release(&doc_id, pointer.target).await?;
                self.claim(&doc_id, session_id, constraint).await
            }
            other => other,
        }
    }

    /// Claim an idempotency key, reclaiming it when the holder was retracted or abandoned.
    async fn claim_idempotency_key(&self, session_id: Uuid, key: &str, event_id: Uuid) -> CouchResult<()> {
        let doc_id = idempotency_doc_id(session_id, key);
        match self.claim(&doc_id, event_id, IDEMPOTENCY_KEY_CONSTRAINT).await {
            Err(CouchDaoError::ConstraintClaimed { constraint }) => {
                let Some(pointer) = self.get_document::<CouchPointerDocument>(&doc_id).await? else {
                    return self.claim(&doc_id, event_id, constraint).await;
                };
                let holder = match self.find_event_document(session_id, pointer.target).await? {
                    None => Holder::Missing,
                    Some(doc) if doc.event.is_live() => Holder::Holding,
                    Some(_) => Holder::Released,
                };
                if !may_reclaim(holder, &pointer, SystemTime::now()) {
                    return Err(CouchDaoError::ConstraintClaimed { constraint });
                }
                self.release(&doc_id, pointer.target).await?;
                self.claim(&doc_id, event_id, constraint).await
            }
            other => other,
        }
    }

    /// Read-modify-write a session document under optimistic revision control.
    ///
    /// `mutate` returns `false` when the document needs no change.
    async fn update_session<F>(&self, id: Uuid, mut mutate: F) -> CouchResult<Option<SessionEntity>>
    where
        F: FnMut(&mut SessionEntity) -> bool,
    {
        let doc_id = session_doc_id(id);
        for _ in 0..MAX_REVISION_RETRIES {
            let Some(mut document) = self.get_document::<CouchSessionDocument>(&doc_id).await?
            else {
                return Ok(None);
            };
            if !mutate(&mut document.session) {
                return Ok(Some(document.session));
            }
            match self.put_document(&doc_id, &document).await {
                Ok(()) => return Ok(Some(document.session)),
                Err(CouchDaoError::DocumentConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(CouchDaoError::RevisionRetriesExhausted {
            path: doc_id,
            attempts: MAX_REVISION_RETRIES,
        })
    }

    async fn find_session(&self, id: Uuid) -> CouchResult<Option<SessionEntity>> {
        Ok(self
            .get_document::<CouchSessionDocument>(&session_doc_id(id))
            .await?
            .map(|document| document.session))
    }

    async fn find_session_through(&self, pointer_id: &str) -> CouchResult<Option<SessionEntity>> {
        match self.get_document::<CouchPointerDocument>(pointer_id).await? {
            Some(pointer) => self.find_session(pointer.target).await,
            None => Ok(None),
        }
    }

    async fn find_event_document(
        &self,
        session_id: Uuid,
        event_id: Uuid,
    ) -> CouchResult<Option<CouchEventDocument>> {
        let documents = self
            .list_documents::<CouchEventDocument>(&event_prefix(session_id))
            .await?;
        Ok(documents
            .into_iter()
            .find(|document| document.event.id == event_id))
    }

    async fn create_session(&self, session: NewSession) -> CouchResult<SessionEntity> {
        let entity = session.into_entity(Uuid::new_v4(), SystemTime::now());
        let key_doc = session_key_doc_id(&entity.session_key);
        self.claim(&key_doc, entity.id, SESSION_KEY_CONSTRAINT).await?;

        if let Err(err) = self.claim_active_slot(entity.event_id, entity.id).await {
            // The session never existed, so its key may be claimed again.
            self.release(&key_doc, entity.id).await?;
            return Err(err);
        }

        self.put_document(&session_doc_id(entity.id), &CouchSessionDocument::new(entity.clone()))
            .await?;
        Ok(entity)
    }

    async fn complete_session(&self, id: Uuid, ended_at: SystemTime) -> CouchResult<Option<SessionEntity>> {
        let updated = self
            .update_session(id, |session| {
                if !session.is_active {
                    return false;
                }
                session.is_active = false;
                session.ended_at = Some(ended_at);
                true
            })
            .await?;

        if let Some(ref session) = updated {
            self.release(&active_session_doc_id(session.event_id), session.id)
                .await?;
        }
        Ok(updated)
    }

    async fn insert_event(&self, event: NewEvent) -> CouchResult<EventEntity> {
        let session_id = event.session_id;
        let event_id = Uuid::new_v4();
        let idempotency_doc = event
            .client_idempotency_key
            .as_deref()
            .map(|key| idempotency_doc_id(session_id, key));
        if let Some(key) = event.client_idempotency_key.as_deref() {
            self.claim_idempotency_key(session_id, key, event_id).await?;
        }

        let result = async {
            let session = self
                .update_session(session_id, |session| {
                    session.next_sequence += 1;
                    true
                })
                .await?
                .ok_or_else(|| CouchDaoError::RequestStatus {
                    path: session_doc_id(session_id),
                    status: StatusCode::NOT_FOUND,
                })?;

            let entity = event.into_entity(event_id, session.next_sequence, SystemTime::now());
            let document = CouchEventDocument::new(entity.clone());
            self.put_document(&document.id, &document).await?;
            Ok(entity)
        }
        .await;

        if result.is_err() {
            if let Some(doc_id) = idempotency_doc {
                self.release(&doc_id, event_id).await?;
            }
        }
        result
    }

    async fn soft_delete_event(
        &self,
        session_id: Uuid,
        event_id: Uuid,
        deleted_at: SystemTime,
    ) -> CouchResult<Option<EventEntity>> {
        for _ in 0..MAX_REVISION_RETRIES {
            let Some(mut document) = self.find_event_document(session_id, event_id).await? else {
                return Ok(None);
            };
            if document.event.deleted_at.is_some() {
                return Ok(Some(document.event));
            }

            document.event.deleted_at = Some(deleted_at);
            match self.put_document(&document.id, &document).await {
                Ok(()) => {
                    if let Some(key) = document.event.client_idempotency_key.as_deref() {
                        self.release(&idempotency_doc_id(session_id, key), event_id)
                            .await?;
                    }
                    return Ok(Some(document.event));
                }
                Err(CouchDaoError::DocumentConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(CouchDaoError::RevisionRetriesExhausted {
            path: event_id.to_string(),
            attempts: MAX_REVISION_RETRIES,
        })
    }

    async fn list_events(&self, session_id: Uuid, include_deleted: bool) -> CouchResult<Vec<EventEntity>> {
        let mut events = self
            .list_documents::<CouchEventDocument>(&event_prefix(session_id))
            .await?
            .into_iter()
            .map(|document| document.event)
            .filter(|event| include_deleted || event.is_live())
            .collect::<Vec<_>>();
        events.sort_by(event_order);
        Ok(events)
    }

    async fn list_completed_sessions(&self) -> CouchResult<Vec<SessionEntity>> {
        let mut sessions = self
            .list_documents::<CouchSessionDocument>(SESSION_PREFIX)
            .await?
            .into_iter()
            .map(|document| document.session)
            .filter(|session| !session.is_active)
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }
}

impl TrackingStore for CouchTrackingStore {
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
            store
                .complete_session(id, ended_at)
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
            store
                .update_session(id, |session| {
                    if session.derived_game_id.is_some() {
                        return false;
                    }
                    session.derived_game_id = Some(game_id);
                    true
                })
                .await
                .map_err(Into::into)
        })
    }

    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_session(id).await.map_err(Into::into) })
    }

    fn find_active_session_by_event(
        &self,
        event_id: i64,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let session = store
                .find_session_through(&active_session_doc_id(event_id))
                .await?;
            // A stale pointer left by an interrupted completion does not count.
            Ok(session.filter(|session| session.is_active))
        })
    }

    fn find_session_by_key(
        &self,
        session_key: String,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_session_through(&session_key_doc_id(&session_key))
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
            Ok(store
                .find_event_document(session_id, event_id)
                .await?
                .map(|document| document.event))
        })
    }

    fn find_event_by_idempotency_key(
        &self,
        session_id: Uuid,
        key: String,
    ) -> BoxFuture<'static, StorageResult<Option<EventEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let Some(pointer) = store
                .get_document::<CouchPointerDocument>(&idempotency_doc_id(session_id, &key))
                .await?
            else {
                return Ok(None);
            };
            Ok(store
                .find_event_document(session_id, pointer.target)
                .await?
                .map(|document| document.event)
                .filter(EventEntity::is_live))
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
        Box::pin(async move {
            let url = format!("{}/{}", store.base_url, store.database);
            let response = store
                .authenticated(store.client.get(&url))
                .send()
                .await
                .map_err(|source| CouchDaoError::RequestSend {
                    path: url.clone(),
                    source,
                })?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(CouchDaoError::RequestStatus {
                    path: url,
                    status: response.status(),
                }
                .into())
            }
        })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_database().await.map_err(Into::into) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pointer_claimed(ago: Duration, now: SystemTime) -> CouchPointerDocument {
        CouchPointerDocument::claimed_at("active::16".into(), Uuid::new_v4(), now - ago)
    }

    #[test]
    fn claim_with_unwritten_target_is_held_during_grace() {
        let now = SystemTime::now();
        let fresh = pointer_claimed(Duration::from_millis(5), now);
        assert!(!may_reclaim(Holder::Missing, &fresh, now));

        let abandoned = pointer_claimed(CLAIM_GRACE + Duration::from_secs(1), now);
        assert!(may_reclaim(Holder::Missing, &abandoned, now));
    }

    #[test]
    fn live_holders_keep_their_claim_released_ones_lose_it() {
        let now = SystemTime::now();
        let old = pointer_claimed(CLAIM_GRACE * 10, now);
        assert!(!may_reclaim(Holder::Holding, &old, now));

        let fresh = pointer_claimed(Duration::ZERO, now);
        assert!(may_reclaim(Holder::Released, &fresh, now));
    }

    #[test]
    fn pointers_without_a_timestamp_count_as_old() {
        let legacy: CouchPointerDocument = serde_json::from_value(serde_json::json!({
            "_id": "idem::x::abc",
            "_rev": "1-a",
            "target": Uuid::nil(),
        }))
        .unwrap();
        assert_eq!(legacy.claimed_at_ms, 0);
        assert!(may_reclaim(Holder::Missing, &legacy, SystemTime::now()));
    }
}
