use std::thread;
use tokio::sync::{mpsc, oneshot};
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use super::db::{Document, DocumentDb, Predicate};
use super::Record;

/// Commands sent to the store thread
pub enum StoreCommand {
    Insert(String, Value, oneshot::Sender<Result<i64>>),
    InsertUnless {
        collection: String,
        body: Value,
        matcher: Predicate,
        reply: oneshot::Sender<Result<Option<i64>>>,
    },
    All(String, oneshot::Sender<Result<Vec<Document>>>),
    Get(String, i64, oneshot::Sender<Result<Option<Document>>>),
    Update(String, i64, Value, oneshot::Sender<Result<bool>>),
    Remove(String, i64, oneshot::Sender<Result<bool>>),
    Search(String, Predicate, oneshot::Sender<Result<Vec<Document>>>),
    RemoveWhere(String, Predicate, oneshot::Sender<Result<usize>>),
    Count(String, oneshot::Sender<Result<usize>>),
    Shutdown,
}

/// Handle to interact with the document store. The SQLite connection lives
/// on a dedicated thread; every command runs there to completion, so a
/// single command is atomic with respect to all others.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn a new store thread owning the given database
    pub fn spawn(db: DocumentDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::Insert(collection, body, reply) => {
                        let _ = reply.send(db.insert(&collection, &body));
                    }
                    StoreCommand::InsertUnless { collection, body, matcher, reply } => {
                        let _ = reply.send(db.insert_unless(&collection, &body, &*matcher));
                    }
                    StoreCommand::All(collection, reply) => {
                        let _ = reply.send(db.all(&collection));
                    }
                    StoreCommand::Get(collection, id, reply) => {
                        let _ = reply.send(db.get(&collection, id));
                    }
                    StoreCommand::Update(collection, id, body, reply) => {
                        let _ = reply.send(db.update(&collection, id, &body));
                    }
                    StoreCommand::Remove(collection, id, reply) => {
                        let _ = reply.send(db.remove(&collection, id));
                    }
                    StoreCommand::Search(collection, matcher, reply) => {
                        let _ = reply.send(db.search(&collection, &*matcher));
                    }
                    StoreCommand::RemoveWhere(collection, matcher, reply) => {
                        let _ = reply.send(db.remove_where(&collection, &*matcher));
                    }
                    StoreCommand::Count(collection, reply) => {
                        let _ = reply.send(db.count(&collection));
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Open an in-memory store, used by tests
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::spawn(DocumentDb::open(":memory:").expect("in-memory database"))
    }

    pub async fn insert(&self, collection: &str, body: Value) -> Result<i64> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Insert(collection.to_string(), body, reply)).await?;
        rx.await?
    }

    /// Insert `body` unless a document matching `matcher` exists.
    /// The check and the insert run as one command.
    pub async fn insert_unless(
        &self,
        collection: &str,
        body: Value,
        matcher: Predicate,
    ) -> Result<Option<i64>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::InsertUnless {
            collection: collection.to_string(),
            body,
            matcher,
            reply,
        }).await?;
        rx.await?
    }

    pub async fn all(&self, collection: &str) -> Result<Vec<Document>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::All(collection.to_string(), reply)).await?;
        rx.await?
    }

    pub async fn get(&self, collection: &str, id: i64) -> Result<Option<Document>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Get(collection.to_string(), id, reply)).await?;
        rx.await?
    }

    pub async fn update(&self, collection: &str, id: i64, body: Value) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Update(collection.to_string(), id, body, reply)).await?;
        rx.await?
    }

    pub async fn remove(&self, collection: &str, id: i64) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Remove(collection.to_string(), id, reply)).await?;
        rx.await?
    }

    pub async fn search(&self, collection: &str, matcher: Predicate) -> Result<Vec<Document>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Search(collection.to_string(), matcher, reply)).await?;
        rx.await?
    }

    pub async fn remove_where(&self, collection: &str, matcher: Predicate) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::RemoveWhere(collection.to_string(), matcher, reply)).await?;
        rx.await?
    }

    pub async fn count(&self, collection: &str) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Count(collection.to_string(), reply)).await?;
        rx.await?
    }

    /// Insert a typed document
    pub async fn insert_record<T: Serialize>(&self, collection: &str, data: &T) -> Result<i64> {
        let body = serde_json::to_value(data).context("Failed to serialize record")?;
        self.insert(collection, body).await
    }

    /// Replace a typed document. Returns false if it does not exist.
    pub async fn update_record<T: Serialize>(&self, collection: &str, id: i64, data: &T) -> Result<bool> {
        let body = serde_json::to_value(data).context("Failed to serialize record")?;
        self.update(collection, id, body).await
    }

    /// All documents of a collection decoded as `T`. Documents that do not
    /// decode are skipped with a warning rather than failing the listing.
    pub async fn records<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<Record<T>>> {
        let records = self
            .all(collection)
            .await?
            .into_iter()
            .filter_map(|doc| decode(collection, doc))
            .collect();
        Ok(records)
    }

    pub async fn record<T: DeserializeOwned>(&self, collection: &str, id: i64) -> Result<Option<Record<T>>> {
        Ok(self.get(collection, id).await?.and_then(|doc| decode(collection, doc)))
    }

    /// Shutdown the store thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(StoreCommand::Shutdown).await?;
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(collection: &str, doc: Document) -> Option<Record<T>> {
    match serde_json::from_value(doc.body) {
        Ok(data) => Some(Record { id: doc.id, data }),
        Err(e) => {
            tracing::warn!("Skipping malformed document {} in {}: {}", doc.id, collection, e);
            None
        }
    }
}
