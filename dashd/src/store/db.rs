use std::path::Path;
use anyhow::{Context, Result};
use rusqlite::{Connection, params, OptionalExtension};
use serde_json::Value;

/// Matcher used by predicate-based search and removal
pub type Predicate = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// A stored JSON document with its auto-assigned identifier
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: i64,
    pub body: Value,
}

/// Generic document table: every collection lives in one SQLite table,
/// documents are JSON bodies keyed by an auto-incrementing integer.
pub struct DocumentDb {
    conn: Connection,
}

impl DocumentDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                body       TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_collection ON documents(collection);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Insert a document, returning its new identifier
    pub fn insert(&self, collection: &str, body: &Value) -> Result<i64> {
        let json = serde_json::to_string(body).context("Failed to serialize document")?;

        self.conn.execute(
            "INSERT INTO documents (collection, body) VALUES (?1, ?2)",
            params![collection, json],
        )
        .with_context(|| format!("Failed to insert into {}", collection))?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Insert unless a document matching `matcher` already exists.
    /// Returns the new identifier, or None when a match was found.
    pub fn insert_unless(
        &self,
        collection: &str,
        body: &Value,
        matcher: &dyn Fn(&Value) -> bool,
    ) -> Result<Option<i64>> {
        if !self.search(collection, matcher)?.is_empty() {
            return Ok(None);
        }
        self.insert(collection, body).map(Some)
    }

    /// All documents of a collection in insertion order
    pub fn all(&self, collection: &str) -> Result<Vec<Document>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, body FROM documents WHERE collection = ?1 ORDER BY id")
            .context("Failed to prepare query")?;

        let documents = stmt
            .query_map([collection], |row| Self::row_to_document(row))
            .with_context(|| format!("Failed to query {}", collection))?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect documents")?;

        Ok(documents)
    }

    /// Get a single document by identifier
    pub fn get(&self, collection: &str, id: i64) -> Result<Option<Document>> {
        let result = self
            .conn
            .query_row(
                "SELECT id, body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| Self::row_to_document(row),
            )
            .optional()
            .context("Failed to query document")?;

        Ok(result)
    }

    /// Replace the body of a document. Returns false if it does not exist.
    pub fn update(&self, collection: &str, id: i64, body: &Value) -> Result<bool> {
        let json = serde_json::to_string(body).context("Failed to serialize document")?;

        let count = self.conn.execute(
            "UPDATE documents SET body = ?1 WHERE collection = ?2 AND id = ?3",
            params![json, collection, id],
        )
        .context("Failed to update document")?;

        Ok(count > 0)
    }

    /// Remove a document by identifier. Returns false if it did not exist.
    pub fn remove(&self, collection: &str, id: i64) -> Result<bool> {
        let count = self.conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )
        .context("Failed to remove document")?;

        Ok(count > 0)
    }

    /// Documents for which `matcher` returns true
    pub fn search(&self, collection: &str, matcher: &dyn Fn(&Value) -> bool) -> Result<Vec<Document>> {
        let documents = self
            .all(collection)?
            .into_iter()
            .filter(|doc| matcher(&doc.body))
            .collect();
        Ok(documents)
    }

    /// Remove every document matching `matcher`, returning how many were removed
    pub fn remove_where(&self, collection: &str, matcher: &dyn Fn(&Value) -> bool) -> Result<usize> {
        let mut removed = 0;
        for doc in self.search(collection, matcher)? {
            if self.remove(collection, doc.id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .context("Failed to count documents")?;

        Ok(count as usize)
    }

    fn row_to_document(row: &rusqlite::Row) -> Result<Document, rusqlite::Error> {
        let body_json: String = row.get(1)?;

        let body = serde_json::from_str(&body_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?;

        Ok(Document {
            id: row.get(0)?,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn is_named(name: &'static str) -> impl Fn(&Value) -> bool {
        move |v| v.get("name").and_then(Value::as_str) == Some(name)
    }

    #[test]
    fn test_insert_and_get() {
        let db = DocumentDb::open(":memory:").unwrap();

        let id = db.insert("todos", &json!({"content": "water plants"})).unwrap();
        let doc = db.get("todos", id).unwrap().unwrap();
        assert_eq!(doc.body["content"], "water plants");

        // Identifiers are scoped to a collection on lookup
        assert!(db.get("links", id).unwrap().is_none());
    }

    #[test]
    fn test_ids_are_not_reused() {
        let db = DocumentDb::open(":memory:").unwrap();

        let first = db.insert("todos", &json!({"content": "a"})).unwrap();
        assert!(db.remove("todos", first).unwrap());
        let second = db.insert("todos", &json!({"content": "b"})).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_update_and_remove_missing() {
        let db = DocumentDb::open(":memory:").unwrap();

        assert!(!db.update("todos", 42, &json!({})).unwrap());
        assert!(!db.remove("todos", 42).unwrap());

        let id = db.insert("todos", &json!({"content": "a"})).unwrap();
        assert!(db.update("todos", id, &json!({"content": "b"})).unwrap());
        assert_eq!(db.get("todos", id).unwrap().unwrap().body["content"], "b");
    }

    #[test]
    fn test_insert_unless_existing() {
        let db = DocumentDb::open(":memory:").unwrap();
        let body = json!({"name": "nginx.service"});

        assert!(db.insert_unless("pins", &body, &is_named("nginx.service")).unwrap().is_some());
        assert!(db.insert_unless("pins", &body, &is_named("nginx.service")).unwrap().is_none());
        assert_eq!(db.count("pins").unwrap(), 1);
    }

    #[test]
    fn test_search_and_remove_where() {
        let db = DocumentDb::open(":memory:").unwrap();
        db.insert("pins", &json!({"name": "a"})).unwrap();
        db.insert("pins", &json!({"name": "b"})).unwrap();
        db.insert("pins", &json!({"name": "a"})).unwrap();

        assert_eq!(db.search("pins", &is_named("a")).unwrap().len(), 2);
        assert_eq!(db.remove_where("pins", &is_named("a")).unwrap(), 2);
        assert_eq!(db.remove_where("pins", &is_named("a")).unwrap(), 0);

        let remaining = db.all("pins").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].body["name"], "b");
    }
}
