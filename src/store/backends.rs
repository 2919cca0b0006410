use sqlx::Row;

use super::{schema, Store, StoreResult};

/// One observed Clash-compatible router.
#[derive(Debug, Clone)]
pub struct Backend {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub token: Option<String>,
    pub enabled: bool,
    pub listening: bool,
    pub is_active: bool,
    pub created_at_ms: i64,
}

/// Creation payload.
#[derive(Debug, Clone)]
pub struct NewBackend {
    pub name: String,
    pub url: String,
    pub token: Option<String>,
}

/// Partial update; `None` fields are left untouched. `token` uses a
/// double option so an explicit null clears the stored credential.
#[derive(Debug, Clone, Default)]
pub struct BackendPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub token: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub listening: Option<bool>,
}

fn backend_from_row(row: &sqlx::sqlite::SqliteRow) -> Backend {
    Backend {
        id: row.get("id"),
        name: row.get("name"),
        url: row.get("url"),
        token: row.get("token"),
        enabled: row.get::<i64, _>("enabled") != 0,
        listening: row.get::<i64, _>("listening") != 0,
        is_active: row.get::<i64, _>("is_active") != 0,
        created_at_ms: row.get("created_at"),
    }
}

const BACKEND_COLS: &str = "id, name, url, token, enabled, listening, is_active, created_at";

impl Store {
    /// Creates a backend. The first backend in an empty table becomes
    /// active. Duplicate names surface as a constraint error.
    pub async fn create_backend(&self, new: &NewBackend, now_ms: i64) -> StoreResult<Backend> {
        let mut tx = self.pool().begin().await?;

        let (existing,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM backends")
            .fetch_one(&mut *tx)
            .await?;
        let is_active = existing == 0;

        let result = sqlx::query(
            "INSERT INTO backends (name, url, token, enabled, listening, is_active, created_at) \
             VALUES (?, ?, ?, 1, 1, ?, ?)",
        )
        .bind(&new.name)
        .bind(&new.url)
        .bind(&new.token)
        .bind(is_active as i64)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        let id = result.last_insert_rowid();
        tx.commit().await?;

        Ok(Backend {
            id,
            name: new.name.clone(),
            url: new.url.clone(),
            token: new.token.clone(),
            enabled: true,
            listening: true,
            is_active,
            created_at_ms: now_ms,
        })
    }

    pub async fn list_backends(&self) -> StoreResult<Vec<Backend>> {
        let rows = sqlx::query(&format!("SELECT {BACKEND_COLS} FROM backends ORDER BY id"))
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(backend_from_row).collect())
    }

    pub async fn get_backend(&self, id: i64) -> StoreResult<Option<Backend>> {
        let row = sqlx::query(&format!("SELECT {BACKEND_COLS} FROM backends WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(backend_from_row))
    }

    /// The backend UI queries default to. At most one exists.
    pub async fn active_backend(&self) -> StoreResult<Option<Backend>> {
        let row = sqlx::query(&format!(
            "SELECT {BACKEND_COLS} FROM backends WHERE is_active = 1 LIMIT 1"
        ))
        .fetch_optional(self.pool())
        .await?;
        Ok(row.as_ref().map(backend_from_row))
    }

    /// Backends the supervisor should hold sessions for.
    pub async fn listening_backends(&self) -> StoreResult<Vec<Backend>> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKEND_COLS} FROM backends WHERE enabled = 1 AND listening = 1 ORDER BY id"
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(backend_from_row).collect())
    }

    /// Applies a partial update; returns the refreshed row, or `None`
    /// when the backend does not exist.
    pub async fn update_backend(&self, id: i64, patch: &BackendPatch) -> StoreResult<Option<Backend>> {
        let Some(current) = self.get_backend(id).await? else {
            return Ok(None);
        };

        let name = patch.name.clone().unwrap_or(current.name);
        let url = patch.url.clone().unwrap_or(current.url);
        let token = match &patch.token {
            Some(t) => t.clone(),
            None => current.token,
        };
        let enabled = patch.enabled.unwrap_or(current.enabled);
        let listening = patch.listening.unwrap_or(current.listening);

        sqlx::query(
            "UPDATE backends SET name = ?, url = ?, token = ?, enabled = ?, listening = ? WHERE id = ?",
        )
        .bind(&name)
        .bind(&url)
        .bind(&token)
        .bind(enabled as i64)
        .bind(listening as i64)
        .bind(id)
        .execute(self.pool())
        .await?;

        self.get_backend(id).await
    }

    /// Deletes a backend and every row it owns. Returns false when the
    /// id is unknown.
    pub async fn delete_backend(&self, id: i64) -> StoreResult<bool> {
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query("DELETE FROM backends WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        for table in schema::AGGREGATE_TABLES {
            sqlx::query(&format!("DELETE FROM {table} WHERE backend_id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM connection_logs WHERE backend_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Marks one backend active, clearing the flag everywhere else.
    pub async fn set_active_backend(&self, id: i64) -> StoreResult<Option<Backend>> {
        if self.get_backend(id).await?.is_none() {
            return Ok(None);
        }

        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE backends SET is_active = 0 WHERE is_active = 1")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE backends SET is_active = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.get_backend(id).await
    }

    /// Toggles runtime ingestion without dropping credentials.
    pub async fn set_listening(&self, id: i64, listening: bool) -> StoreResult<Option<Backend>> {
        let result = sqlx::query("UPDATE backends SET listening = ? WHERE id = ?")
            .bind(listening as i64)
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_backend(id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::geoip::StubGeo;
    use crate::store::StoreError;

    async fn test_store() -> Store {
        Store::open_in_memory(Arc::new(StubGeo::default()))
            .await
            .expect("store opens")
    }

    fn new_backend(name: &str) -> NewBackend {
        NewBackend {
            name: name.to_string(),
            url: "http://127.0.0.1:9090".to_string(),
            token: None,
        }
    }

    #[tokio::test]
    async fn test_first_backend_becomes_active() {
        let store = test_store().await;
        let a = store.create_backend(&new_backend("a"), 1000).await.expect("create");
        assert!(a.is_active);

        let b = store.create_backend(&new_backend("b"), 2000).await.expect("create");
        assert!(!b.is_active);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_constraint_error() {
        let store = test_store().await;
        store.create_backend(&new_backend("dup"), 0).await.expect("first");

        let err = store
            .create_backend(&new_backend("dup"), 0)
            .await
            .expect_err("duplicate rejected");
        assert!(matches!(err, StoreError::Constraint(_)));

        // Delete then re-create succeeds.
        let id = store.list_backends().await.expect("list")[0].id;
        assert!(store.delete_backend(id).await.expect("delete"));
        store.create_backend(&new_backend("dup"), 0).await.expect("re-create");
    }

    #[tokio::test]
    async fn test_set_active_clears_others() {
        let store = test_store().await;
        let a = store.create_backend(&new_backend("a"), 0).await.expect("a");
        let b = store.create_backend(&new_backend("b"), 0).await.expect("b");

        store.set_active_backend(b.id).await.expect("activate");
        let active = store.active_backend().await.expect("query").expect("one active");
        assert_eq!(active.id, b.id);

        let a = store.get_backend(a.id).await.expect("get").expect("exists");
        assert!(!a.is_active);
    }

    #[tokio::test]
    async fn test_update_patch_semantics() {
        let store = test_store().await;
        let b = store
            .create_backend(
                &NewBackend {
                    name: "r".into(),
                    url: "http://old".into(),
                    token: Some("secret".into()),
                },
                0,
            )
            .await
            .expect("create");

        // Untouched fields survive.
        let updated = store
            .update_backend(
                b.id,
                &BackendPatch {
                    url: Some("http://new".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("update")
            .expect("exists");
        assert_eq!(updated.url, "http://new");
        assert_eq!(updated.token.as_deref(), Some("secret"));

        // Explicit null clears the token.
        let updated = store
            .update_backend(
                b.id,
                &BackendPatch {
                    token: Some(None),
                    ..Default::default()
                },
            )
            .await
            .expect("update")
            .expect("exists");
        assert!(updated.token.is_none());
    }

    #[tokio::test]
    async fn test_listening_backends_filter() {
        let store = test_store().await;
        let a = store.create_backend(&new_backend("a"), 0).await.expect("a");
        let b = store.create_backend(&new_backend("b"), 0).await.expect("b");

        store.set_listening(a.id, false).await.expect("toggle");
        let listening = store.listening_backends().await.expect("list");
        assert_eq!(listening.len(), 1);
        assert_eq!(listening[0].id, b.id);

        store
            .update_backend(
                b.id,
                &BackendPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .expect("disable");
        assert!(store.listening_backends().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_backend() {
        let store = test_store().await;
        assert!(!store.delete_backend(42).await.expect("no-op"));
    }
}
