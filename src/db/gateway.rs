use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::models::{Attachment, Author, StoredMessage};
use super::{DbPool, StoreError};

/// Storage operations the delivery core depends on.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Store a message; `recipient` of `None` means public.
    async fn insert_message(
        &self,
        author_id: i64,
        text: &str,
        recipient: Option<&str>,
    ) -> Result<StoredMessage, StoreError>;

    /// Current profile snapshot of a user.
    async fn lookup_author(&self, id: i64) -> Result<Author, StoreError>;

    async fn insert_attachment(
        &self,
        message_id: i64,
        attachment: &Attachment,
    ) -> Result<(), StoreError>;

    /// Local user id for an email, used for identities whose id is 0.
    async fn find_user_id(&self, email: &str) -> Result<Option<i64>, StoreError>;
}

/// [`PersistenceGateway`] over the shared SQLite connection.
#[derive(Clone)]
pub struct SqliteGateway {
    db: DbPool,
}

impl SqliteGateway {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Insert a user without credentials (or return the existing id for `email`).
    pub async fn create_user(
        &self,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<i64, StoreError> {
        let email = email.to_string();
        let display_name = display_name.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (email, display_name) VALUES (?1, ?2) ON CONFLICT(email) DO NOTHING",
                params![email, display_name.as_deref().unwrap_or(&email)],
            )?;
            let id = conn.query_row(
                "SELECT id FROM users WHERE email = ?1",
                params![email],
                |row| row.get(0),
            )?;
            Ok(id)
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::Poisoned)?;
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn insert_message(
        &self,
        author_id: i64,
        text: &str,
        recipient: Option<&str>,
    ) -> Result<StoredMessage, StoreError> {
        let text = text.to_string();
        let recipient = recipient.map(str::to_string);
        self.with_conn(move |conn| {
            let created_at = Utc::now().timestamp_millis();
            conn.execute(
                "INSERT INTO messages (user_id, text, recipient, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![author_id, text, recipient, created_at],
            )?;
            Ok(StoredMessage {
                id: conn.last_insert_rowid(),
                created_at,
            })
        })
        .await
    }

    async fn lookup_author(&self, id: i64) -> Result<Author, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, email, display_name, avatar_url FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Author {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        display_name: row.get(2)?,
                        avatar_url: row.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::UnknownAuthor(format!("id {}", id)))
        })
        .await
    }

    async fn insert_attachment(
        &self,
        message_id: i64,
        attachment: &Attachment,
    ) -> Result<(), StoreError> {
        let attachment = attachment.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO images (message_id, url, filename, filesize, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message_id,
                    attachment.url,
                    attachment.filename,
                    attachment.filesize,
                    Utc::now().timestamp_millis()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn find_user_id(&self, email: &str) -> Result<Option<i64>, StoreError> {
        let email = email.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id FROM users WHERE email = ?1",
                    params![email],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }
}
