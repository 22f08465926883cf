use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use parley_protocol::{ConversationId, Message, MessageId, MessageMetadata, Part, Reaction, Role};
use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, DecodePartsSnafu, EncodePartsSnafu, InvariantViolationSnafu,
    NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, StorageError, StorageResult,
};
use super::types::{
    ContinuationToken, ConversationPatch, ConversationRecord, DEFAULT_CONVERSATION_TITLE,
    MessagePage, NewConversation, PageRequest, unix_timestamp_seconds,
};
use super::{BoxFuture, ConversationStore, MessageStore};

/// SQLite-backed history store.
///
/// Messages carry a per-conversation `seq`; pages are served newest-first and
/// the continuation token is the `seq` of the oldest row in the page.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One long-lived connection keeps `:memory:` databases alive across calls.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite history store");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn ensure_conversation(
        &self,
        conversation_id: &ConversationId,
        stage: &'static str,
    ) -> StorageResult<()> {
        let now = timestamp_to_sql(unix_timestamp_seconds(), stage)?;
        sqlx::query(
            "INSERT INTO conversations (id, title, archived, created_at, updated_at) VALUES (?, ?, 0, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(conversation_id.as_str())
        .bind(DEFAULT_CONVERSATION_TITLE)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu { stage })?;
        Ok(())
    }

    async fn load_conversation(
        &self,
        conversation_id: &ConversationId,
        stage: &'static str,
    ) -> StorageResult<ConversationRecord> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, title, archived, updated_at FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu { stage })?
        .context(NotFoundSnafu {
            stage,
            entity: "conversation",
            id: conversation_id.to_string(),
        })?;

        conversation_row_to_record(row)
    }

    async fn load_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        stage: &'static str,
    ) -> StorageResult<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT id, seq, role, parts_json, model_id, reaction, is_error FROM messages WHERE conversation_id = ? AND id = ?",
        )
        .bind(conversation_id.as_str())
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu { stage })?;

        row.map(message_row_to_message).transpose()
    }
}

impl ConversationStore for SqliteStore {
    fn upsert_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let now = timestamp_to_sql(unix_timestamp_seconds(), "conversation-upsert-now")?;
            sqlx::query(
                "INSERT INTO conversations (id, title, archived, created_at, updated_at) VALUES (?, ?, 0, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET title = excluded.title, updated_at = excluded.updated_at",
            )
            .bind(input.id.as_str())
            .bind(input.title.as_str())
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-upsert-insert",
            })?;

            self.load_conversation(&input.id, "conversation-upsert-reload")
                .await
        })
    }

    fn list_conversations(
        &self,
        include_archived: bool,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let query = if include_archived {
                "SELECT id, title, archived, updated_at FROM conversations ORDER BY updated_at DESC, id DESC"
            } else {
                "SELECT id, title, archived, updated_at FROM conversations WHERE archived = 0 ORDER BY updated_at DESC, id DESC"
            };

            let rows = sqlx::query_as::<_, ConversationRow>(query)
                .fetch_all(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-list-query",
                })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }

    fn update_conversation(
        &self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let current = self
                .load_conversation(&conversation_id, "conversation-update-load")
                .await?;
            let title = patch.title.unwrap_or(current.title);
            let archived = patch.archived.unwrap_or(current.archived);
            let now = timestamp_to_sql(unix_timestamp_seconds(), "conversation-update-now")?;

            sqlx::query("UPDATE conversations SET title = ?, archived = ?, updated_at = ? WHERE id = ?")
                .bind(title)
                .bind(archived)
                .bind(now)
                .bind(conversation_id.as_str())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-update-write",
                })?;

            self.load_conversation(&conversation_id, "conversation-update-reload")
                .await
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(conversation_id.as_str())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-delete-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }
            Ok(())
        })
    }
}

impl MessageStore for SqliteStore {
    fn list_messages(&self, request: PageRequest) -> BoxFuture<'_, StorageResult<MessagePage>> {
        Box::pin(async move {
            let limit = request.effective_limit("message-page-limit")?;
            let before = match request.continuation_token.as_ref() {
                Some(token) => token.to_seq("message-page-token")?,
                None => u64::MAX,
            };
            let before = i64::try_from(before).unwrap_or(i64::MAX);
            // Fetch one extra row to learn whether anything older remains.
            let fetch_limit = i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX);

            let mut rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, seq, role, parts_json, model_id, reaction, is_error FROM messages \
                 WHERE conversation_id = ? AND seq < ? ORDER BY seq DESC LIMIT ?",
            )
            .bind(request.conversation_id.as_str())
            .bind(before)
            .bind(fetch_limit)
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-page-query",
            })?;

            let has_older = rows.len() > limit;
            rows.truncate(limit);

            let continuation_token = if has_older {
                rows.last()
                    .map(|row| i64_to_u64(row.seq, "message-page-token-seq"))
                    .transpose()?
                    .map(ContinuationToken::from_seq)
            } else {
                None
            };

            let messages = rows
                .into_iter()
                .map(message_row_to_message)
                .collect::<StorageResult<Vec<_>>>()?;

            Ok(MessagePage {
                messages,
                continuation_token,
            })
        })
    }

    fn save_message(
        &self,
        conversation_id: ConversationId,
        message: Message,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.ensure_conversation(&conversation_id, "message-save-conversation")
                .await?;

            let parts_json = serde_json::to_string(&message.parts).context(EncodePartsSnafu {
                stage: "message-save-encode-parts",
            })?;
            let now = timestamp_to_sql(unix_timestamp_seconds(), "message-save-now")?;

            // Replacing keeps the original seq so the message does not move in history.
            sqlx::query(
                "INSERT INTO messages (id, conversation_id, seq, role, parts_json, model_id, reaction, is_error, created_at, updated_at) \
                 VALUES (?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?), ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(conversation_id, id) DO UPDATE SET \
                 role = excluded.role, parts_json = excluded.parts_json, model_id = excluded.model_id, \
                 reaction = excluded.reaction, is_error = excluded.is_error, updated_at = excluded.updated_at",
            )
            .bind(message.id.as_str())
            .bind(conversation_id.as_str())
            .bind(conversation_id.as_str())
            .bind(message.role.as_str())
            .bind(parts_json)
            .bind(message.metadata.model_id.as_deref())
            .bind(message.metadata.reaction.map(|reaction| reaction.as_str()))
            .bind(message.metadata.is_error)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-save-upsert",
            })?;

            Ok(())
        })
    }

    fn set_reaction(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        reaction: Option<Reaction>,
    ) -> BoxFuture<'_, StorageResult<Message>> {
        Box::pin(async move {
            let now = timestamp_to_sql(unix_timestamp_seconds(), "message-reaction-now")?;
            let result = sqlx::query(
                "UPDATE messages SET reaction = ?, updated_at = ? WHERE conversation_id = ? AND id = ?",
            )
            .bind(reaction.map(|reaction| reaction.as_str()))
            .bind(now)
            .bind(conversation_id.as_str())
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-reaction-update",
            })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-reaction-missing",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            }

            self.load_message(&conversation_id, &message_id, "message-reaction-reload")
                .await?
                .context(InvariantViolationSnafu {
                    stage: "message-reaction-reload",
                    details: format!("message '{message_id}' vanished after update"),
                })
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    archived: bool,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    seq: i64,
    role: String,
    parts_json: String,
    model_id: Option<String>,
    reaction: Option<String>,
    is_error: bool,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::new(row.id),
        title: row.title,
        archived: row.archived,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
    })
}

fn message_row_to_message(row: MessageRow) -> StorageResult<Message> {
    let parts = serde_json::from_str::<Vec<Part>>(&row.parts_json).context(DecodePartsSnafu {
        stage: "message-row-parts",
    })?;
    let reaction = row
        .reaction
        .as_deref()
        .map(|raw| {
            Reaction::parse(raw).context(InvariantViolationSnafu {
                stage: "message-row-reaction",
                details: format!("unknown reaction '{raw}'"),
            })
        })
        .transpose()?;

    Ok(Message {
        id: MessageId::new(row.id),
        role: role_from_sql(&row.role)?,
        parts,
        metadata: MessageMetadata {
            model_id: row.model_id,
            reaction,
            is_error: row.is_error,
        },
    })
}

fn role_from_sql(raw: &str) -> StorageResult<Role> {
    Role::parse(raw).context(InvariantViolationSnafu {
        stage: "message-role-from-sql",
        details: format!("unknown message role '{raw}'"),
    })
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn timestamp_to_sql(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
