//! Message CRUD operations.
//!
//! Provides database operations for synced messages. Rows are keyed by
//! `(account_id, id)`, the same key the sink deduplicates on.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::{AccountId, Address, EmailLabel, MessageId, NormalizedMessage};
use crate::storage::database::{Database, Result};

/// A persisted message together with its classification labels.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message: NormalizedMessage,
    pub labels: Vec<EmailLabel>,
}

const SELECT_COLUMNS: &str = r#"
    account_id, id, id_generated, folder, subject, from_address, from_name,
    to_addresses, cc_addresses, body_text, body_html, date, attachments, labels
"#;

/// Inserts a message, or refreshes its content if it is already stored.
///
/// Labels of an existing row are kept. Returns true when the row is new.
pub async fn upsert(db: &Database, message: &NormalizedMessage) -> Result<bool> {
    let message = message.clone();

    db.transaction(move |tx| {
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE account_id = ?1 AND id = ?2)",
            params![message.account_id.as_str(), message.id.as_str()],
            |row| row.get(0),
        )?;

        let now = Utc::now().to_rfc3339();
        tx.execute(
            r#"
            INSERT INTO messages (
                account_id, id, id_generated, folder, subject, from_address, from_name,
                to_addresses, cc_addresses, body_text, body_html, date, attachments,
                created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                ?8, ?9, ?10, ?11, ?12, ?13,
                ?14, ?14
            )
            ON CONFLICT(account_id, id) DO UPDATE SET
                folder = excluded.folder,
                subject = excluded.subject,
                from_address = excluded.from_address,
                from_name = excluded.from_name,
                to_addresses = excluded.to_addresses,
                cc_addresses = excluded.cc_addresses,
                body_text = excluded.body_text,
                body_html = excluded.body_html,
                date = excluded.date,
                attachments = excluded.attachments,
                updated_at = excluded.updated_at
            "#,
            params![
                message.account_id.as_str(),
                message.id.as_str(),
                message.id_generated,
                message.folder,
                message.subject,
                message.from.email,
                message.from.name,
                serde_json::to_string(&message.to)?,
                serde_json::to_string(&message.cc)?,
                message.body_text,
                message.body_html,
                message.date.to_rfc3339(),
                serde_json::to_string(&message.attachments)?,
                now,
            ],
        )?;

        Ok(!exists)
    })
    .await
}

/// Retrieves a message by its dedup key.
pub async fn get(
    db: &Database,
    account_id: &AccountId,
    id: &MessageId,
) -> Result<Option<StoredMessage>> {
    let account_id = account_id.clone();
    let id = id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {} FROM messages WHERE account_id = ?1 AND id = ?2",
            SELECT_COLUMNS
        );
        let result = conn
            .query_row(&sql, params![account_id.as_str(), id.as_str()], row_to_message)
            .optional()?;
        Ok(result)
    })
    .await
}

/// Replaces the labels of a message. Returns false when it is not stored.
pub async fn set_labels(
    db: &Database,
    account_id: &AccountId,
    id: &MessageId,
    labels: &[EmailLabel],
) -> Result<bool> {
    let account_id = account_id.clone();
    let id = id.clone();
    let labels_json = serde_json::to_string(labels)?;

    db.with_conn(move |conn| {
        let updated = conn.execute(
            "UPDATE messages SET labels = ?1, updated_at = ?2 WHERE account_id = ?3 AND id = ?4",
            params![
                labels_json,
                Utc::now().to_rfc3339(),
                account_id.as_str(),
                id.as_str()
            ],
        )?;
        Ok(updated > 0)
    })
    .await
}

/// Counts the messages stored for an account.
pub async fn count_by_account(db: &Database, account_id: &AccountId) -> Result<u64> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE account_id = ?1",
            [account_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    })
    .await
}

/// Retrieves the newest messages across all accounts.
pub async fn recent(db: &Database, limit: u32) -> Result<Vec<StoredMessage>> {
    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {} FROM messages ORDER BY date DESC LIMIT ?1",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([limit], row_to_message)?;
        let messages: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(messages?)
    })
    .await
}

/// Full-text search over subject, body and sender.
pub async fn search(db: &Database, query: &str, limit: u32) -> Result<Vec<StoredMessage>> {
    let query = query.to_string();

    db.with_conn(move |conn| {
        let sql = format!(
            r#"
            SELECT {} FROM messages
            WHERE rowid IN (SELECT rowid FROM messages_fts WHERE messages_fts MATCH ?1)
            ORDER BY date DESC
            LIMIT ?2
            "#,
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![query, limit], row_to_message)?;
        let messages: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(messages?)
    })
    .await
}

fn row_to_message(row: &Row<'_>) -> std::result::Result<StoredMessage, rusqlite::Error> {
    let to_json: String = row.get(7)?;
    let cc_json: String = row.get(8)?;
    let date_str: String = row.get(11)?;
    let attachments_json: String = row.get(12)?;
    let labels_json: String = row.get(13)?;

    let date = DateTime::parse_from_rfc3339(&date_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    let message = NormalizedMessage {
        account_id: AccountId(row.get(0)?),
        id: MessageId(row.get(1)?),
        id_generated: row.get(2)?,
        folder: row.get(3)?,
        subject: row.get(4)?,
        from: Address {
            email: row.get(5)?,
            name: row.get(6)?,
        },
        to: serde_json::from_str(&to_json).unwrap_or_default(),
        cc: serde_json::from_str(&cc_json).unwrap_or_default(),
        body_text: row.get(9)?,
        body_html: row.get(10)?,
        date,
        attachments: serde_json::from_str(&attachments_json).unwrap_or_default(),
    };

    Ok(StoredMessage {
        message,
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
    })
}
