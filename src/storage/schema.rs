//! SQL schema definitions as const strings.
//!
//! Contains the SQLite schema for synced messages.

/// SQL to create the messages table.
///
/// Keyed by the dedup key, so redelivered messages update in place.
pub const CREATE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    account_id TEXT NOT NULL,
    id TEXT NOT NULL,
    id_generated INTEGER NOT NULL DEFAULT 0,
    folder TEXT NOT NULL,
    subject TEXT NOT NULL,
    from_address TEXT NOT NULL,
    from_name TEXT,
    to_addresses TEXT NOT NULL,
    cc_addresses TEXT NOT NULL,
    body_text TEXT NOT NULL,
    body_html TEXT NOT NULL,
    date TEXT NOT NULL,
    attachments TEXT NOT NULL,
    labels TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (account_id, id)
)
"#;

/// SQL to create message indexes.
pub const CREATE_MESSAGE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_date ON messages(date DESC);
CREATE INDEX IF NOT EXISTS idx_messages_account_date ON messages(account_id, date DESC)
"#;

/// SQL to create the full-text search table.
pub const CREATE_MESSAGES_FTS: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    subject,
    body_text,
    from_address,
    from_name,
    content='messages',
    content_rowid='rowid'
)
"#;

/// Triggers keeping `messages_fts` in step with `messages`.
pub const CREATE_MESSAGES_FTS_TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, subject, body_text, from_address, from_name)
    VALUES (NEW.rowid, NEW.subject, NEW.body_text, NEW.from_address, NEW.from_name);
END;

CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, subject, body_text, from_address, from_name)
    VALUES ('delete', OLD.rowid, OLD.subject, OLD.body_text, OLD.from_address, OLD.from_name);
END;

CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, subject, body_text, from_address, from_name)
    VALUES ('delete', OLD.rowid, OLD.subject, OLD.body_text, OLD.from_address, OLD.from_name);
    INSERT INTO messages_fts(rowid, subject, body_text, from_address, from_name)
    VALUES (NEW.rowid, NEW.subject, NEW.body_text, NEW.from_address, NEW.from_name);
END
"#;

/// Returns all schema creation statements in order.
pub fn all_migrations() -> Vec<&'static str> {
    vec![
        CREATE_MESSAGES,
        CREATE_MESSAGE_INDEXES,
        CREATE_MESSAGES_FTS,
        CREATE_MESSAGES_FTS_TRIGGERS,
    ]
}
