/// Message log. `external_id` is the dedup key and is enforced by SQLite
/// itself; `captured_at` is indexed for range queries by readers.
pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS messages (
        row_id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT NOT NULL UNIQUE,
        channel_id TEXT NOT NULL,
        author_id TEXT NOT NULL,
        author_display_name TEXT NOT NULL,
        content TEXT NOT NULL,
        captured_at TEXT NOT NULL,
        attachment_count INTEGER NOT NULL DEFAULT 0 CHECK (attachment_count >= 0),
        ingested_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );

    -- Index for date range filtering
    CREATE INDEX IF NOT EXISTS idx_messages_captured_at ON messages (captured_at);
";
