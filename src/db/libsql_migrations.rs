//! SQLite-dialect schema for the libSQL backend.
//!
//! Mirrors `migrations/V*.sql`: UUIDs and timestamps are
//! TEXT (RFC 3339, millisecond precision), booleans are INTEGER 0/1.
//! Every statement is idempotent so it can run on each startup.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS signing_requests (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    message TEXT NOT NULL,
    nonce TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'completed', 'expired')),
    signature TEXT,
    valid INTEGER,
    workflow_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    completed_at TEXT,
    CHECK (
        (status = 'pending' AND signature IS NULL AND valid IS NULL AND completed_at IS NULL)
        OR (status = 'completed' AND completed_at IS NOT NULL)
        OR (status = 'expired' AND completed_at IS NOT NULL AND signature IS NULL)
    )
);

CREATE INDEX IF NOT EXISTS idx_signing_requests_agent_status
    ON signing_requests (agent_id, status, created_at);
CREATE INDEX IF NOT EXISTS idx_signing_requests_status_created
    ON signing_requests (status, created_at);
CREATE INDEX IF NOT EXISTS idx_signing_requests_signature
    ON signing_requests (signature);
CREATE UNIQUE INDEX IF NOT EXISTS idx_signing_requests_nonce
    ON signing_requests (nonce);
CREATE INDEX IF NOT EXISTS idx_signing_requests_overdue
    ON signing_requests (status, expires_at);

CREATE TABLE IF NOT EXISTS signing_submissions (
    request_id TEXT PRIMARY KEY REFERENCES signing_requests (id) ON DELETE CASCADE,
    signature TEXT NOT NULL,
    submitted_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS used_recovery_nonces (
    nonce TEXT PRIMARY KEY,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_used_recovery_nonces_expires_at
    ON used_recovery_nonces (expires_at);
"#;
