//! Embedded schema (§3, §4.3). Applied with `CREATE TABLE IF NOT EXISTS` on
//! every open, versioned with `PRAGMA user_version` so a later migration
//! can detect what it's starting from instead of re-deriving it from the
//! table definitions.

pub const CURRENT_SCHEMA_VERSION: i64 = 1;

pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS pools (
    id              INTEGER PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    retention_days  INTEGER
);

CREATE TABLE IF NOT EXISTS tapes (
    id                          INTEGER PRIMARY KEY,
    uuid                        TEXT NOT NULL UNIQUE,
    barcode                     TEXT UNIQUE,
    label                       TEXT NOT NULL,
    pool_id                     INTEGER NOT NULL REFERENCES pools(id) ON DELETE RESTRICT,
    status                      TEXT NOT NULL,
    capacity_bytes              INTEGER NOT NULL,
    used_bytes                  INTEGER NOT NULL DEFAULT 0,
    write_count                 INTEGER NOT NULL DEFAULT 0,
    last_written_at             INTEGER,
    offsite_location            TEXT,
    encryption_key_fingerprint  TEXT,
    compression_type            TEXT NOT NULL DEFAULT 'none',
    lto_generation               INTEGER
);
CREATE INDEX IF NOT EXISTS idx_tapes_pool ON tapes(pool_id);
CREATE INDEX IF NOT EXISTS idx_tapes_status ON tapes(status);

CREATE TABLE IF NOT EXISTS drives (
    id              INTEGER PRIMARY KEY,
    device_path     TEXT NOT NULL UNIQUE,
    display_name    TEXT NOT NULL,
    vendor          TEXT,
    model           TEXT,
    serial          TEXT,
    enabled         INTEGER NOT NULL DEFAULT 1,
    current_tape    TEXT,
    status          TEXT NOT NULL DEFAULT 'offline'
);

CREATE TABLE IF NOT EXISTS backup_jobs (
    id              INTEGER PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    source_json     TEXT NOT NULL,
    pool_id         INTEGER NOT NULL REFERENCES pools(id) ON DELETE RESTRICT,
    backup_type     TEXT NOT NULL,
    schedule        TEXT,
    retention_days  INTEGER,
    enabled         INTEGER NOT NULL DEFAULT 1,
    last_run        INTEGER,
    next_run        INTEGER
);

CREATE TABLE IF NOT EXISTS backup_sets (
    id                  INTEGER PRIMARY KEY,
    job_id              INTEGER NOT NULL REFERENCES backup_jobs(id) ON DELETE RESTRICT,
    primary_tape_id     INTEGER NOT NULL REFERENCES tapes(id) ON DELETE RESTRICT,
    backup_type         TEXT NOT NULL,
    start_time          INTEGER NOT NULL,
    end_time            INTEGER,
    status              TEXT NOT NULL,
    file_count          INTEGER NOT NULL DEFAULT 0,
    total_bytes         INTEGER NOT NULL DEFAULT 0,
    start_file_number   INTEGER NOT NULL,
    end_file_number     INTEGER,
    parent_set_id       INTEGER REFERENCES backup_sets(id) ON DELETE SET NULL,
    checksum            TEXT,
    encryption_key_id   INTEGER,
    encryption_tag      TEXT,
    compression_type    TEXT NOT NULL DEFAULT 'none'
);
CREATE INDEX IF NOT EXISTS idx_backup_sets_job ON backup_sets(job_id);

CREATE TABLE IF NOT EXISTS tape_segments (
    id                  INTEGER PRIMARY KEY,
    backup_set_id       INTEGER NOT NULL REFERENCES backup_sets(id) ON DELETE CASCADE,
    tape_id             INTEGER NOT NULL REFERENCES tapes(id) ON DELETE RESTRICT,
    sequence_number     INTEGER NOT NULL,
    start_file_number   INTEGER NOT NULL,
    end_file_number     INTEGER,
    UNIQUE(backup_set_id, sequence_number)
);
CREATE INDEX IF NOT EXISTS idx_tape_segments_set ON tape_segments(backup_set_id);
CREATE INDEX IF NOT EXISTS idx_tape_segments_tape ON tape_segments(tape_id);

CREATE TABLE IF NOT EXISTS catalog_entries (
    id              INTEGER PRIMARY KEY,
    backup_set_id   INTEGER NOT NULL REFERENCES backup_sets(id) ON DELETE CASCADE,
    path            TEXT NOT NULL,
    size            INTEGER NOT NULL,
    mode            INTEGER NOT NULL,
    mtime           INTEGER NOT NULL,
    checksum        TEXT NOT NULL,
    block_offset    INTEGER NOT NULL,
    UNIQUE(backup_set_id, path)
);
CREATE INDEX IF NOT EXISTS idx_catalog_entries_path ON catalog_entries(path);

CREATE TABLE IF NOT EXISTS job_executions (
    id                  INTEGER PRIMARY KEY,
    job_id              INTEGER NOT NULL REFERENCES backup_jobs(id) ON DELETE CASCADE,
    backup_set_id       INTEGER REFERENCES backup_sets(id) ON DELETE SET NULL,
    status              TEXT NOT NULL,
    start_time          INTEGER NOT NULL,
    end_time            INTEGER,
    files_processed     INTEGER NOT NULL DEFAULT 0,
    bytes_processed     INTEGER NOT NULL DEFAULT 0,
    error_message       TEXT,
    can_resume          INTEGER NOT NULL DEFAULT 0,
    resume_state_json   TEXT
);
CREATE INDEX IF NOT EXISTS idx_job_executions_job ON job_executions(job_id);

CREATE TABLE IF NOT EXISTS snapshots (
    job_id          INTEGER PRIMARY KEY REFERENCES backup_jobs(id) ON DELETE CASCADE,
    manifest_json   TEXT NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id              INTEGER PRIMARY KEY,
    actor           TEXT NOT NULL,
    action          TEXT NOT NULL,
    resource_kind   TEXT NOT NULL,
    resource_id     TEXT NOT NULL,
    details         TEXT NOT NULL,
    timestamp       INTEGER NOT NULL
);
"#;
