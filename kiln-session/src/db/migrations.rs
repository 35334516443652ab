use rusqlite::Connection;

pub const CURRENT_VERSION: u32 = 2;

/// Run all pending migrations on the database.
///
/// Uses `PRAGMA user_version` to track which migrations have been applied.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        migrate_v0_to_v1(conn)?;
    }

    if version < 2 {
        migrate_v1_to_v2(conn)?;
    }

    Ok(())
}

fn migrate_v0_to_v1(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE features (
            id              TEXT PRIMARY KEY,
            description     TEXT NOT NULL,
            status          TEXT NOT NULL,
            priority        TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL,
            completed_at    INTEGER,
            metadata        TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE tasks (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            feature_id      TEXT NOT NULL REFERENCES features,
            role            TEXT NOT NULL,
            description     TEXT NOT NULL,
            status          TEXT NOT NULL,
            attempts        INTEGER NOT NULL DEFAULT 0,
            created_at      INTEGER NOT NULL,
            started_at      INTEGER,
            completed_at    INTEGER,
            output          TEXT,
            error           TEXT
        );

        CREATE TABLE contexts (
            id              INTEGER PRIMARY KEY,
            feature_id      TEXT NOT NULL REFERENCES features,
            context_type    TEXT NOT NULL,
            content         TEXT NOT NULL,
            author          TEXT,
            created_at      INTEGER NOT NULL
        );

        CREATE TABLE transitions (
            id              INTEGER PRIMARY KEY,
            entity_type     TEXT NOT NULL,
            entity_id       TEXT NOT NULL,
            from_state      TEXT,
            to_state        TEXT NOT NULL,
            reason          TEXT,
            actor           TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            metadata        TEXT
        );

        CREATE TABLE audit_log (
            id              INTEGER PRIMARY KEY,
            action          TEXT NOT NULL,
            entity_type     TEXT,
            entity_id       TEXT,
            actor           TEXT,
            details         TEXT,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX idx_tasks_status_created ON tasks(status, created_at);
        CREATE INDEX idx_tasks_feature ON tasks(feature_id);
        CREATE INDEX idx_contexts_feature ON contexts(feature_id);
        CREATE INDEX idx_transitions_entity ON transitions(entity_type, entity_id);

        PRAGMA user_version = 1;
        ",
    )?;
    Ok(())
}

fn migrate_v1_to_v2(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE discoveries (
            id              INTEGER PRIMARY KEY,
            feature_id      TEXT NOT NULL REFERENCES features,
            task_id         INTEGER NOT NULL REFERENCES tasks,
            title           TEXT NOT NULL,
            detail          TEXT NOT NULL,
            created_at      INTEGER NOT NULL
        );

        CREATE TABLE decisions (
            id              INTEGER PRIMARY KEY,
            feature_id      TEXT NOT NULL REFERENCES features,
            task_id         INTEGER NOT NULL REFERENCES tasks,
            title           TEXT NOT NULL,
            rationale       TEXT NOT NULL,
            created_at      INTEGER NOT NULL
        );

        CREATE TABLE user_stories (
            id                  INTEGER PRIMARY KEY,
            feature_id          TEXT NOT NULL REFERENCES features,
            task_id             INTEGER NOT NULL REFERENCES tasks,
            title               TEXT NOT NULL,
            description         TEXT NOT NULL,
            acceptance_criteria TEXT NOT NULL DEFAULT '[]',
            created_at          INTEGER NOT NULL
        );

        ALTER TABLE tasks ADD COLUMN user_story_id INTEGER REFERENCES user_stories;

        CREATE INDEX idx_discoveries_feature ON discoveries(feature_id);
        CREATE INDEX idx_decisions_feature ON decisions(feature_id);
        CREATE INDEX idx_user_stories_feature ON user_stories(feature_id);

        PRAGMA user_version = 2;
        ",
    )?;
    Ok(())
}
