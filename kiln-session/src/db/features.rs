use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};

use super::{optional_time_column, parse_column, time_column, StoreError, StoreResult};
use crate::state::schema::{Feature, FeatureId, Priority, Status};
use crate::state::timing::{now_millis, to_millis};

const COLUMNS: &str =
    "id, description, status, priority, created_at, updated_at, completed_at, metadata";

/// Fields accepted when a feature is created.
#[derive(Debug, Clone, Default)]
pub struct NewFeature {
    pub description: String,
    pub priority: Priority,
    /// Defaults to `pending`.
    pub status: Option<Status>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureFilter {
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct FeaturePatch {
    pub description: Option<String>,
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Option<Map<String, Value>>,
}

/// Insert a new feature with a fresh UUID.
pub fn create(conn: &Connection, new: &NewFeature) -> StoreResult<Feature> {
    let id: FeatureId = uuid::Uuid::new_v4().to_string();
    let now = now_millis();
    let status = new.status.unwrap_or(Status::Pending);
    conn.execute(
        "INSERT INTO features (id, description, status, priority, created_at, updated_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6)",
        params![
            id,
            new.description,
            status.as_str(),
            new.priority.as_str(),
            now,
            serde_json::to_string(&new.metadata)?,
        ],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| StoreError::not_found("feature", &id))
}

pub fn find_by_id(conn: &Connection, id: &str) -> StoreResult<Option<Feature>> {
    let sql = format!("SELECT {COLUMNS} FROM features WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id], row_to_feature)
        .optional()?)
}

/// List features matching the filter, oldest first.
pub fn find_all(conn: &Connection, filter: &FeatureFilter) -> StoreResult<Vec<Feature>> {
    let mut sql = format!("SELECT {COLUMNS} FROM features WHERE 1 = 1");
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        args.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(priority) = filter.priority {
        sql.push_str(" AND priority = ?");
        args.push(SqlValue::Text(priority.as_str().to_string()));
    }
    sql.push_str(" ORDER BY created_at ASC, rowid ASC");
    push_paging(&mut sql, &mut args, filter.limit, filter.offset);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args), row_to_feature)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Find the most recent feature whose metadata carries `kind`.
pub fn find_by_kind(conn: &Connection, kind: &str) -> StoreResult<Option<Feature>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM features WHERE json_extract(metadata, '$.kind') = ?1
         ORDER BY created_at DESC LIMIT 1"
    );
    Ok(conn
        .query_row(&sql, params![kind], row_to_feature)
        .optional()?)
}

/// Apply a partial update. Fails with `NotFound` for unknown ids.
pub fn update(conn: &Connection, id: &str, patch: &FeaturePatch) -> StoreResult<Feature> {
    let mut sets = vec!["updated_at = ?".to_string()];
    let mut args: Vec<SqlValue> = vec![SqlValue::Integer(now_millis())];
    if let Some(description) = &patch.description {
        sets.push("description = ?".to_string());
        args.push(SqlValue::Text(description.clone()));
    }
    if let Some(status) = patch.status {
        sets.push("status = ?".to_string());
        args.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(priority) = patch.priority {
        sets.push("priority = ?".to_string());
        args.push(SqlValue::Text(priority.as_str().to_string()));
    }
    if let Some(completed_at) = patch.completed_at {
        sets.push("completed_at = ?".to_string());
        args.push(SqlValue::Integer(to_millis(completed_at)));
    }
    if let Some(metadata) = &patch.metadata {
        sets.push("metadata = ?".to_string());
        args.push(SqlValue::Text(serde_json::to_string(metadata)?));
    }
    args.push(SqlValue::Text(id.to_string()));

    let sql = format!("UPDATE features SET {} WHERE id = ?", sets.join(", "));
    let changed = conn.execute(&sql, params_from_iter(args))?;
    if changed == 0 {
        return Err(StoreError::not_found("feature", id));
    }
    find_by_id(conn, id)?.ok_or_else(|| StoreError::not_found("feature", id))
}

/// Set the status, stamping `completed_at` when the feature completes.
pub fn update_status(conn: &Connection, id: &str, status: Status) -> StoreResult<Feature> {
    let completed_at = (status == Status::Complete).then(Utc::now);
    update(
        conn,
        id,
        &FeaturePatch {
            status: Some(status),
            completed_at,
            ..Default::default()
        },
    )
}

pub(crate) fn push_paging(
    sql: &mut String,
    args: &mut Vec<SqlValue>,
    limit: Option<u32>,
    offset: Option<u32>,
) {
    if limit.is_some() || offset.is_some() {
        // SQLite requires a LIMIT before OFFSET; -1 means unbounded.
        sql.push_str(" LIMIT ? OFFSET ?");
        args.push(SqlValue::Integer(limit.map(i64::from).unwrap_or(-1)));
        args.push(SqlValue::Integer(offset.map(i64::from).unwrap_or(0)));
    }
}

fn row_to_feature(row: &rusqlite::Row) -> rusqlite::Result<Feature> {
    let metadata: String = row.get(7)?;
    let metadata: Map<String, Value> = serde_json::from_str(&metadata).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Feature {
        id: row.get(0)?,
        description: row.get(1)?,
        status: parse_column(row, 2)?,
        priority: parse_column(row, 3)?,
        created_at: time_column(row, 4)?,
        updated_at: time_column(row, 5)?,
        completed_at: optional_time_column(row, 6)?,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::state::schema::{KIND_KEY, SELF_HEALING_KIND};

    fn new_feature(description: &str) -> NewFeature {
        NewFeature {
            description: description.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_defaults_to_pending() {
        let conn = test_db();
        let feature = create(&conn, &new_feature("Add login")).unwrap();

        assert_eq!(feature.status, Status::Pending);
        assert_eq!(feature.priority, Priority::Normal);
        assert_eq!(feature.description, "Add login");
        assert!(feature.completed_at.is_none());
        assert!(uuid::Uuid::parse_str(&feature.id).is_ok());
    }

    #[test]
    fn test_find_by_id_missing() {
        let conn = test_db();
        assert!(find_by_id(&conn, "nope").unwrap().is_none());
    }

    #[test]
    fn test_find_all_filters_and_pages() {
        let conn = test_db();
        for i in 0..4 {
            create(
                &conn,
                &NewFeature {
                    description: format!("feature {i}"),
                    priority: if i % 2 == 0 { Priority::High } else { Priority::Low },
                    ..Default::default()
                },
            )
            .unwrap();
        }

        let high = find_all(
            &conn,
            &FeatureFilter {
                priority: Some(Priority::High),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(high.len(), 2);
        assert_eq!(high[0].description, "feature 0");

        let page = find_all(
            &conn,
            &FeatureFilter {
                limit: Some(2),
                offset: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        let names: Vec<_> = page.iter().map(|f| f.description.as_str()).collect();
        assert_eq!(names, vec!["feature 1", "feature 2"]);

        let offset_only = find_all(
            &conn,
            &FeatureFilter {
                offset: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(offset_only.len(), 1);
    }

    #[test]
    fn test_update_status_stamps_completion() {
        let conn = test_db();
        let feature = create(&conn, &new_feature("ship it")).unwrap();

        let updated = update_status(&conn, &feature.id, Status::Complete).unwrap();
        assert_eq!(updated.status, Status::Complete);
        assert!(updated.completed_at.is_some());
    }

    #[test]
    fn test_update_unknown_id_fails() {
        let conn = test_db();
        let err = update(&conn, "missing", &FeaturePatch::default()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_find_by_kind() {
        let conn = test_db();
        create(&conn, &new_feature("plain")).unwrap();
        assert!(find_by_kind(&conn, SELF_HEALING_KIND).unwrap().is_none());

        let mut metadata = Map::new();
        metadata.insert(KIND_KEY.to_string(), Value::from(SELF_HEALING_KIND));
        let healer = create(
            &conn,
            &NewFeature {
                description: "Self-healing".to_string(),
                metadata,
                ..Default::default()
            },
        )
        .unwrap();

        let found = find_by_kind(&conn, SELF_HEALING_KIND).unwrap().unwrap();
        assert_eq!(found.id, healer.id);
        assert!(found.is_self_healing());
    }
}
