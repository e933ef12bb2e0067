//! Achievement rule catalog.
//!
//! Holds the immutable-per-version achievement definitions. All invariants
//! are enforced here at upsert time, so evaluation downstream never has to
//! handle a malformed definition.

use rusqlite::{Connection, params};

use crate::db::Db;
use crate::error::{EngineError, Result};
use crate::types::{
    AchievementDefinition, AchievementKind, Condition, MetricPeriod, canonical_metric,
};

const SELECT_COLUMNS: &str = "id, code, title, description, kind, condition_type, metric, \
                              thresholds, target_ts, extra, active, period";

/// Catalog of achievement definitions, keyed by a stable case-insensitive
/// code. Numeric surrogate ids are accepted interchangeably for lookup.
#[derive(Clone)]
pub struct RuleCatalog {
    db: Db,
}

impl RuleCatalog {
    pub(crate) fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a new definition or update the one sharing its code.
    ///
    /// Fails with `Validation` when the definition breaks an invariant, or
    /// when its id points at a different row than its code does.
    pub fn upsert(&self, def: &AchievementDefinition) -> Result<AchievementDefinition> {
        if let Err(reason) = def.validate() {
            tracing::warn!(code = %def.code, %reason, "achievement definition rejected");
            return Err(EngineError::Validation(reason));
        }

        let conn = self.db.lock()?;
        if let Some(id) = def.id {
            if let Some(existing) = query_by_code(&conn, &def.code)? {
                if existing.id != Some(id) {
                    return Err(EngineError::Validation(format!(
                        "code '{}' already belongs to a different achievement",
                        def.code
                    )));
                }
            }
        }

        let (condition_type, metric, target_ts, extra) = match &def.condition {
            Condition::CounterThreshold { metric } => {
                ("counter", Some(canonical_metric(metric)), None, None)
            }
            Condition::DateOnce { target_ts } => ("date", None, Some(*target_ts), None),
            Condition::KeywordThreshold { keyword } => (
                "keyword",
                None,
                None,
                Some(serde_json::json!({ "keyword": keyword.trim() }).to_string()),
            ),
        };
        let thresholds_json =
            serde_json::to_string(&def.thresholds).unwrap_or_else(|_| "[]".to_owned());

        conn.execute(
            "INSERT INTO achievements
                 (code, title, description, kind, condition_type, metric, thresholds,
                  target_ts, extra, active, period)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(code) DO UPDATE SET
                 title = excluded.title,
                 description = excluded.description,
                 kind = excluded.kind,
                 condition_type = excluded.condition_type,
                 metric = excluded.metric,
                 thresholds = excluded.thresholds,
                 target_ts = excluded.target_ts,
                 extra = excluded.extra,
                 active = excluded.active,
                 period = excluded.period",
            params![
                def.code.trim(),
                def.title,
                def.description,
                kind_to_str(def.kind),
                condition_type,
                metric,
                thresholds_json,
                target_ts,
                extra,
                i64::from(def.active),
                period_to_str(def.period),
            ],
        )?;

        let stored = query_by_code(&conn, &def.code)?.ok_or_else(|| {
            EngineError::NotFound(format!("achievement '{}' missing after upsert", def.code))
        })?;
        tracing::info!(code = %stored.code, "achievement definition upserted");
        Ok(stored)
    }

    /// Look up by code (case-insensitive) or numeric surrogate id.
    pub fn get(&self, code_or_id: &str) -> Result<AchievementDefinition> {
        let conn = self.db.lock()?;
        let found = if let Ok(id) = code_or_id.trim().parse::<i64>() {
            query_one(
                &conn,
                &format!("SELECT {SELECT_COLUMNS} FROM achievements WHERE id = ?1"),
                params![id],
            )?
        } else {
            query_by_code(&conn, code_or_id)?
        };
        found.ok_or_else(|| EngineError::NotFound(format!("achievement '{code_or_id}'")))
    }

    /// Active counter-threshold definitions reading the given metric.
    pub fn active_by_metric(&self, metric: &str) -> Result<Vec<AchievementDefinition>> {
        let conn = self.db.lock()?;
        query_many(
            &conn,
            &format!(
                "SELECT {SELECT_COLUMNS} FROM achievements
                 WHERE active = 1 AND condition_type = 'counter' AND metric = ?1
                 ORDER BY id"
            ),
            params![canonical_metric(metric)],
        )
    }

    /// Active date-once definitions.
    pub fn active_date_definitions(&self) -> Result<Vec<AchievementDefinition>> {
        self.active_by_condition_type("date")
    }

    /// Active keyword-threshold definitions.
    pub fn active_keyword_definitions(&self) -> Result<Vec<AchievementDefinition>> {
        self.active_by_condition_type("keyword")
    }

    fn active_by_condition_type(&self, condition_type: &str) -> Result<Vec<AchievementDefinition>> {
        let conn = self.db.lock()?;
        query_many(
            &conn,
            &format!(
                "SELECT {SELECT_COLUMNS} FROM achievements
                 WHERE active = 1 AND condition_type = ?1
                 ORDER BY id"
            ),
            params![condition_type],
        )
    }

    /// Every definition, active or not.
    pub fn list(&self) -> Result<Vec<AchievementDefinition>> {
        let conn = self.db.lock()?;
        query_many(
            &conn,
            &format!("SELECT {SELECT_COLUMNS} FROM achievements ORDER BY id"),
            params![],
        )
    }

    /// Stop evaluating a definition while retaining its historical awards.
    pub fn deactivate(&self, code_or_id: &str) -> Result<()> {
        let def = self.get(code_or_id)?;
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE achievements SET active = 0 WHERE id = ?1",
            params![def.id],
        )?;
        tracing::info!(code = %def.code, "achievement definition deactivated");
        Ok(())
    }

    /// Delete a definition outright; cascades wipe its awards and progress.
    pub fn remove(&self, code_or_id: &str) -> Result<()> {
        let def = self.get(code_or_id)?;
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM achievements WHERE id = ?1", params![def.id])?;
        tracing::info!(code = %def.code, "achievement definition removed");
        Ok(())
    }

    /// Drop every definition. Part of a full administrative reset.
    pub(crate) fn clear_all(&self) -> Result<usize> {
        let conn = self.db.lock()?;
        Ok(conn.execute("DELETE FROM achievements", [])?)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn query_by_code(conn: &Connection, code: &str) -> Result<Option<AchievementDefinition>> {
    // The code column is COLLATE NOCASE, so equality is case-insensitive.
    query_one(
        conn,
        &format!("SELECT {SELECT_COLUMNS} FROM achievements WHERE code = ?1"),
        params![code.trim()],
    )
}

fn query_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<AchievementDefinition>> {
    match conn.query_row(sql, params, row_to_definition) {
        Ok(def) => Ok(Some(def)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn query_many(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<AchievementDefinition>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_definition)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn row_to_definition(row: &rusqlite::Row<'_>) -> rusqlite::Result<AchievementDefinition> {
    let condition_type: String = row.get(5)?;
    let metric: Option<String> = row.get(6)?;
    let thresholds_json: String = row.get(7)?;
    let target_ts: Option<i64> = row.get(8)?;
    let extra: Option<String> = row.get(9)?;
    let active: i64 = row.get(10)?;
    let period: String = row.get(11)?;
    let kind: String = row.get(4)?;

    let condition = match condition_type.as_str() {
        "date" => Condition::DateOnce {
            target_ts: target_ts.unwrap_or(0),
        },
        "keyword" => Condition::KeywordThreshold {
            keyword: extra
                .as_deref()
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
                .and_then(|v| v.get("keyword").and_then(|k| k.as_str()).map(str::to_owned))
                .unwrap_or_default(),
        },
        _ => Condition::CounterThreshold {
            metric: metric.unwrap_or_default(),
        },
    };

    Ok(AchievementDefinition {
        id: Some(row.get(0)?),
        code: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        kind: if kind == "tiered" {
            AchievementKind::Tiered
        } else {
            AchievementKind::Single
        },
        condition,
        thresholds: serde_json::from_str(&thresholds_json).unwrap_or_default(),
        period: if period == "monthly" {
            MetricPeriod::Monthly
        } else {
            MetricPeriod::AllTime
        },
        active: active != 0,
    })
}

fn kind_to_str(kind: AchievementKind) -> &'static str {
    match kind {
        AchievementKind::Single => "single",
        AchievementKind::Tiered => "tiered",
    }
}

fn period_to_str(period: MetricPeriod) -> &'static str {
    match period {
        MetricPeriod::AllTime => "all_time",
        MetricPeriod::Monthly => "monthly",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> RuleCatalog {
        RuleCatalog::new(Db::open_memory().expect("open"))
    }

    fn voice_def() -> AchievementDefinition {
        AchievementDefinition {
            id: None,
            code: "VOI".to_owned(),
            title: "Loud".to_owned(),
            description: "Voice notes sent".to_owned(),
            kind: AchievementKind::Tiered,
            condition: Condition::CounterThreshold {
                metric: "voice".to_owned(),
            },
            thresholds: vec![10, 100, 1000],
            period: MetricPeriod::AllTime,
            active: true,
        }
    }

    #[test]
    fn upsert_and_get_roundtrip() {
        let catalog = catalog();
        let stored = catalog.upsert(&voice_def()).expect("upsert");
        let id = stored.id.expect("id assigned");

        // Lookup by code is case-insensitive; by id is interchangeable.
        let by_code = catalog.get("voi").expect("by code");
        let by_id = catalog.get(&id.to_string()).expect("by id");
        assert_eq!(by_code, stored);
        assert_eq!(by_id, stored);
        assert_eq!(by_code.thresholds, vec![10, 100, 1000]);
    }

    #[test]
    fn upsert_updates_existing_code() {
        let catalog = catalog();
        let stored = catalog.upsert(&voice_def()).expect("insert");

        let mut edited = voice_def();
        edited.title = "Very loud".to_owned();
        edited.thresholds = vec![5, 50];
        let updated = catalog.upsert(&edited).expect("edit");

        // Same row, new content.
        assert_eq!(updated.id, stored.id);
        assert_eq!(updated.title, "Very loud");
        assert_eq!(catalog.list().expect("list").len(), 1);
    }

    #[test]
    fn upsert_rejects_invalid_definitions() {
        let catalog = catalog();
        let mut def = voice_def();
        def.thresholds = vec![100, 10];
        assert!(matches!(
            catalog.upsert(&def),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn upsert_rejects_code_stolen_by_other_id() {
        let catalog = catalog();
        let stored = catalog.upsert(&voice_def()).expect("insert");

        let mut imposter = voice_def();
        imposter.id = Some(stored.id.expect("id") + 40);
        assert!(matches!(
            catalog.upsert(&imposter),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn metric_names_are_canonicalized_on_write() {
        let catalog = catalog();
        let mut def = voice_def();
        def.condition = Condition::CounterThreshold {
            metric: "Voices".to_owned(),
        };
        catalog.upsert(&def).expect("upsert");

        let matches = catalog.active_by_metric("voice").expect("by metric");
        assert_eq!(matches.len(), 1);
        // Alias spellings resolve on the read side too.
        let matches = catalog.active_by_metric("voices").expect("by alias");
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn deactivate_hides_from_evaluation_but_keeps_row() {
        let catalog = catalog();
        catalog.upsert(&voice_def()).expect("upsert");
        catalog.deactivate("VOI").expect("deactivate");

        assert!(catalog.active_by_metric("voice").expect("active").is_empty());
        let def = catalog.get("VOI").expect("still present");
        assert!(!def.active);
    }

    #[test]
    fn get_unknown_is_not_found() {
        let catalog = catalog();
        assert!(matches!(
            catalog.get("NOPE"),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(catalog.get("123"), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn keyword_and_date_definitions_roundtrip() {
        let catalog = catalog();
        let keyword = AchievementDefinition {
            id: None,
            code: "KW".to_owned(),
            title: "Wordsmith".to_owned(),
            description: "Says the magic word".to_owned(),
            kind: AchievementKind::Tiered,
            condition: Condition::KeywordThreshold {
                keyword: "hello".to_owned(),
            },
            thresholds: vec![1, 3, 5],
            period: MetricPeriod::AllTime,
            active: true,
        };
        let date = AchievementDefinition {
            id: None,
            code: "NYE".to_owned(),
            title: "Survivor".to_owned(),
            description: "Made it to the date".to_owned(),
            kind: AchievementKind::Single,
            condition: Condition::DateOnce {
                target_ts: 1_790_000_000,
            },
            thresholds: vec![],
            period: MetricPeriod::AllTime,
            active: true,
        };
        catalog.upsert(&keyword).expect("keyword");
        catalog.upsert(&date).expect("date");

        let keywords = catalog.active_keyword_definitions().expect("keywords");
        assert_eq!(keywords.len(), 1);
        assert_eq!(
            keywords[0].condition,
            Condition::KeywordThreshold {
                keyword: "hello".to_owned()
            }
        );

        let dates = catalog.active_date_definitions().expect("dates");
        assert_eq!(dates.len(), 1);
        assert_eq!(
            dates[0].condition,
            Condition::DateOnce {
                target_ts: 1_790_000_000
            }
        );
    }

    #[test]
    fn remove_cascades_to_awards() {
        let catalog = catalog();
        let stored = catalog.upsert(&voice_def()).expect("upsert");
        let id = stored.id.expect("id");
        {
            let conn = catalog.db.lock().expect("lock");
            conn.execute(
                "INSERT INTO user_achievements (chat_id, user_id, achievement_id, tier, unlocked_at)
                 VALUES (-1, 7, ?1, 1, 100)",
                params![id],
            )
            .expect("seed award");
        }

        catalog.remove("VOI").expect("remove");

        let conn = catalog.db.lock().expect("lock");
        let awards: i64 = conn
            .query_row("SELECT COUNT(*) FROM user_achievements", [], |row| row.get(0))
            .expect("count");
        assert_eq!(awards, 0);
    }
}
