use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::api::{Arm, BanditLogEntry, BanditStats, ArmStats, TradePlan};
use crate::errors::{AppError, AppResult};

mod embedded {
    refinery::embed_migrations!("migrations");
}

pub struct EventCacheRow {
    pub event_type: String,
    pub event_time: DateTime<Utc>,
    pub materiality: f64,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

pub struct BanditLogRow {
    pub ts: DateTime<Utc>,
    pub arm_name: Arm,
    pub context: Vec<f64>,
    pub reward: f64,
    pub decision_id: Option<String>,
}

pub struct ArmAggregate {
    pub arm_name: Arm,
    pub count: i64,
    pub avg_reward: f64,
    pub min_reward: f64,
    pub max_reward: f64,
}

/// Single-writer sqlite handle. `rusqlite::Connection` isn't `Send`-friendly for
/// concurrent use, so every call serializes through this mutex the same way the
/// bandit state serializes through its own per-dimension lock.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::internal(format!("create data dir: {e}")))?;
        }
        let mut conn = Connection::open(path)
            .map_err(|e| AppError::internal(format!("open sqlite at {}: {e}", path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AppError::internal(format!("set WAL: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| AppError::internal(format!("set foreign_keys: {e}")))?;
        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| AppError::internal(format!("run migrations: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub async fn record_decision(
        &self,
        decision_id: &str,
        ticker: &str,
        arm: Arm,
        context: &[f64],
        plan: &TradePlan,
    ) -> AppResult<()> {
        let context_json = serde_json::to_string(context)
            .map_err(|e| AppError::internal(format!("serialize context: {e}")))?;
        let plan_json = serde_json::to_string(plan)
            .map_err(|e| AppError::internal(format!("serialize plan: {e}")))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO decisions (decision_id, ticker, arm_name, context_json, plan_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(decision_id) DO NOTHING",
            params![decision_id, ticker, arm.as_str(), context_json, plan_json, Utc::now().to_rfc3339()],
        )
        .map_err(|e| AppError::internal(format!("insert decision: {e}")))?;
        Ok(())
    }

    /// Returns `true` when this call inserted a new row (first reward for this
    /// decision), `false` when a prior reward already existed (duplicate, ignored
    /// per §4.6's idempotency requirement).
    pub async fn record_reward(
        &self,
        decision_id: &str,
        arm: Arm,
        context: &[f64],
        reward: f64,
        meta: Option<&serde_json::Value>,
    ) -> AppResult<bool> {
        let context_json = serde_json::to_string(context)
            .map_err(|e| AppError::internal(format!("serialize context: {e}")))?;
        let meta_json = meta
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::internal(format!("serialize meta: {e}")))?;
        let now = Utc::now();
        let conn = self.conn.lock().await;
        let inserted = conn
            .execute(
                "INSERT INTO rewards (decision_id, arm_name, context_json, reward, meta_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(decision_id) DO NOTHING",
                params![decision_id, arm.as_str(), context_json, reward, meta_json, now.to_rfc3339()],
            )
            .map_err(|e| AppError::internal(format!("insert reward: {e}")))?;
        if inserted == 0 {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO bandit_log (ts, arm_name, context_json, reward, decision_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![now.to_rfc3339(), arm.as_str(), context_json, reward, decision_id],
        )
        .map_err(|e| AppError::internal(format!("insert bandit_log: {e}")))?;
        Ok(true)
    }

    /// Looks up the `TradePlan` recorded by `record_decision`, used by the
    /// reward path to recover the LLM-reported confidence for a calibration
    /// sample (§4.8) without the caller having to resend the plan.
    pub async fn get_decision_plan(&self, decision_id: &str) -> AppResult<Option<TradePlan>> {
        let conn = self.conn.lock().await;
        let plan_json: Option<String> = conn
            .query_row(
                "SELECT plan_json FROM decisions WHERE decision_id = ?1",
                params![decision_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| AppError::internal(format!("query decisions: {e}")))?;
        let Some(plan_json) = plan_json else {
            return Ok(None);
        };
        let plan = serde_json::from_str(&plan_json)
            .map_err(|e| AppError::internal(format!("parse plan_json: {e}")))?;
        Ok(Some(plan))
    }

    /// Returns the most recently fetched event row for `ticker` — uniqueness on
    /// disk is the composite `(ticker, event_type, event_time)` (§3/§6), so a
    /// ticker may have several cached events; the freshest fetch is the one
    /// `EventCache::next_event` treats as "the next event" for TTL purposes.
    pub async fn get_event_cache(&self, ticker: &str) -> AppResult<Option<EventCacheRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT event_type, event_time, materiality, source, fetched_at
                 FROM event_cache WHERE ticker = ?1
                 ORDER BY fetched_at DESC LIMIT 1",
                params![ticker],
                |r| {
                    let event_time: String = r.get(1)?;
                    let fetched_at: String = r.get(4)?;
                    Ok((
                        r.get::<_, String>(0)?,
                        event_time,
                        r.get::<_, f64>(2)?,
                        r.get::<_, String>(3)?,
                        fetched_at,
                    ))
                },
            )
            .optional()
            .map_err(|e| AppError::internal(format!("query event_cache: {e}")))?;
        let Some((event_type, event_time, materiality, source, fetched_at)) = row else {
            return Ok(None);
        };
        Ok(Some(EventCacheRow {
            event_type,
            event_time: parse_rfc3339(&event_time)?,
            materiality,
            source,
            fetched_at: parse_rfc3339(&fetched_at)?,
        }))
    }

    pub async fn put_event_cache(
        &self,
        ticker: &str,
        event_type: &str,
        event_time: DateTime<Utc>,
        materiality: f64,
        source: &str,
    ) -> AppResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO event_cache (ticker, event_type, event_time, materiality, source, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(ticker, event_type, event_time) DO UPDATE SET
                materiality = excluded.materiality,
                source = excluded.source,
                fetched_at = excluded.fetched_at",
            params![
                ticker,
                event_type,
                event_time.to_rfc3339(),
                materiality,
                source,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| AppError::internal(format!("upsert event_cache: {e}")))?;
        Ok(())
    }

    pub async fn bandit_logs(&self, limit: i64) -> AppResult<Vec<BanditLogEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT ts, arm_name, context_json, reward, decision_id
                 FROM bandit_log ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| AppError::internal(format!("prepare bandit_log query: {e}")))?;
        let rows = stmt
            .query_map(params![limit], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, f64>(3)?,
                    r.get::<_, Option<String>>(4)?,
                ))
            })
            .map_err(|e| AppError::internal(format!("query bandit_log: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            let (ts, arm_name, context_json, reward, decision_id) =
                row.map_err(|e| AppError::internal(format!("read bandit_log row: {e}")))?;
            out.push(BanditLogEntry {
                ts: parse_rfc3339(&ts)?,
                arm_name: Arm::from_str_loose(&arm_name)
                    .ok_or_else(|| AppError::internal(format!("unknown arm in log: {arm_name}")))?,
                context: serde_json::from_str(&context_json)
                    .map_err(|e| AppError::internal(format!("parse context_json: {e}")))?,
                reward,
                decision_id,
            });
        }
        Ok(out)
    }

    pub async fn bandit_stats(&self) -> AppResult<BanditStats> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT arm_name, COUNT(*), AVG(reward), MIN(reward), MAX(reward)
                 FROM bandit_log GROUP BY arm_name",
            )
            .map_err(|e| AppError::internal(format!("prepare bandit_stats query: {e}")))?;
        let rows = stmt
            .query_map([], |r| {
                Ok(ArmAggregate {
                    arm_name: Arm::from_str_loose(&r.get::<_, String>(0)?)
                        .unwrap_or(Arm::Skip),
                    count: r.get(1)?,
                    avg_reward: r.get(2)?,
                    min_reward: r.get(3)?,
                    max_reward: r.get(4)?,
                })
            })
            .map_err(|e| AppError::internal(format!("query bandit_stats: {e}")))?;
        let mut arm_stats = Vec::new();
        let mut total = 0;
        for row in rows {
            let agg = row.map_err(|e| AppError::internal(format!("read bandit_stats row: {e}")))?;
            total += agg.count;
            arm_stats.push(ArmStats {
                arm_name: agg.arm_name,
                count: agg.count,
                avg_reward: agg.avg_reward,
                min_reward: agg.min_reward,
                max_reward: agg.max_reward,
            });
        }
        Ok(BanditStats { total, arm_stats })
    }

    /// Replays rewards recorded in the `rewards` table that have no matching
    /// `bandit_log` row — the crash-recovery path between the RewardLog
    /// insert and the BanditLog append (§4.6). Returns the `(decision_id,
    /// arm_name, context, reward)` tuples that were replayed so a caller can
    /// apply them to the in-memory bandit.
    pub async fn reconcile(&self) -> AppResult<Vec<(String, Arm, Vec<f64>, f64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT r.decision_id, r.arm_name, r.context_json, r.reward, r.created_at
                 FROM rewards r
                 LEFT JOIN bandit_log b ON b.decision_id = r.decision_id
                 WHERE b.decision_id IS NULL",
            )
            .map_err(|e| AppError::internal(format!("prepare reconcile query: {e}")))?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, f64>(3)?,
                    r.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| AppError::internal(format!("query reconcile: {e}")))?;
        let mut missing = Vec::new();
        for row in rows {
            let (decision_id, arm_name, context_json, reward, created_at) =
                row.map_err(|e| AppError::internal(format!("read reconcile row: {e}")))?;
            let arm = Arm::from_str_loose(&arm_name)
                .ok_or_else(|| AppError::internal(format!("unknown arm in reward: {arm_name}")))?;
            let context: Vec<f64> = serde_json::from_str(&context_json)
                .map_err(|e| AppError::internal(format!("parse context_json: {e}")))?;
            missing.push((decision_id, arm, context, reward, created_at));
        }
        for (decision_id, arm, context, reward, created_at) in &missing {
            let context_json = serde_json::to_string(context)
                .map_err(|e| AppError::internal(format!("serialize context: {e}")))?;
            conn.execute(
                "INSERT INTO bandit_log (ts, arm_name, context_json, reward, decision_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![created_at, arm.as_str(), context_json, reward, decision_id],
            )
            .map_err(|e| AppError::internal(format!("insert bandit_log during reconcile: {e}")))?;
        }
        Ok(missing
            .into_iter()
            .map(|(decision_id, arm, context, reward, _)| (decision_id, arm, context, reward))
            .collect())
    }
}

fn parse_rfc3339(s: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::internal(format!("parse timestamp {s}: {e}")))
}
