//! The scan state store. Every SQL statement in the coordinator lives here;
//! handlers never touch the pool directly.

use crate::error::StoreError;
use crate::models::{Job, ScanRow, ScanStatus};
use crate::ruleset::RulesetSnapshot;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Postgres, QueryBuilder};
use std::collections::{HashMap, HashSet};
use tracing::info;
use uuid::Uuid;

const SCAN_COLS: &str = "scan_id, name, version, status, score, inspector_url, commit_hash, files, \
     fail_reason, queued_at, queued_by, pending_at, pending_by, finished_at, finished_by, \
     reported_at, reported_by";

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error().and_then(|d| d.code()).as_deref() == Some("23505")
}

/// Keyset-pagination cursor: the ordering timestamp (Unix microseconds, so
/// sub-second neighbours are not skipped) plus the row id as a tie-break,
/// rendered as `<micros>:<scan-id>`. Opaque to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub ts: i64,
    pub id: Uuid,
}

impl Cursor {
    pub fn after(ts: DateTime<Utc>, id: Uuid) -> Self {
        Self { ts: ts.timestamp_micros(), id }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.ts, self.id)
    }

    pub fn decode(s: &str) -> Option<Self> {
        let (ts, id) = s.split_once(':')?;
        Some(Self { ts: ts.parse().ok()?, id: id.parse().ok()? })
    }

    fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.ts).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub name: Option<String>,
    pub version: Option<String>,
    pub status: Option<ScanStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub cursor: Option<Cursor>,
    pub limit: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListOrder {
    FinishedDesc,
    QueuedAsc,
    QueuedDesc,
}

impl ListFilter {
    /// Finished listings page newest-first on `finished_at`; queue
    /// introspection pages oldest-first on `queued_at`; everything else
    /// newest-queued-first.
    fn order(&self) -> ListOrder {
        match self.status {
            Some(ScanStatus::Finished) => ListOrder::FinishedDesc,
            Some(ScanStatus::Queued) | Some(ScanStatus::Pending) => ListOrder::QueuedAsc,
            _ if self.since.is_some() || self.until.is_some() => ListOrder::FinishedDesc,
            _ => ListOrder::QueuedDesc,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct Stats {
    pub ingested: i64,
    pub average_scan_time: f64,
    pub failed: i64,
}

/// Database gateway for scans, rules and their associations. Cheap to clone;
/// wraps the shared pool.
#[derive(Clone)]
pub struct ScanStore {
    pool: Pool<Postgres>,
}

impl ScanStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Insert a scan in QUEUED together with its download URLs.
    pub async fn insert_scan(
        &self,
        name: &str,
        version: &str,
        urls: &[String],
        actor: &str,
    ) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await?;
        let scan_id: Uuid =
            sqlx::query_scalar("INSERT INTO scans (name, version, queued_by) VALUES ($1, $2, $3) RETURNING scan_id")
                .bind(name)
                .bind(version)
                .bind(actor)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        StoreError::DuplicateScan { name: name.to_string(), version: version.to_string() }
                    } else {
                        StoreError::Db(e)
                    }
                })?;
        sqlx::query("INSERT INTO download_urls (scan_id, url) SELECT $1, unnest($2::text[])")
            .bind(scan_id)
            .bind(urls)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(scan_id)
    }

    /// Atomically claim one scan for `actor`: the oldest QUEUED row, or
    /// failing that the longest-expired PENDING row (lease reclaim). Rows
    /// locked by a concurrent dispatcher are skipped, so parallel callers
    /// never receive the same scan and never block on each other.
    pub async fn claim_next(
        &self,
        actor: &str,
        now: DateTime<Utc>,
        lease_expiry_cutoff: DateTime<Utc>,
        ruleset: &RulesetSnapshot,
    ) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let claimed: Option<(Uuid, String, String)> = sqlx::query_as(
            "UPDATE scans SET status = 'pending', pending_at = $1, pending_by = $2, commit_hash = $3 \
             WHERE scan_id = ( \
                 SELECT scan_id FROM scans \
                 WHERE status = 'queued' OR (status = 'pending' AND pending_at < $4) \
                 ORDER BY status = 'pending', \
                          CASE WHEN status = 'queued' THEN queued_at ELSE pending_at END, \
                          scan_id \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1 \
             ) \
             RETURNING scan_id, name, version",
        )
        .bind(now)
        .bind(actor)
        .bind(&ruleset.commit_hash)
        .bind(lease_expiry_cutoff)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((scan_id, name, version)) = claimed else {
            return Ok(None);
        };
        let distributions: Vec<String> = sqlx::query_scalar("SELECT url FROM download_urls WHERE scan_id = $1")
            .bind(scan_id)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(scan_id = %scan_id, name = %name, version = %version, pending_by = %actor, "scan_dispatched");
        Ok(Some(Job {
            name,
            version,
            distributions,
            hash: ruleset.commit_hash.clone(),
            rules: ruleset.rule_names.clone(),
        }))
    }

    /// Apply a worker's successful verdict: PENDING -> FINISHED, with rule
    /// links resolved against the rules table. A rule name the coordinator
    /// does not know rolls the whole submit back and leaves the scan PENDING.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit(
        &self,
        name: &str,
        version: &str,
        actor: &str,
        score: i32,
        inspector_url: &str,
        rule_names: &[String],
        files: Option<&serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let scan_id = Self::lock_owned_pending(&mut tx, name, version, actor).await?;

        let wanted: HashSet<&str> = rule_names.iter().map(String::as_str).collect();
        let resolved: Vec<(Uuid, String)> = sqlx::query_as("SELECT id, name FROM rules WHERE name = ANY($1)")
            .bind(rule_names)
            .fetch_all(&mut *tx)
            .await?;
        let known: HashSet<&str> = resolved.iter().map(|(_, n)| n.as_str()).collect();
        let missing: Vec<String> = wanted.difference(&known).map(|n| n.to_string()).collect();
        if !missing.is_empty() {
            // Dropping the transaction keeps the scan PENDING for redispatch.
            return Err(StoreError::UnknownRule(missing));
        }

        sqlx::query(
            "UPDATE scans SET status = 'finished', finished_at = $1, finished_by = $2, \
             score = $3, inspector_url = $4, files = $5 WHERE scan_id = $6",
        )
        .bind(now)
        .bind(actor)
        .bind(score)
        .bind(inspector_url)
        .bind(files)
        .bind(scan_id)
        .execute(&mut *tx)
        .await?;

        if !resolved.is_empty() {
            let rule_ids: Vec<Uuid> = resolved.iter().map(|(id, _)| *id).collect();
            sqlx::query("INSERT INTO package_rules (scan_id, rule_id) SELECT $1, unnest($2::uuid[])")
                .bind(scan_id)
                .bind(&rule_ids)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(name = %name, version = %version, score, finished_by = %actor, "scan_submitted");
        Ok(())
    }

    /// Apply a worker's failure report: PENDING -> FAILED.
    pub async fn fail(
        &self,
        name: &str,
        version: &str,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let scan_id = Self::lock_owned_pending(&mut tx, name, version, actor).await?;
        sqlx::query(
            "UPDATE scans SET status = 'failed', finished_at = $1, finished_by = $2, fail_reason = $3 \
             WHERE scan_id = $4",
        )
        .bind(now)
        .bind(actor)
        .bind(reason)
        .bind(scan_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(name = %name, version = %version, reason = %reason, finished_by = %actor, "scan_failed");
        Ok(())
    }

    /// Lock the scan row and verify the caller may write its outcome.
    async fn lock_owned_pending(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        name: &str,
        version: &str,
        actor: &str,
    ) -> Result<Uuid, StoreError> {
        let row: Option<(Uuid, ScanStatus, Option<String>)> =
            sqlx::query_as("SELECT scan_id, status, pending_by FROM scans WHERE name = $1 AND version = $2 FOR UPDATE")
                .bind(name)
                .bind(version)
                .fetch_optional(&mut **tx)
                .await?;
        let Some((scan_id, status, pending_by)) = row else {
            return Err(StoreError::NotFound);
        };
        if status != ScanStatus::Pending {
            return Err(StoreError::WrongState { status: status.as_str() });
        }
        if pending_by.as_deref() != Some(actor) {
            return Err(StoreError::NotOwned);
        }
        Ok(scan_id)
    }

    /// Compare-and-set the reported stamps. Succeeds at most once per scan;
    /// the caller must undo with [`clear_reported`](Self::clear_reported) if
    /// the outbound report fails afterwards.
    pub async fn mark_reported(&self, scan_id: Uuid, actor: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE scans SET reported_at = $1, reported_by = $2 \
             WHERE scan_id = $3 AND status = 'finished' AND reported_at IS NULL",
        )
        .bind(now)
        .bind(actor)
        .bind(scan_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 1 {
            return Ok(());
        }
        let row: Option<(ScanStatus, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT status, reported_at FROM scans WHERE scan_id = $1")
                .bind(scan_id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            None => Err(StoreError::NotFound),
            Some((_, Some(_))) => Err(StoreError::AlreadyReported),
            Some((status, None)) => Err(StoreError::WrongState { status: status.as_str() }),
        }
    }

    pub async fn clear_reported(&self, scan_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE scans SET reported_at = NULL, reported_by = NULL WHERE scan_id = $1")
            .bind(scan_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn lookup(&self, name: &str, version: &str) -> Result<Option<ScanRow>, StoreError> {
        let row = sqlx::query_as::<_, ScanRow>(&format!(
            "SELECT {SCAN_COLS} FROM scans WHERE name = $1 AND version = $2"
        ))
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// All scans recorded for a package name, any version.
    pub async fn scans_by_name(&self, name: &str) -> Result<Vec<ScanRow>, StoreError> {
        let rows = sqlx::query_as::<_, ScanRow>(&format!(
            "SELECT {SCAN_COLS} FROM scans WHERE name = $1 ORDER BY queued_at"
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn rule_names_for(&self, scan_id: Uuid) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar(
            "SELECT r.name FROM package_rules pr JOIN rules r ON r.id = pr.rule_id \
             WHERE pr.scan_id = $1 ORDER BY r.name",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    /// Filtered page of scans plus their matched rules and download URLs,
    /// and the cursor for the next page when the page filled up.
    pub async fn list(
        &self,
        filter: &ListFilter,
    ) -> Result<(Vec<(ScanRow, Vec<String>, Vec<String>)>, Option<Cursor>), StoreError> {
        let order = filter.order();
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {SCAN_COLS} FROM scans WHERE TRUE"));
        if let Some(name) = &filter.name {
            qb.push(" AND name = ").push_bind(name);
        }
        if let Some(version) = &filter.version {
            qb.push(" AND version = ").push_bind(version);
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status);
        }
        if let Some(since) = filter.since {
            qb.push(" AND finished_at >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            qb.push(" AND finished_at <= ").push_bind(until);
        }
        match order {
            ListOrder::FinishedDesc => {
                qb.push(" AND finished_at IS NOT NULL");
                if let Some(c) = filter.cursor {
                    qb.push(" AND (finished_at, scan_id) < (")
                        .push_bind(c.timestamp())
                        .push(", ")
                        .push_bind(c.id)
                        .push(")");
                }
                qb.push(" ORDER BY finished_at DESC, scan_id DESC");
            }
            ListOrder::QueuedAsc => {
                if let Some(c) = filter.cursor {
                    qb.push(" AND (queued_at, scan_id) > (")
                        .push_bind(c.timestamp())
                        .push(", ")
                        .push_bind(c.id)
                        .push(")");
                }
                qb.push(" ORDER BY queued_at ASC, scan_id ASC");
            }
            ListOrder::QueuedDesc => {
                if let Some(c) = filter.cursor {
                    qb.push(" AND (queued_at, scan_id) < (")
                        .push_bind(c.timestamp())
                        .push(", ")
                        .push_bind(c.id)
                        .push(")");
                }
                qb.push(" ORDER BY queued_at DESC, scan_id DESC");
            }
        }
        qb.push(" LIMIT ").push_bind(filter.limit);

        let rows: Vec<ScanRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let next_cursor = if rows.len() as i64 == filter.limit {
            rows.last().map(|last| match order {
                ListOrder::FinishedDesc => Cursor::after(last.finished_at.unwrap_or(last.queued_at), last.scan_id),
                ListOrder::QueuedAsc | ListOrder::QueuedDesc => Cursor::after(last.queued_at, last.scan_id),
            })
        } else {
            None
        };
        let page = self.attach_associations(rows).await?;
        Ok((page, next_cursor))
    }

    /// Scans finished at or after `since`, with their matched rules.
    pub async fn finished_since(&self, since: DateTime<Utc>) -> Result<Vec<(ScanRow, Vec<String>)>, StoreError> {
        let rows = sqlx::query_as::<_, ScanRow>(&format!(
            "SELECT {SCAN_COLS} FROM scans WHERE finished_at >= $1 ORDER BY finished_at"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        let with_assoc = self.attach_associations(rows).await?;
        Ok(with_assoc.into_iter().map(|(row, rules, _)| (row, rules)).collect())
    }

    async fn attach_associations(
        &self,
        rows: Vec<ScanRow>,
    ) -> Result<Vec<(ScanRow, Vec<String>, Vec<String>)>, StoreError> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.scan_id).collect();
        let rule_rows: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT pr.scan_id, r.name FROM package_rules pr JOIN rules r ON r.id = pr.rule_id \
             WHERE pr.scan_id = ANY($1) ORDER BY r.name",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        let url_rows: Vec<(Uuid, String)> =
            sqlx::query_as("SELECT scan_id, url FROM download_urls WHERE scan_id = ANY($1)")
                .bind(&ids)
                .fetch_all(&self.pool)
                .await?;

        let mut rules_by_scan: HashMap<Uuid, Vec<String>> = HashMap::new();
        for (id, name) in rule_rows {
            rules_by_scan.entry(id).or_default().push(name);
        }
        let mut urls_by_scan: HashMap<Uuid, Vec<String>> = HashMap::new();
        for (id, url) in url_rows {
            urls_by_scan.entry(id).or_default().push(url);
        }
        Ok(rows
            .into_iter()
            .map(|row| {
                let rules = rules_by_scan.remove(&row.scan_id).unwrap_or_default();
                let urls = urls_by_scan.remove(&row.scan_id).unwrap_or_default();
                (row, rules, urls)
            })
            .collect())
    }

    /// Bring the rules table in line with the current ruleset snapshot:
    /// insert names we have not seen, drop removed names that no finished
    /// scan references (referenced ones stay as history).
    pub async fn reconcile_rules(&self, names: &[String]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO rules (name) SELECT unnest($1::text[]) ON CONFLICT (name) DO NOTHING")
            .bind(names)
            .execute(&mut *tx)
            .await?;
        let dropped = sqlx::query(
            "DELETE FROM rules WHERE name <> ALL($1) \
             AND NOT EXISTS (SELECT 1 FROM package_rules WHERE package_rules.rule_id = rules.id)",
        )
        .bind(names)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        if dropped > 0 {
            info!(dropped, "rules_reconciled");
        }
        Ok(())
    }

    /// Trailing-24h ingest volume, mean worker scan time, and failure count.
    pub async fn stats(&self, now: DateTime<Utc>) -> Result<Stats, StoreError> {
        let since = now - Duration::hours(24);
        let ingested: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scans WHERE queued_at > $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        let average_scan_time: Option<f64> = sqlx::query_scalar(
            "SELECT EXTRACT(EPOCH FROM AVG(finished_at - pending_at))::float8 FROM scans \
             WHERE pending_at IS NOT NULL AND finished_at IS NOT NULL AND queued_at > $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        let failed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scans WHERE status = 'failed' AND queued_at > $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(Stats { ingested, average_scan_time: average_scan_time.unwrap_or(0.0), failed })
    }

    /// Scans currently waiting or leased, for gauge priming at startup.
    pub async fn in_flight_count(&self) -> Result<i64, StoreError> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM scans WHERE status IN ('queued', 'pending')")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}
