use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{PgExecutor, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::ledger::{BeginOutcome, LedgerEntry, RunStatus};
use crate::models::{
    Assignment, AssignmentTarget, ClassifiedRecord, DeviceStats, GridCell, LoadMode, RegionKind,
    RegionRecord,
};
use crate::region::NewRegion;
use crate::store::Store;

/// Key for `pg_advisory_xact_lock`, serializing run admission across processes.
const LEDGER_LOCK_KEY: i64 = 0x7465_6c65_6d65_7472;

/// Rows per multi-row INSERT, kept well under the 65535 bind-parameter limit.
const INSERT_CHUNK: usize = 1_000;

pub async fn init_db(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts imported regions; with `replace` the table is emptied first.
    pub async fn insert_regions(
        &self,
        kind: RegionKind,
        regions: &[NewRegion],
        replace: bool,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        if replace {
            sqlx::query(&format!("DELETE FROM {}", kind.table()))
                .execute(&mut *tx)
                .await?;
        }

        let mut inserted = 0;
        for region in regions {
            let result = sqlx::query(&format!(
                r#"
                INSERT INTO {} (name, code, geometry, area_km2, perimeter_km)
                VALUES ($1, $2, $3, $4, $5)
                "#,
                kind.table()
            ))
            .bind(&region.name)
            .bind(&region.code)
            .bind(&region.geometry)
            .bind(region.area_km2)
            .bind(region.perimeter_km)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

async fn insert_entry<'e, E: PgExecutor<'e>>(
    executor: E,
    entry: &LedgerEntry,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO etl_ledger
        (run_id, recorded_at, started_at, status, last_processed_id,
         records_processed, duration_ms, error_message)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.run_id)
    .bind(entry.recorded_at)
    .bind(entry.started_at)
    .bind(entry.status.as_str())
    .bind(entry.last_processed_id)
    .bind(entry.records_processed)
    .bind(entry.duration_ms)
    .bind(&entry.error)
    .execute(executor)
    .await?;
    Ok(())
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(LedgerEntry {
        run_id: row.try_get("run_id")?,
        started_at: row.try_get("started_at")?,
        recorded_at: row.try_get("recorded_at")?,
        status: status.parse().map_err(StoreError::Message)?,
        last_processed_id: row.try_get("last_processed_id")?,
        records_processed: row.try_get("records_processed")?,
        duration_ms: row.try_get("duration_ms")?,
        error: row.try_get("error_message")?,
    })
}

const LEDGER_COLUMNS: &str = "run_id, recorded_at, started_at, status, last_processed_id, \
     records_processed, duration_ms, error_message";

#[async_trait]
impl Store for PgStore {
    #[tracing::instrument(level = "debug", skip_all, fields(run_id = %run_id))]
    async fn begin_run(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        lease: Duration,
    ) -> Result<BeginOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(LEDGER_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {LEDGER_COLUMNS}
            FROM etl_ledger r
            WHERE r.status = 'RUNNING'
              AND NOT EXISTS (
                SELECT 1 FROM etl_ledger t
                WHERE t.run_id = r.run_id AND t.status <> 'RUNNING'
              )
            ORDER BY r.started_at
            "#
        ))
        .fetch_all(&mut *tx)
        .await?;

        let now = Utc::now();
        let mut holder = None;
        for row in &rows {
            let active = entry_from_row(row)?;
            if active.lease_expired(now, lease) {
                tracing::warn!(
                    run_id = %active.run_id,
                    started_at = %active.started_at,
                    "closing abandoned run"
                );
                let closed = LedgerEntry::failed(
                    active.run_id,
                    active.started_at,
                    active.last_processed_id,
                    "lease expired",
                );
                insert_entry(&mut *tx, &closed).await?;
            } else if holder.is_none() {
                holder = Some(active.run_id);
            }
        }

        if let Some(holder) = holder {
            tx.commit().await?;
            return Ok(BeginOutcome::Busy { run_id: holder });
        }

        let cursor: Option<i64> = sqlx::query(
            r#"
            SELECT last_processed_id FROM etl_ledger
            WHERE status = 'SUCCESS'
            ORDER BY recorded_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get::<Option<i64>, _>("last_processed_id"))
        .transpose()?
        .flatten();

        insert_entry(
            &mut *tx,
            &LedgerEntry::running(run_id, started_at, cursor),
        )
        .await?;
        tx.commit().await?;
        Ok(BeginOutcome::Acquired { cursor })
    }

    async fn append_ledger(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        insert_entry(&self.pool, entry).await
    }

    async fn last_success(&self) -> Result<Option<LedgerEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM etl_ledger WHERE status = $1 \
             ORDER BY recorded_at DESC, id DESC LIMIT 1"
        ))
        .bind(RunStatus::Success.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn recent_ledger(&self, limit: i64) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM etl_ledger ORDER BY recorded_at DESC, id DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(records = records.len(), mode = ?mode))]
    async fn upsert_records(
        &self,
        records: &[ClassifiedRecord],
        mode: LoadMode,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        if mode == LoadMode::Overwrite {
            let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
            sqlx::query("DELETE FROM telemetry_points WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
        }

        let processed_at = Utc::now();
        let mut written = 0;
        for chunk in records.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO telemetry_points (id, device_id, device_name, latitude, longitude, \
                 altitude, speed, battery, signal, operator, network_type, recorded_at, period, \
                 altitude_band, battery_band, signal_band, speed_band, network_generation, \
                 operator_normalized, grid_lat, grid_lon, processed_at) ",
            );
            builder.push_values(chunk, |mut b, r| {
                b.push_bind(r.id)
                    .push_bind(&r.device_id)
                    .push_bind(&r.device_name)
                    .push_bind(r.latitude)
                    .push_bind(r.longitude)
                    .push_bind(r.altitude)
                    .push_bind(r.speed)
                    .push_bind(r.battery)
                    .push_bind(r.signal)
                    .push_bind(&r.operator)
                    .push_bind(&r.network_type)
                    .push_bind(r.recorded_at)
                    .push_bind(r.period.as_str())
                    .push_bind(r.altitude_band.map(|v| v.as_str()))
                    .push_bind(r.battery_band.map(|v| v.as_str()))
                    .push_bind(r.signal_band.map(|v| v.as_str()))
                    .push_bind(r.speed_band.as_str())
                    .push_bind(r.network_generation.as_str())
                    .push_bind(&r.operator_normalized)
                    .push_bind(r.grid_lat)
                    .push_bind(r.grid_lon)
                    .push_bind(processed_at);
            });
            builder.push(
                " ON CONFLICT (id) DO UPDATE SET \
                 device_id = EXCLUDED.device_id, device_name = EXCLUDED.device_name, \
                 latitude = EXCLUDED.latitude, longitude = EXCLUDED.longitude, \
                 altitude = EXCLUDED.altitude, speed = EXCLUDED.speed, \
                 battery = EXCLUDED.battery, signal = EXCLUDED.signal, \
                 operator = EXCLUDED.operator, network_type = EXCLUDED.network_type, \
                 recorded_at = EXCLUDED.recorded_at, period = EXCLUDED.period, \
                 altitude_band = EXCLUDED.altitude_band, battery_band = EXCLUDED.battery_band, \
                 signal_band = EXCLUDED.signal_band, speed_band = EXCLUDED.speed_band, \
                 network_generation = EXCLUDED.network_generation, \
                 operator_normalized = EXCLUDED.operator_normalized, \
                 grid_lat = EXCLUDED.grid_lat, grid_lon = EXCLUDED.grid_lon, \
                 processed_at = EXCLUDED.processed_at",
            );
            written += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn replace_grid_cells(&self, run_id: Uuid, cells: &[GridCell]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM grid_cells").execute(&mut *tx).await?;

        let updated_at = Utc::now();
        let mut written = 0;
        for chunk in cells.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO grid_cells (grid_lat, grid_lon, cell_size, cell_polygon, point_count, \
                 unique_device_count, avg_battery, avg_signal, avg_altitude, avg_speed, \
                 network_distribution, operator_distribution, run_id, updated_at) ",
            );
            builder.push_values(chunk, |mut b, cell| {
                b.push_bind(cell.grid_lat)
                    .push_bind(cell.grid_lon)
                    .push_bind(cell.cell_size)
                    .push_bind(cell.polygon_ewkt())
                    .push_bind(cell.point_count)
                    .push_bind(cell.unique_device_count)
                    .push_bind(cell.avg_battery)
                    .push_bind(cell.avg_signal)
                    .push_bind(cell.avg_altitude)
                    .push_bind(cell.avg_speed)
                    .push_bind(Json(&cell.network_distribution))
                    .push_bind(Json(&cell.operator_distribution))
                    .push_bind(run_id)
                    .push_bind(updated_at);
            });
            written += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn replace_device_stats(
        &self,
        run_id: Uuid,
        stats: &[DeviceStats],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM device_statistics")
            .execute(&mut *tx)
            .await?;

        let updated_at = Utc::now();
        let mut written = 0;
        for chunk in stats.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO device_statistics (device_id, device_name, total_records, first_seen, \
                 last_seen, avg_battery, avg_signal, avg_speed, mean_latitude, mean_longitude, \
                 run_id, updated_at) ",
            );
            builder.push_values(chunk, |mut b, device| {
                b.push_bind(&device.device_id)
                    .push_bind(&device.device_name)
                    .push_bind(device.total_records)
                    .push_bind(device.first_seen)
                    .push_bind(device.last_seen)
                    .push_bind(device.avg_battery)
                    .push_bind(device.avg_signal)
                    .push_bind(device.avg_speed)
                    .push_bind(device.mean_latitude)
                    .push_bind(device.mean_longitude)
                    .push_bind(run_id)
                    .push_bind(updated_at);
            });
            written += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn load_regions(&self, kind: RegionKind) -> Result<Vec<RegionRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT id, name, geometry, area_km2, perimeter_km FROM {} ORDER BY id",
            kind.table()
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut regions = Vec::with_capacity(rows.len());
        for row in rows {
            regions.push(RegionRecord {
                id: row.try_get("id")?,
                kind,
                name: row.try_get("name")?,
                geometry: row.try_get("geometry")?,
                area_km2: row.try_get("area_km2")?,
                perimeter_km: row.try_get("perimeter_km")?,
            });
        }
        Ok(regions)
    }

    async fn clear_assignments(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE telemetry_points
            SET district_id = NULL, province_id = NULL
            WHERE district_id IS NOT NULL OR province_id IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn pending_assignments(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<AssignmentTarget>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, latitude, longitude, district_id, province_id
            FROM telemetry_points
            WHERE id > $1 AND (district_id IS NULL OR province_id IS NULL)
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut targets = Vec::with_capacity(rows.len());
        for row in rows {
            targets.push(AssignmentTarget {
                id: row.try_get("id")?,
                latitude: row.try_get("latitude")?,
                longitude: row.try_get("longitude")?,
                district_id: row.try_get("district_id")?,
                province_id: row.try_get("province_id")?,
            });
        }
        Ok(targets)
    }

    async fn apply_assignments(&self, updates: &[Assignment]) -> Result<u64, StoreError> {
        let (district_ids, districts): (Vec<i64>, Vec<i64>) = updates
            .iter()
            .filter_map(|u| u.district_id.map(|d| (u.id, d)))
            .unzip();
        let (province_ids, provinces): (Vec<i64>, Vec<i64>) = updates
            .iter()
            .filter_map(|u| u.province_id.map(|p| (u.id, p)))
            .unzip();

        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        if !district_ids.is_empty() {
            written += sqlx::query(
                r#"
                UPDATE telemetry_points t
                SET district_id = u.region_id
                FROM UNNEST($1::BIGINT[], $2::BIGINT[]) AS u(id, region_id)
                WHERE t.id = u.id AND t.district_id IS NULL
                "#,
            )
            .bind(&district_ids)
            .bind(&districts)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        if !province_ids.is_empty() {
            written += sqlx::query(
                r#"
                UPDATE telemetry_points t
                SET province_id = u.region_id
                FROM UNNEST($1::BIGINT[], $2::BIGINT[]) AS u(id, region_id)
                WHERE t.id = u.id AND t.province_id IS NULL
                "#,
            )
            .bind(&province_ids)
            .bind(&provinces)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }
}
