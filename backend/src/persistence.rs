//! Persistence Gateway (§4.B) — the only component that touches Postgres.
//!
//! Connection pooling and schema bootstrap follow this stack's established
//! shape: `PgPoolOptions` plus idempotent `CREATE TABLE IF NOT EXISTS`
//! statements run at startup, no external migration runner. Every write and
//! read goes through [`PersistenceGateway`]; callers never see a `PgRow` or
//! a raw connection.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{QueryBuilder, Row};
use telemetry_types::{
    Anomaly, Device, DeviceCounts, DetectorTag, Location, PageParams, Pagination, Point,
};
use uuid::Uuid;

use crate::error::{FatalError, StoreError};

const STARTUP_MAX_ATTEMPTS: u32 = 5;
const RETRY_MAX_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

fn qe(err: sqlx::Error) -> StoreError {
    StoreError::Query(err.to_string())
}

/// Run `op` with exponential backoff (base 100ms, factor 2, cap 30s),
/// bounded at [`RETRY_MAX_ATTEMPTS`] attempts.
async fn retry<F, Fut, T>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0u32;
    let mut delay = RETRY_BASE_DELAY;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 >= RETRY_MAX_ATTEMPTS => {
                return Err(StoreError::RetriesExhausted {
                    attempts: attempt + 1,
                    source: Box::new(err),
                });
            }
            Err(err) => {
                tracing::warn!(attempt, error = %err, "persistence operation failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY);
                attempt += 1;
            }
        }
    }
}

pub struct PersistenceGateway {
    pool: PgPool,
}

impl PersistenceGateway {
    /// Connect with a bounded startup retry budget; failure beyond that
    /// budget is a [`FatalError`] (spec §6 — process exits 1).
    pub async fn connect(database_url: &str) -> Result<Self, FatalError> {
        let mut attempt = 0u32;
        let mut delay = RETRY_BASE_DELAY;
        loop {
            match PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(10))
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    let gateway = Self { pool };
                    gateway
                        .bootstrap_schema()
                        .await
                        .map_err(|e| FatalError::StoreUnreachable(e.to_string()))?;
                    tracing::info!("connected to persistence store and bootstrapped schema");
                    return Ok(gateway);
                }
                Err(err) if attempt + 1 >= STARTUP_MAX_ATTEMPTS => {
                    return Err(FatalError::StoreUnreachable(err.to_string()));
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "database connection failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_MAX_DELAY);
                    attempt += 1;
                }
            }
        }
    }

    async fn bootstrap_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                lat DOUBLE PRECISION,
                lng DOUBLE PRECISION,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS points (
                id UUID PRIMARY KEY,
                device_id TEXT NOT NULL REFERENCES devices(id),
                arrival_seq BIGINT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                temperature_c DOUBLE PRECISION NOT NULL,
                vibration_g DOUBLE PRECISION NOT NULL,
                humidity_pct DOUBLE PRECISION NOT NULL,
                voltage_v DOUBLE PRECISION NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS points_device_ts_idx ON points (device_id, ts DESC)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS anomalies (
                id UUID PRIMARY KEY,
                device_id TEXT NOT NULL REFERENCES devices(id),
                point_id UUID REFERENCES points(id) ON DELETE SET NULL,
                score DOUBLE PRECISION NOT NULL,
                detector TEXT NOT NULL,
                flagged BOOLEAN NOT NULL,
                ts TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS anomalies_device_ts_idx ON anomalies (device_id, ts DESC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Round-trip latency of a trivial query, used by `/api/health`.
    pub async fn ping(&self) -> Result<Duration, StoreError> {
        let start = std::time::Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(qe)?;
        Ok(start.elapsed())
    }

    /// Idempotent upsert: a re-seen device id updates the name and, when a
    /// new location is supplied, the location — it never clobbers an
    /// existing location with a missing one (MQTT points rarely carry it).
    pub async fn insert_device(
        &self,
        id: &str,
        name: &str,
        location: Option<Location>,
    ) -> Result<Device, StoreError> {
        let (lat, lng) = match location {
            Some(loc) => (Some(loc.lat), Some(loc.lng)),
            None => (None, None),
        };

        retry(|| async {
            let row = sqlx::query(
                r#"
                INSERT INTO devices (id, name, lat, lng)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    lat = COALESCE(EXCLUDED.lat, devices.lat),
                    lng = COALESCE(EXCLUDED.lng, devices.lng)
                RETURNING id, name, lat, lng, created_at
                "#,
            )
            .bind(id)
            .bind(name)
            .bind(lat)
            .bind(lng)
            .fetch_one(&self.pool)
            .await
            .map_err(qe)?;

            device_from_row(&row, None)
        })
        .await
    }

    pub async fn get_device(&self, id: &str) -> Result<Option<Device>, StoreError> {
        let row = sqlx::query("SELECT id, name, lat, lng, created_at FROM devices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(qe)?;

        let Some(row) = row else { return Ok(None) };
        let counts = self.device_counts(id).await?;
        Ok(Some(device_from_row(&row, Some(counts))?))
    }

    async fn device_counts(&self, device_id: &str) -> Result<DeviceCounts, StoreError> {
        let metrics: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM points WHERE device_id = $1")
            .bind(device_id)
            .fetch_one(&self.pool)
            .await
            .map_err(qe)?;
        let anomalies: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM anomalies WHERE device_id = $1")
            .bind(device_id)
            .fetch_one(&self.pool)
            .await
            .map_err(qe)?;
        Ok(DeviceCounts { metrics, anomalies })
    }

    pub async fn list_devices(&self, page: PageParams) -> Result<(Vec<Device>, Pagination), StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, lat, lng, created_at
            FROM devices
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(qe)?;

        let mut devices = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id").map_err(qe)?;
            let counts = self.device_counts(&id).await?;
            devices.push(device_from_row(row, Some(counts))?);
        }

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await
            .map_err(qe)?;

        Ok((
            devices,
            Pagination { limit: page.limit, offset: page.offset, total },
        ))
    }

    /// All-or-nothing, single multi-row insert. Returns the ids of the rows
    /// inserted — callers already generated them, so this is a confirmation
    /// rather than a handoff.
    pub async fn insert_points(&self, points: &[Point]) -> Result<Vec<Uuid>, StoreError> {
        if points.is_empty() {
            return Ok(Vec::new());
        }

        retry(|| async {
            let mut builder = QueryBuilder::new(
                "INSERT INTO points (id, device_id, arrival_seq, ts, temperature_c, vibration_g, humidity_pct, voltage_v) ",
            );
            builder.push_values(points, |mut b, point| {
                b.push_bind(point.id)
                    .push_bind(&point.device_id)
                    .push_bind(point.arrival_seq as i64)
                    .push_bind(point.ts)
                    .push_bind(point.measurements.temperature_c)
                    .push_bind(point.measurements.vibration_g)
                    .push_bind(point.measurements.humidity_pct)
                    .push_bind(point.measurements.voltage_v);
            });
            builder.build().execute(&self.pool).await.map_err(qe)?;
            Ok(())
        })
        .await?;

        Ok(points.iter().map(|p| p.id).collect())
    }

    /// The most recent `limit` points for a device, in arrival order —
    /// used to warm a freshly-spawned device worker's detector windows from
    /// history on restart (spec §3 lifecycle: "lazily (re)constructed from
    /// the store on first reference").
    pub async fn list_recent_points(&self, device_id: &str, limit: i64) -> Result<Vec<Point>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_id, arrival_seq, ts, temperature_c, vibration_g, humidity_pct, voltage_v
            FROM points
            WHERE device_id = $1
            ORDER BY arrival_seq DESC
            LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(qe)?;

        let mut points = rows.iter().map(point_from_row).collect::<Result<Vec<_>, _>>()?;
        points.reverse();
        Ok(points)
    }

    pub async fn list_points(
        &self,
        device_id: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        page: PageParams,
    ) -> Result<(Vec<Point>, Pagination), StoreError> {
        let mut builder = QueryBuilder::new(
            "SELECT id, device_id, arrival_seq, ts, temperature_c, vibration_g, humidity_pct, voltage_v FROM points WHERE 1=1",
        );
        push_range_filters(&mut builder, device_id, from, to);
        builder.push(" ORDER BY ts DESC LIMIT ").push_bind(page.limit);
        builder.push(" OFFSET ").push_bind(page.offset);

        let rows = builder.build().fetch_all(&self.pool).await.map_err(qe)?;
        let points = rows.iter().map(point_from_row).collect::<Result<Vec<_>, _>>()?;

        let mut count_builder = QueryBuilder::new("SELECT COUNT(*) FROM points WHERE 1=1");
        push_range_filters(&mut count_builder, device_id, from, to);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(qe)?;

        Ok((points, Pagination { limit: page.limit, offset: page.offset, total }))
    }

    /// Best-effort: duplicate ids are silently ignored rather than failing
    /// the whole batch.
    pub async fn insert_anomalies(&self, anomalies: &[Anomaly]) -> Result<(), StoreError> {
        if anomalies.is_empty() {
            return Ok(());
        }

        retry(|| async {
            let mut builder = QueryBuilder::new(
                "INSERT INTO anomalies (id, device_id, point_id, score, detector, flagged, ts) ",
            );
            builder.push_values(anomalies, |mut b, anomaly| {
                b.push_bind(anomaly.id)
                    .push_bind(&anomaly.device_id)
                    .push_bind(anomaly.point_id)
                    .push_bind(anomaly.score)
                    .push_bind(anomaly.detector.as_str())
                    .push_bind(anomaly.flagged)
                    .push_bind(anomaly.ts);
            });
            builder.push(" ON CONFLICT (id) DO NOTHING");
            builder.build().execute(&self.pool).await.map_err(qe)?;
            Ok(())
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn list_anomalies(
        &self,
        device_id: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        detector: Option<DetectorTag>,
        flagged: Option<bool>,
        page: PageParams,
    ) -> Result<(Vec<Anomaly>, Pagination), StoreError> {
        let mut builder = QueryBuilder::new(
            "SELECT id, device_id, point_id, score, detector, flagged, ts FROM anomalies WHERE 1=1",
        );
        push_anomaly_filters(&mut builder, device_id, from, to, detector, flagged);
        builder.push(" ORDER BY ts DESC LIMIT ").push_bind(page.limit);
        builder.push(" OFFSET ").push_bind(page.offset);

        let rows = builder.build().fetch_all(&self.pool).await.map_err(qe)?;
        let anomalies = rows.iter().map(anomaly_from_row).collect::<Result<Vec<_>, _>>()?;

        let mut count_builder = QueryBuilder::new("SELECT COUNT(*) FROM anomalies WHERE 1=1");
        push_anomaly_filters(&mut count_builder, device_id, from, to, detector, flagged);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(qe)?;

        Ok((anomalies, Pagination { limit: page.limit, offset: page.offset, total }))
    }
}

fn push_range_filters<'a>(
    builder: &mut QueryBuilder<'a, sqlx::Postgres>,
    device_id: Option<&'a str>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) {
    if let Some(device_id) = device_id {
        builder.push(" AND device_id = ").push_bind(device_id);
    }
    if let Some(from) = from {
        builder.push(" AND ts >= ").push_bind(from);
    }
    if let Some(to) = to {
        builder.push(" AND ts <= ").push_bind(to);
    }
}

fn push_anomaly_filters<'a>(
    builder: &mut QueryBuilder<'a, sqlx::Postgres>,
    device_id: Option<&'a str>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    detector: Option<DetectorTag>,
    flagged: Option<bool>,
) {
    push_range_filters(builder, device_id, from, to);
    if let Some(detector) = detector {
        builder.push(" AND detector = ").push_bind(detector.as_str());
    }
    if let Some(flagged) = flagged {
        builder.push(" AND flagged = ").push_bind(flagged);
    }
}

fn device_from_row(row: &PgRow, counts: Option<DeviceCounts>) -> Result<Device, StoreError> {
    let lat: Option<f64> = row.try_get("lat").map_err(qe)?;
    let lng: Option<f64> = row.try_get("lng").map_err(qe)?;
    let location = match (lat, lng) {
        (Some(lat), Some(lng)) => Some(Location { lat, lng }),
        _ => None,
    };

    Ok(Device {
        id: row.try_get("id").map_err(qe)?,
        name: row.try_get("name").map_err(qe)?,
        location,
        created_at: row.try_get("created_at").map_err(qe)?,
        counts,
    })
}

fn point_from_row(row: &PgRow) -> Result<Point, StoreError> {
    let arrival_seq: i64 = row.try_get("arrival_seq").map_err(qe)?;
    Ok(Point {
        id: row.try_get("id").map_err(qe)?,
        device_id: row.try_get("device_id").map_err(qe)?,
        arrival_seq: arrival_seq as u64,
        ts: row.try_get("ts").map_err(qe)?,
        measurements: telemetry_types::Measurements {
            temperature_c: row.try_get("temperature_c").map_err(qe)?,
            vibration_g: row.try_get("vibration_g").map_err(qe)?,
            humidity_pct: row.try_get("humidity_pct").map_err(qe)?,
            voltage_v: row.try_get("voltage_v").map_err(qe)?,
        },
    })
}

fn anomaly_from_row(row: &PgRow) -> Result<Anomaly, StoreError> {
    let detector_raw: String = row.try_get("detector").map_err(qe)?;
    let detector = DetectorTag::parse(&detector_raw)
        .ok_or_else(|| StoreError::Query(format!("unknown detector tag in row: {detector_raw}")))?;

    Ok(Anomaly {
        id: row.try_get("id").map_err(qe)?,
        device_id: row.try_get("device_id").map_err(qe)?,
        point_id: row.try_get("point_id").map_err(qe)?,
        score: row.try_get("score").map_err(qe)?,
        detector,
        flagged: row.try_get("flagged").map_err(qe)?,
        ts: row.try_get("ts").map_err(qe)?,
    })
}
