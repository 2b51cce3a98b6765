use anyhow::{bail, Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::{from_str, to_string};

use crate::{
    alerts::DerivedMetrics,
    db::{
        connection::Database,
        helpers::{from_millis, to_i64, to_u32, to_u64},
        models::{MetricRecord, SessionSummary, TrendPoint},
    },
    models::{FaceGeometry, RawClassification},
};

const METRIC_COLUMNS: &str = "id, session_id, timestamp_ms, sequence_number,
    face_detected, ear, eye_closed, mar, yawning, yaw, pitch, roll,
    yaw_out_of_range, pitch_out_of_range, roll_out_of_range, gaze_off_road, phone_in_frame,
    face_missing_sustained_ms, eye_closed_sustained_ms, eye_closed_alert, perclos, perclos_alert,
    yawn_sustained_ms, yawn_alert, yawn_count, head_pose_sustained_ms, yaw_alert, pitch_alert,
    roll_alert, gaze_sustained_ms, gaze_alert, phone_usage_sustained_ms, phone_usage_alert,
    geometry_json";

fn row_to_metric(row: &Row) -> Result<MetricRecord> {
    let timestamp_ms: i64 = row.get("timestamp_ms")?;
    let sequence_number: i64 = row.get("sequence_number")?;
    let geometry_json: Option<String> = row.get("geometry_json")?;
    let geometry = geometry_json
        .map(|raw| from_str::<FaceGeometry>(&raw).context("failed to parse geometry_json"))
        .transpose()?;

    let raw = RawClassification {
        face_detected: row.get("face_detected")?,
        ear: row.get("ear")?,
        eye_closed: row.get("eye_closed")?,
        mar: row.get("mar")?,
        yawning: row.get("yawning")?,
        yaw: row.get("yaw")?,
        pitch: row.get("pitch")?,
        roll: row.get("roll")?,
        yaw_out_of_range: row.get("yaw_out_of_range")?,
        pitch_out_of_range: row.get("pitch_out_of_range")?,
        roll_out_of_range: row.get("roll_out_of_range")?,
        gaze_off_road: row.get("gaze_off_road")?,
        phone_in_frame: row.get("phone_in_frame")?,
        geometry,
    };

    let ms = |field: &str| -> Result<u64> { to_u64(row.get(field)?, field) };
    let derived = DerivedMetrics {
        face_missing_sustained_ms: ms("face_missing_sustained_ms")?,
        eye_closed_sustained_ms: ms("eye_closed_sustained_ms")?,
        eye_closed_alert: row.get("eye_closed_alert")?,
        perclos: row.get("perclos")?,
        perclos_alert: row.get("perclos_alert")?,
        yawn_sustained_ms: ms("yawn_sustained_ms")?,
        yawn_alert: row.get("yawn_alert")?,
        yawn_count: to_u32(row.get("yawn_count")?, "yawn_count")?,
        head_pose_sustained_ms: ms("head_pose_sustained_ms")?,
        yaw_alert: row.get("yaw_alert")?,
        pitch_alert: row.get("pitch_alert")?,
        roll_alert: row.get("roll_alert")?,
        gaze_sustained_ms: ms("gaze_sustained_ms")?,
        gaze_alert: row.get("gaze_alert")?,
        phone_usage_sustained_ms: ms("phone_usage_sustained_ms")?,
        phone_usage_alert: row.get("phone_usage_alert")?,
    };

    Ok(MetricRecord {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        timestamp: from_millis(timestamp_ms, "timestamp_ms")?,
        sequence_number: to_u64(sequence_number, "sequence_number")?,
        raw,
        derived,
    })
}

impl Database {
    /// Appends a metric to an open session. Returns the new row id.
    pub async fn insert_metric(&self, record: &MetricRecord) -> Result<i64> {
        let record = record.clone();
        self.execute(move |conn| {
            let geometry_json = record
                .raw
                .geometry
                .as_ref()
                .map(to_string)
                .transpose()
                .context("failed to serialize geometry")?;

            let tx = conn.transaction()?;
            let open: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1 AND ended_at IS NULL",
                    params![record.session_id],
                    |row| row.get(0),
                )
                .optional()?;
            if open.is_none() {
                bail!("session {} is not open", record.session_id);
            }

            let raw = &record.raw;
            let derived = &record.derived;
            tx.execute(
                "INSERT INTO metrics (
                    session_id, timestamp_ms, sequence_number,
                    face_detected, ear, eye_closed, mar, yawning, yaw, pitch, roll,
                    yaw_out_of_range, pitch_out_of_range, roll_out_of_range, gaze_off_road, phone_in_frame,
                    face_missing_sustained_ms, eye_closed_sustained_ms, eye_closed_alert, perclos, perclos_alert,
                    yawn_sustained_ms, yawn_alert, yawn_count, head_pose_sustained_ms, yaw_alert, pitch_alert,
                    roll_alert, gaze_sustained_ms, gaze_alert, phone_usage_sustained_ms, phone_usage_alert,
                    geometry_json
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                    ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33
                )",
                params![
                    record.session_id,
                    record.timestamp_ms(),
                    to_i64(record.sequence_number)?,
                    raw.face_detected,
                    raw.ear,
                    raw.eye_closed,
                    raw.mar,
                    raw.yawning,
                    raw.yaw,
                    raw.pitch,
                    raw.roll,
                    raw.yaw_out_of_range,
                    raw.pitch_out_of_range,
                    raw.roll_out_of_range,
                    raw.gaze_off_road,
                    raw.phone_in_frame,
                    to_i64(derived.face_missing_sustained_ms)?,
                    to_i64(derived.eye_closed_sustained_ms)?,
                    derived.eye_closed_alert,
                    derived.perclos,
                    derived.perclos_alert,
                    to_i64(derived.yawn_sustained_ms)?,
                    derived.yawn_alert,
                    derived.yawn_count,
                    to_i64(derived.head_pose_sustained_ms)?,
                    derived.yaw_alert,
                    derived.pitch_alert,
                    derived.roll_alert,
                    to_i64(derived.gaze_sustained_ms)?,
                    derived.gaze_alert,
                    to_i64(derived.phone_usage_sustained_ms)?,
                    derived.phone_usage_alert,
                    geometry_json,
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    /// Oldest first.
    pub async fn get_metrics_for_session(&self, session_id: &str) -> Result<Vec<MetricRecord>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {METRIC_COLUMNS} FROM metrics
                 WHERE session_id = ?1
                 ORDER BY timestamp_ms ASC, id ASC"
            ))?;
            let mut rows = stmt.query(params![session_id])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_metric(row)?);
            }
            Ok(records)
        })
        .await
    }

    pub async fn count_metrics(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM metrics", [], |row| row.get(0))?;
            to_u64(count, "count")
        })
        .await
    }

    pub async fn summarize_session(&self, session_id: &str) -> Result<SessionSummary> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let (count, eye_closed, gaze, head_pose, phone, face_missing, max_perclos): (
                i64,
                i64,
                i64,
                i64,
                i64,
                i64,
                Option<f64>,
            ) = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(eye_closed), 0),
                        COALESCE(SUM(gaze_alert), 0),
                        COALESCE(SUM(yaw_alert OR pitch_alert OR roll_alert), 0),
                        COALESCE(SUM(phone_in_frame), 0),
                        COALESCE(SUM(NOT face_detected), 0),
                        MAX(perclos)
                 FROM metrics WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )?;

            let mut summary = SessionSummary {
                session_id: session_id.clone(),
                ..SessionSummary::default()
            };
            if count == 0 {
                return Ok(summary);
            }

            let ratio = |n: i64| n as f64 / count as f64;
            summary.record_count = to_u64(count, "count")?;
            summary.eye_closed_ratio = ratio(eye_closed);
            summary.gaze_alert_ratio = ratio(gaze);
            summary.head_pose_alert_ratio = ratio(head_pose);
            summary.phone_usage_ratio = ratio(phone);
            summary.face_missing_ratio = ratio(face_missing);
            summary.max_perclos = max_perclos.unwrap_or(0.0);

            let last_yawn_count: i64 = conn.query_row(
                "SELECT yawn_count FROM metrics WHERE session_id = ?1
                 ORDER BY timestamp_ms DESC, id DESC LIMIT 1",
                params![session_id],
                |row| row.get(0),
            )?;
            summary.total_yawn_count = to_u32(last_yawn_count, "yawn_count")?;

            let mut stmt = conn.prepare(
                "SELECT timestamp_ms, ear, mar FROM metrics
                 WHERE session_id = ?1 AND (ear IS NOT NULL OR mar IS NOT NULL)
                 ORDER BY timestamp_ms ASC, id ASC",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            while let Some(row) = rows.next()? {
                let timestamp = from_millis(row.get(0)?, "timestamp_ms")?;
                let ear: Option<f64> = row.get(1)?;
                let mar: Option<f64> = row.get(2)?;
                if let Some(value) = ear.filter(|v| v.is_finite()) {
                    summary.ear_trend.push(TrendPoint { timestamp, value });
                }
                if let Some(value) = mar.filter(|v| v.is_finite()) {
                    summary.mar_trend.push(TrendPoint { timestamp, value });
                }
            }

            Ok(summary)
        })
        .await
    }
}
