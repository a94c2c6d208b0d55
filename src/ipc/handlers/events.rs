use crate::db;
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{new_id, opt_str, require_admin, require_session, required_str, respond};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::Row;
use serde_json::{json, Value};

const EVENT_TYPES: [&str; 4] = ["Notice", "Meeting", "Workshop", "Deadline"];
const DEFAULT_EVENT_TYPE: &str = "Notice";

fn event_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "date": r.get::<_, String>(2)?,
        "type": r.get::<_, String>(3)?,
        "description": r.get::<_, String>(4)?,
        "createdBy": r.get::<_, String>(5)?,
        "createdAt": r.get::<_, String>(6)?,
    }))
}

fn parse_event_date(raw: &str) -> ApiResult<String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| ApiError::bad_params(format!("date must be YYYY-MM-DD, got {}", raw)))
}

fn parse_event_type(raw: Option<String>) -> ApiResult<String> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_EVENT_TYPE.to_string());
    };
    EVENT_TYPES
        .iter()
        .find(|t| t.eq_ignore_ascii_case(&raw))
        .map(|t| t.to_string())
        .ok_or_else(|| {
            ApiError::bad_params(format!(
                "type must be one of: {}",
                EVENT_TYPES.join(", ")
            ))
        })
}

fn handle_events_list(state: &mut AppState, _req: &Request) -> ApiResult<Value> {
    let (conn, _) = require_session(state)?;
    let mut stmt = conn.prepare(
        "SELECT id, title, date, type, description, created_by, created_at
         FROM events
         ORDER BY date ASC, created_at ASC",
    )?;
    let events = stmt
        .query_map([], event_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "events": events }))
}

fn handle_events_create(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, admin) = require_admin(state)?;
    let title = opt_str(req, "title")?;
    let date = opt_str(req, "date")?;
    let (Some(title), Some(date)) = (title, date) else {
        return Err(ApiError::bad_params("title and date are required"));
    };
    let date = parse_event_date(&date)?;
    let kind = parse_event_type(opt_str(req, "type")?)?;
    let description = opt_str(req, "description")?.unwrap_or_default();

    let id = new_id();
    let created_at = db::now_rfc3339();
    conn.execute(
        "INSERT INTO events(id, title, date, type, description, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&id, &title, &date, &kind, &description, &admin.id, &created_at),
    )?;
    db::record_change(conn, "events", &id, "create")?;
    tracing::info!(event_id = %id, date = %date, by = %admin.id, "event posted");
    Ok(json!({
        "event": {
            "id": id,
            "title": title,
            "date": date,
            "type": kind,
            "description": description,
            "createdBy": admin.id,
            "createdAt": created_at,
        }
    }))
}

fn handle_events_delete(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, admin) = require_admin(state)?;
    let id = required_str(req, "eventId")?;
    let n = conn.execute("DELETE FROM events WHERE id = ?", [&id])?;
    if n == 0 {
        return Err(ApiError::not_found("event", &id));
    }
    db::record_change(conn, "events", &id, "delete")?;
    tracing::info!(event_id = %id, by = %admin.id, "event deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "events.list" => Some(respond(req, handle_events_list(state, req))),
        "events.create" => Some(respond(req, handle_events_create(state, req))),
        "events.delete" => Some(respond(req, handle_events_delete(state, req))),
        _ => None,
    }
}
