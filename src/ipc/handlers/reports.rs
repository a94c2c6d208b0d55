use crate::db;
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::handlers::members::list_members;
use crate::ipc::helpers::{
    new_id, opt_i64, opt_str, require_admin, require_session, required_str, respond,
};
use crate::ipc::types::{AppState, Request, SessionUser};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use std::collections::HashMap;

const REPORT_COLUMNS: &str =
    "id, type, created_by, date, school_name, content, student_name, standard, topic, attendees, updated_at";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReportKind {
    Counselling,
    Session,
}

impl ReportKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "Counselling" => Some(Self::Counselling),
            "Session" => Some(Self::Session),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Counselling => "Counselling",
            Self::Session => "Session",
        }
    }
}

/// Validated form payload shared by create and update.
struct ReportFields {
    kind: ReportKind,
    school_name: String,
    content: String,
    student_name: Option<String>,
    standard: Option<String>,
    topic: Option<String>,
    attendees: Option<i64>,
}

impl ReportFields {
    fn parse(req: &Request) -> ApiResult<Self> {
        let raw_type = required_str(req, "type")?;
        let kind = ReportKind::parse(&raw_type).ok_or_else(|| {
            ApiError::bad_params(format!(
                "type must be Counselling or Session, got {}",
                raw_type
            ))
        })?;
        let school_name = required_str(req, "schoolName")?;
        let content = required_str(req, "content")?;

        // Only the fields belonging to the chosen type are kept; the form may still
        // carry leftovers from switching the type radio.
        match kind {
            ReportKind::Counselling => Ok(Self {
                kind,
                school_name,
                content,
                student_name: Some(required_str(req, "studentName")?),
                standard: Some(required_str(req, "standard")?),
                topic: None,
                attendees: None,
            }),
            ReportKind::Session => {
                let topic = required_str(req, "topic")?;
                let attendees = opt_i64(req, "attendees")?
                    .ok_or_else(|| ApiError::bad_params("missing attendees"))?;
                if attendees < 0 {
                    return Err(ApiError::bad_params("attendees must be >= 0"));
                }
                Ok(Self {
                    kind,
                    school_name,
                    content,
                    student_name: None,
                    standard: None,
                    topic: Some(topic),
                    attendees: Some(attendees),
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
struct ReportRow {
    id: String,
    kind: String,
    created_by: String,
    date: String,
    school_name: String,
    content: String,
    student_name: Option<String>,
    standard: Option<String>,
    topic: Option<String>,
    attendees: Option<i64>,
    updated_at: Option<String>,
}

impl ReportRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            kind: r.get(1)?,
            created_by: r.get(2)?,
            date: r.get(3)?,
            school_name: r.get(4)?,
            content: r.get(5)?,
            student_name: r.get(6)?,
            standard: r.get(7)?,
            topic: r.get(8)?,
            attendees: r.get(9)?,
            updated_at: r.get(10)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "type": self.kind,
            "createdBy": self.created_by,
            "date": self.date,
            "schoolName": self.school_name,
            "content": self.content,
            "studentName": self.student_name,
            "standard": self.standard,
            "topic": self.topic,
            "attendees": self.attendees,
            "updatedAt": self.updated_at,
        })
    }
}

fn load_report(conn: &Connection, id: &str) -> ApiResult<ReportRow> {
    let sql = format!("SELECT {} FROM reports WHERE id = ?", REPORT_COLUMNS);
    conn.query_row(&sql, [id], ReportRow::from_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("report", id))
}

fn ensure_owner(report: &ReportRow, user: &SessionUser) -> ApiResult<()> {
    if report.created_by != user.id {
        return Err(ApiError::Forbidden("report belongs to another member".into()));
    }
    Ok(())
}

fn handle_reports_create(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, user) = require_session(state)?;
    let f = ReportFields::parse(req)?;
    let id = new_id();
    conn.execute(
        "INSERT INTO reports(id, type, created_by, date, school_name, content, student_name, standard, topic, attendees)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            f.kind.as_str(),
            &user.id,
            db::today(),
            &f.school_name,
            &f.content,
            &f.student_name,
            &f.standard,
            &f.topic,
            f.attendees,
        ),
    )?;
    db::record_change(conn, "reports", &id, "create")?;
    tracing::info!(report_id = %id, kind = f.kind.as_str(), by = %user.id, "report submitted");
    Ok(json!({ "report": load_report(conn, &id)?.to_json() }))
}

fn handle_reports_update(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, user) = require_session(state)?;
    let report_id = required_str(req, "reportId")?;
    let existing = load_report(conn, &report_id)?;
    ensure_owner(&existing, user)?;
    let f = ReportFields::parse(req)?;

    conn.execute(
        "UPDATE reports
         SET type = ?, date = ?, school_name = ?, content = ?, student_name = ?, standard = ?,
             topic = ?, attendees = ?, updated_at = ?
         WHERE id = ?",
        (
            f.kind.as_str(),
            db::today(),
            &f.school_name,
            &f.content,
            &f.student_name,
            &f.standard,
            &f.topic,
            f.attendees,
            db::now_rfc3339(),
            &report_id,
        ),
    )?;
    db::record_change(conn, "reports", &report_id, "update")?;
    tracing::info!(report_id = %report_id, by = %user.id, "report updated");
    Ok(json!({ "report": load_report(conn, &report_id)?.to_json() }))
}

fn handle_reports_delete(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, user) = require_session(state)?;
    let report_id = required_str(req, "reportId")?;
    let existing = load_report(conn, &report_id)?;
    if !user.is_admin() {
        ensure_owner(&existing, user)?;
    }
    conn.execute("DELETE FROM reports WHERE id = ?", [&report_id])?;
    db::record_change(conn, "reports", &report_id, "delete")?;
    tracing::info!(report_id = %report_id, by = %user.id, "report deleted");
    Ok(json!({ "deleted": true }))
}

fn handle_reports_list(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, user) = require_session(state)?;
    let member_filter = if user.is_admin() {
        opt_str(req, "memberId")?
    } else {
        Some(user.id.clone())
    };

    let rows = match member_filter {
        Some(member_id) => {
            let sql = format!(
                "SELECT {} FROM reports WHERE created_by = ? ORDER BY date DESC, rowid DESC",
                REPORT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([member_id], ReportRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let sql = format!(
                "SELECT {} FROM reports ORDER BY date DESC, rowid DESC",
                REPORT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], ReportRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };

    let reports: Vec<Value> = rows.iter().map(ReportRow::to_json).collect();
    Ok(json!({ "reports": reports }))
}

fn handle_reports_stats(state: &mut AppState, _req: &Request) -> ApiResult<Value> {
    let (conn, _) = require_admin(state)?;

    let mut counts: HashMap<String, (i64, i64)> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT created_by,
                    SUM(CASE WHEN type = 'Counselling' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN type = 'Session' THEN 1 ELSE 0 END)
             FROM reports
             GROUP BY created_by",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let member_id: String = row.get(0)?;
            counts.insert(member_id, (row.get(1)?, row.get(2)?));
        }
    }

    let members: Vec<Value> = list_members(conn)?
        .into_iter()
        .map(|m| {
            let (counselling, session) = counts.get(&m.id).copied().unwrap_or((0, 0));
            json!({
                "memberId": m.id,
                "name": m.name,
                "total": counselling + session,
                "counselling": counselling,
                "session": session,
            })
        })
        .collect();
    Ok(json!({ "members": members }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "reports.create" => Some(respond(req, handle_reports_create(state, req))),
        "reports.update" => Some(respond(req, handle_reports_update(state, req))),
        "reports.delete" => Some(respond(req, handle_reports_delete(state, req))),
        "reports.list" => Some(respond(req, handle_reports_list(state, req))),
        "reports.stats" => Some(respond(req, handle_reports_stats(state, req))),
        _ => None,
    }
}
