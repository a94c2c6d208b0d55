use crate::db::{self, ROLE_MEMBER};
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::handlers::members::load_user;
use crate::ipc::handlers::questionnaires::load_questionnaire;
use crate::ipc::handlers::students::load_student;
use crate::ipc::helpers::{new_id, opt_str, require_admin, require_session, required_str, respond};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

pub const STATUS_PENDING: &str = "PENDING";
pub const STATUS_COMPLETED: &str = "COMPLETED";

const SCHEDULE_COLUMNS: &str = "id, template_id, title, questions_json, assigned_member_id, student_id, student_name, status, created_at, completed_at, response_id";

#[derive(Debug, Clone)]
pub struct ScheduleRow {
    pub id: String,
    pub template_id: String,
    pub title: String,
    pub questions: Vec<String>,
    pub assigned_member_id: String,
    pub student_id: String,
    pub student_name: String,
    pub status: String,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub response_id: Option<String>,
}

impl ScheduleRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        let questions_json: String = r.get(3)?;
        let questions: Vec<String> = serde_json::from_str(&questions_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(Self {
            id: r.get(0)?,
            template_id: r.get(1)?,
            title: r.get(2)?,
            questions,
            assigned_member_id: r.get(4)?,
            student_id: r.get(5)?,
            student_name: r.get(6)?,
            status: r.get(7)?,
            created_at: r.get(8)?,
            completed_at: r.get(9)?,
            response_id: r.get(10)?,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == STATUS_PENDING
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "templateId": self.template_id,
            "title": self.title,
            "questions": self.questions,
            "assignedMemberId": self.assigned_member_id,
            "studentId": self.student_id,
            "studentName": self.student_name,
            "status": self.status,
            "createdAt": self.created_at,
            "completedAt": self.completed_at,
            "responseId": self.response_id,
        })
    }
}

pub fn load_schedule(conn: &Connection, id: &str) -> ApiResult<ScheduleRow> {
    let sql = format!("SELECT {} FROM schedules WHERE id = ?", SCHEDULE_COLUMNS);
    conn.query_row(&sql, [id], ScheduleRow::from_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("schedule", id))
}

/// PENDING -> COMPLETED. The status guard in the WHERE clause makes a second
/// completion a no-op that callers turn into a conflict.
pub fn mark_completed(conn: &Connection, schedule_id: &str, response_id: &str) -> ApiResult<()> {
    let changed = conn.execute(
        "UPDATE schedules SET status = ?, completed_at = ?, response_id = ?
         WHERE id = ? AND status = ?",
        (
            STATUS_COMPLETED,
            db::now_rfc3339(),
            response_id,
            schedule_id,
            STATUS_PENDING,
        ),
    )?;
    if changed == 0 {
        return Err(ApiError::Conflict(format!(
            "task already completed: {}",
            schedule_id
        )));
    }
    db::record_change(conn, "schedules", schedule_id, "update")?;
    Ok(())
}

fn handle_schedules_create(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, admin) = require_admin(state)?;
    let questionnaire_id = required_str(req, "questionnaireId")?;
    let member_id = required_str(req, "memberId")?;
    let student_id = required_str(req, "studentId")?;

    let template = load_questionnaire(conn, &questionnaire_id)?;
    let member = load_user(conn, &member_id)?
        .filter(|u| u.role == ROLE_MEMBER)
        .ok_or_else(|| ApiError::not_found("member", &member_id))?;
    let student = load_student(conn, &student_id)?;

    let id = new_id();
    let questions_json = serde_json::to_string(&template.questions)
        .map_err(|e| ApiError::Internal(e.into()))?;
    conn.execute(
        "INSERT INTO schedules(id, template_id, title, questions_json, assigned_member_id, student_id, student_name, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &template.id,
            &template.title,
            &questions_json,
            &member.id,
            &student.id,
            &student.name,
            STATUS_PENDING,
            db::now_rfc3339(),
        ),
    )?;
    db::record_change(conn, "schedules", &id, "create")?;
    tracing::info!(
        schedule_id = %id,
        questionnaire_id = %template.id,
        member_id = %member.id,
        student_id = %student.id,
        by = %admin.id,
        "task scheduled"
    );
    Ok(json!({ "schedule": load_schedule(conn, &id)?.to_json() }))
}

fn handle_schedules_list(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, user) = require_session(state)?;
    let status = opt_str(req, "status")?.map(|s| s.to_ascii_uppercase());
    if let Some(s) = status.as_deref() {
        if s != STATUS_PENDING && s != STATUS_COMPLETED {
            return Err(ApiError::bad_params("status must be PENDING or COMPLETED"));
        }
    }

    let sql = format!(
        "SELECT {} FROM schedules
         ORDER BY CASE status WHEN 'PENDING' THEN 0 ELSE 1 END, created_at DESC, rowid DESC",
        SCHEDULE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], ScheduleRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let schedules: Vec<Value> = rows
        .iter()
        .filter(|s| user.is_admin() || s.assigned_member_id == user.id)
        .filter(|s| status.as_deref().map(|st| s.status == st).unwrap_or(true))
        .map(ScheduleRow::to_json)
        .collect();
    Ok(json!({ "schedules": schedules }))
}

fn handle_schedules_delete(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, admin) = require_admin(state)?;
    let id = required_str(req, "scheduleId")?;
    load_schedule(conn, &id)?;
    conn.execute("DELETE FROM schedules WHERE id = ?", [&id])?;
    db::record_change(conn, "schedules", &id, "delete")?;
    tracing::info!(schedule_id = %id, by = %admin.id, "task deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "schedules.create" => Some(respond(req, handle_schedules_create(state, req))),
        "schedules.list" => Some(respond(req, handle_schedules_list(state, req))),
        "schedules.delete" => Some(respond(req, handle_schedules_delete(state, req))),
        _ => None,
    }
}
