use crate::db;
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{
    new_id, opt_str, patch_str, require_admin, require_session, required_str, respond,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const STUDENT_COLUMNS: &str =
    "id, name, username, phone, email, standard, division, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub id: String,
    pub name: String,
    pub username: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub standard: String,
    pub division: Option<String>,
    pub created_at: String,
    pub updated_at: Option<String>,
}

impl StudentRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            name: r.get(1)?,
            username: r.get(2)?,
            phone: r.get(3)?,
            email: r.get(4)?,
            standard: r.get(5)?,
            division: r.get(6)?,
            created_at: r.get(7)?,
            updated_at: r.get(8)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "username": self.username,
            "phone": self.phone,
            "email": self.email,
            "standard": self.standard,
            "division": self.division,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

pub fn load_student(conn: &Connection, id: &str) -> ApiResult<StudentRow> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
    conn.query_row(&sql, [id], StudentRow::from_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("student", id))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, _) = require_session(state)?;
    let search = opt_str(req, "search")?.map(|s| s.to_lowercase());

    let sql = format!(
        "SELECT {} FROM students
         ORDER BY CAST(standard AS INTEGER), standard, division, name COLLATE NOCASE, id",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], StudentRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let students: Vec<Value> = rows
        .iter()
        .filter(|s| match search.as_deref() {
            None => true,
            Some(q) => {
                s.name.to_lowercase().contains(q)
                    || s
                        .username
                        .as_deref()
                        .map(|u| u.to_lowercase().contains(q))
                        .unwrap_or(false)
            }
        })
        .map(StudentRow::to_json)
        .collect();
    Ok(json!({ "students": students }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, admin) = require_admin(state)?;
    let name = required_str(req, "name")?;
    let standard = required_str(req, "standard")?;
    let division = opt_str(req, "division")?;
    let username = opt_str(req, "username")?;
    let phone = opt_str(req, "phone")?;
    let email = opt_str(req, "email")?;

    let id = new_id();
    conn.execute(
        "INSERT INTO students(id, name, username, phone, email, standard, division, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &name,
            &username,
            &phone,
            &email,
            &standard,
            &division,
            db::now_rfc3339(),
        ),
    )?;
    db::record_change(conn, "students", &id, "create")?;
    tracing::info!(student_id = %id, by = %admin.id, "student created");
    Ok(json!({ "student": load_student(conn, &id)?.to_json() }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, admin) = require_admin(state)?;
    let student_id = required_str(req, "studentId")?;
    let mut s = load_student(conn, &student_id)?;

    if let Some(name) = opt_str(req, "name")? {
        s.name = name;
    }
    if let Some(standard) = opt_str(req, "standard")? {
        s.standard = standard;
    }
    if let Some(v) = patch_str(req, "division")? {
        s.division = v;
    }
    if let Some(v) = patch_str(req, "username")? {
        s.username = v;
    }
    if let Some(v) = patch_str(req, "phone")? {
        s.phone = v;
    }
    if let Some(v) = patch_str(req, "email")? {
        s.email = v;
    }
    s.updated_at = Some(db::now_rfc3339());

    conn.execute(
        "UPDATE students
         SET name = ?, username = ?, phone = ?, email = ?, standard = ?, division = ?, updated_at = ?
         WHERE id = ?",
        (
            &s.name,
            &s.username,
            &s.phone,
            &s.email,
            &s.standard,
            &s.division,
            &s.updated_at,
            &s.id,
        ),
    )?;
    db::record_change(conn, "students", &s.id, "update")?;
    tracing::info!(student_id = %s.id, by = %admin.id, "student updated");
    Ok(json!({ "student": s.to_json() }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, admin) = require_admin(state)?;
    let student_id = required_str(req, "studentId")?;
    load_student(conn, &student_id)?;

    let pending: i64 = conn.query_row(
        "SELECT COUNT(*) FROM schedules WHERE student_id = ? AND status = 'PENDING'",
        [&student_id],
        |r| r.get(0),
    )?;
    if pending > 0 {
        return Err(ApiError::Conflict(format!(
            "student has {} pending questionnaire task(s)",
            pending
        )));
    }

    conn.execute("DELETE FROM students WHERE id = ?", [&student_id])?;
    db::record_change(conn, "students", &student_id, "delete")?;
    tracing::info!(student_id = %student_id, by = %admin.id, "student deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "students.list" => Some(respond(req, handle_students_list(state, req))),
        "students.create" => Some(respond(req, handle_students_create(state, req))),
        "students.update" => Some(respond(req, handle_students_update(state, req))),
        "students.delete" => Some(respond(req, handle_students_delete(state, req))),
        _ => None,
    }
}
