use crate::auth;
use crate::db::{self, ROLE_MEMBER};
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::handlers::setup::load_auth_settings;
use crate::ipc::helpers::{
    new_id, opt_password, opt_str, patch_str, require_admin, required_str, respond,
};
use crate::ipc::types::{AppState, Request, SessionUser};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const USER_COLUMNS: &str =
    "id, name, username, mobile, email, role, status, created_at, password_hash, password_salt";

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub name: String,
    pub username: String,
    pub mobile: Option<String>,
    pub email: Option<String>,
    pub role: String,
    pub status: String,
    pub created_at: String,
    pub password_hash: String,
    pub password_salt: String,
}

impl UserRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            name: r.get(1)?,
            username: r.get(2)?,
            mobile: r.get(3)?,
            email: r.get(4)?,
            role: r.get(5)?,
            status: r.get(6)?,
            created_at: r.get(7)?,
            password_hash: r.get(8)?,
            password_salt: r.get(9)?,
        })
    }

    /// Wire view. Password material never leaves the process.
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "username": self.username,
            "mobile": self.mobile,
            "email": self.email,
            "role": self.role,
            "status": self.status,
            "createdAt": self.created_at,
        })
    }

    pub fn to_session(&self) -> SessionUser {
        SessionUser {
            id: self.id.clone(),
            name: self.name.clone(),
            role: self.role.clone(),
        }
    }

    /// True when `contact` (already normalized) is this user's mobile or email.
    pub fn matches_contact(&self, contact: &str) -> bool {
        let hit = |v: &Option<String>| {
            v.as_deref()
                .map(|s| auth::normalize_contact(s) == contact)
                .unwrap_or(false)
        };
        hit(&self.mobile) || hit(&self.email)
    }
}

pub fn load_user(conn: &Connection, id: &str) -> ApiResult<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS);
    Ok(conn.query_row(&sql, [id], UserRow::from_row).optional()?)
}

pub fn find_user_by_username(
    conn: &Connection,
    username: &str,
    role: &str,
) -> ApiResult<Option<UserRow>> {
    let sql = format!(
        "SELECT {} FROM users WHERE username = ? COLLATE NOCASE AND role = ?",
        USER_COLUMNS
    );
    Ok(conn
        .query_row(&sql, (username, role), UserRow::from_row)
        .optional()?)
}

pub fn find_user_by_contact(conn: &Connection, contact: &str) -> ApiResult<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users ORDER BY created_at, id", USER_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let users = stmt
        .query_map([], UserRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users.into_iter().find(|u| u.matches_contact(contact)))
}

pub fn list_members(conn: &Connection) -> ApiResult<Vec<UserRow>> {
    let sql = format!(
        "SELECT {} FROM users WHERE role = ? ORDER BY name COLLATE NOCASE, id",
        USER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([ROLE_MEMBER], UserRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_member(conn: &Connection, id: &str) -> ApiResult<UserRow> {
    load_user(conn, id)?
        .filter(|u| u.role == ROLE_MEMBER)
        .ok_or_else(|| ApiError::not_found("member", id))
}

fn ensure_username_free(conn: &Connection, username: &str, except_id: Option<&str>) -> ApiResult<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE username = ? COLLATE NOCASE",
            [username],
            |r| r.get(0),
        )
        .optional()?;
    match existing {
        Some(id) if Some(id.as_str()) != except_id => {
            Err(ApiError::Conflict(format!("username already taken: {}", username)))
        }
        _ => Ok(()),
    }
}

fn handle_members_list(state: &mut AppState, _req: &Request) -> ApiResult<Value> {
    let (conn, _) = require_admin(state)?;
    let members: Vec<Value> = list_members(conn)?.iter().map(UserRow::to_json).collect();
    Ok(json!({ "members": members }))
}

fn handle_members_create(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, admin) = require_admin(state)?;
    let name = required_str(req, "name")?;
    let mobile = required_str(req, "mobile")?;
    let username = required_str(req, "username")?;
    let email = opt_str(req, "email")?;
    let password = match opt_password(req, "password")? {
        Some(p) => p,
        None => load_auth_settings(conn)?.default_member_password,
    };

    ensure_username_free(conn, &username, None)?;

    let id = new_id();
    let salt = auth::new_salt();
    conn.execute(
        "INSERT INTO users(id, name, username, password_hash, password_salt, mobile, email, role, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'Active', ?)",
        (
            &id,
            &name,
            &username,
            auth::hash_password(&password, &salt),
            &salt,
            &mobile,
            &email,
            ROLE_MEMBER,
            db::now_rfc3339(),
        ),
    )?;
    db::record_change(conn, "users", &id, "create")?;
    tracing::info!(member_id = %id, by = %admin.id, "member created");

    let member = load_member(conn, &id)?;
    Ok(json!({ "member": member.to_json() }))
}

fn handle_members_update(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, admin) = require_admin(state)?;
    let member_id = required_str(req, "memberId")?;
    let mut member = load_member(conn, &member_id)?;

    if let Some(name) = opt_str(req, "name")? {
        member.name = name;
    }
    if let Some(mobile) = opt_str(req, "mobile")? {
        member.mobile = Some(mobile);
    }
    if let Some(email) = patch_str(req, "email")? {
        member.email = email;
    }
    if let Some(username) = opt_str(req, "username")? {
        ensure_username_free(conn, &username, Some(&member.id))?;
        member.username = username;
    }
    if let Some(password) = opt_password(req, "password")? {
        member.password_salt = auth::new_salt();
        member.password_hash = auth::hash_password(&password, &member.password_salt);
    }

    conn.execute(
        "UPDATE users SET name = ?, username = ?, mobile = ?, email = ?, password_hash = ?, password_salt = ?
         WHERE id = ?",
        (
            &member.name,
            &member.username,
            &member.mobile,
            &member.email,
            &member.password_hash,
            &member.password_salt,
            &member.id,
        ),
    )?;
    db::record_change(conn, "users", &member.id, "update")?;
    tracing::info!(member_id = %member.id, by = %admin.id, "member updated");
    Ok(json!({ "member": member.to_json() }))
}

fn collect_ids(conn: &Connection, sql: &str, key: &str) -> ApiResult<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([key], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn handle_members_delete(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, admin) = require_admin(state)?;
    let member_id = required_str(req, "memberId")?;
    load_member(conn, &member_id)?;

    // Reports and schedules cascade with the user row; the change feed still needs
    // to hear about each of them.
    let report_ids = collect_ids(conn, "SELECT id FROM reports WHERE created_by = ?", &member_id)?;
    let schedule_ids = collect_ids(
        conn,
        "SELECT id FROM schedules WHERE assigned_member_id = ?",
        &member_id,
    )?;

    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM users WHERE id = ?", [&member_id])?;
    for id in &report_ids {
        db::record_change(&tx, "reports", id, "delete")?;
    }
    for id in &schedule_ids {
        db::record_change(&tx, "schedules", id, "delete")?;
    }
    db::record_change(&tx, "users", &member_id, "delete")?;
    tx.commit()?;

    tracing::info!(
        member_id = %member_id,
        by = %admin.id,
        reports = report_ids.len(),
        schedules = schedule_ids.len(),
        "member deleted"
    );
    Ok(json!({
        "deleted": true,
        "reportsRemoved": report_ids.len(),
        "schedulesRemoved": schedule_ids.len(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "members.list" => Some(respond(req, handle_members_list(state, req))),
        "members.create" => Some(respond(req, handle_members_create(state, req))),
        "members.update" => Some(respond(req, handle_members_update(state, req))),
        "members.delete" => Some(respond(req, handle_members_delete(state, req))),
        _ => None,
    }
}
