use crate::auth;
use crate::db::{self, ROLE_SUPER_ADMIN};
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{new_id, respond, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

const SEED_ADMIN_NAME: &str = "Principal";
const SEED_ADMIN_USERNAME: &str = "admin";
const SEED_ADMIN_PASSWORD: &str = "password123";
const SEED_ADMIN_MOBILE: &str = "9999999999";
const SEED_ADMIN_EMAIL: &str = "admin@mes.ac.in";

/// An empty workspace gets one super-admin so somebody can log in.
fn seed_default_admin(conn: &Connection) -> anyhow::Result<bool> {
    if db::count_users(conn)? > 0 {
        return Ok(false);
    }
    let id = new_id();
    let salt = auth::new_salt();
    conn.execute(
        "INSERT INTO users(id, name, username, password_hash, password_salt, mobile, email, role, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'Active', ?)",
        (
            &id,
            SEED_ADMIN_NAME,
            SEED_ADMIN_USERNAME,
            auth::hash_password(SEED_ADMIN_PASSWORD, &salt),
            &salt,
            SEED_ADMIN_MOBILE,
            SEED_ADMIN_EMAIL,
            ROLE_SUPER_ADMIN,
            db::now_rfc3339(),
        ),
    )?;
    db::record_change(conn, "users", &id, "create")?;
    tracing::info!(user_id = %id, username = SEED_ADMIN_USERNAME, "seeded default super-admin");
    Ok(true)
}

/// Opens (or creates) the workspace at `path` and makes it current. Any session
/// belongs to the previous workspace, so it is dropped.
pub fn open_workspace(state: &mut AppState, path: &Path) -> ApiResult<bool> {
    let conn = db::open_db(path).map_err(ApiError::DbOpen)?;
    let seeded = seed_default_admin(&conn)?;
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    state.session = None;
    tracing::info!(workspace = %path.to_string_lossy(), seeded, "workspace opened");
    Ok(seeded)
}

fn handle_health(state: &mut AppState, _req: &Request) -> ApiResult<Value> {
    let revision = match state.db.as_ref() {
        Some(conn) => Some(db::current_revision(conn)?),
        None => None,
    };
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "revision": revision,
    }))
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let path = PathBuf::from(required_str(req, "path")?);
    let seeded = open_workspace(state, &path)?;
    Ok(json!({ "workspacePath": path.to_string_lossy(), "seeded": seeded }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "health" => Some(respond(req, handle_health(state, req))),
        "workspace.select" => Some(respond(req, handle_workspace_select(state, req))),
        _ => None,
    }
}
