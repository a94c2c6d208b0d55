use crate::auth;
use crate::db::{self, ROLE_SUPER_ADMIN};
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::handlers::members::{find_user_by_contact, find_user_by_username, load_user};
use crate::ipc::handlers::setup::{load_auth_settings, load_otp_settings};
use crate::ipc::helpers::{db_conn, new_id, opt_str, required_str, respond};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

// Unanswered challenges are swept after this long.
const CAPTCHA_MAX_AGE_MINUTES: i64 = 30;

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn sweep_captchas(conn: &Connection) -> ApiResult<()> {
    let cutoff = Utc::now() - ChronoDuration::minutes(CAPTCHA_MAX_AGE_MINUTES);
    let mut stmt = conn.prepare("SELECT id, created_at FROM captchas")?;
    let stale: Vec<String> = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|(_, at)| parse_ts(at).map(|t| t < cutoff).unwrap_or(true))
        .map(|(id, _)| id)
        .collect();
    for id in stale {
        conn.execute("DELETE FROM captchas WHERE id = ?", [&id])?;
    }
    Ok(())
}

/// A code issued at `created_at` is accepted up to and including `ttl_minutes`
/// later. Unparseable timestamps never count as fresh.
fn otp_is_fresh(created_at: &str, now: DateTime<Utc>, ttl_minutes: i64) -> bool {
    parse_ts(created_at)
        .map(|t| t >= now - ChronoDuration::minutes(ttl_minutes))
        .unwrap_or(false)
}

fn sweep_otps(conn: &Connection, ttl_minutes: i64) -> ApiResult<usize> {
    let now = Utc::now();
    let stale: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id, created_at FROM otps")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .filter(|(_, at)| !otp_is_fresh(at, now, ttl_minutes))
            .map(|(id, _)| id)
            .collect()
    };
    for id in &stale {
        conn.execute("DELETE FROM otps WHERE id = ?", [id])?;
    }
    Ok(stale.len())
}

/// Consumes the challenge whether or not the answer matches, so a wrong guess
/// forces a fresh code the way the login screen refreshes it.
fn check_captcha(conn: &Connection, req: &Request) -> ApiResult<()> {
    if !load_auth_settings(conn)?.require_captcha {
        return Ok(());
    }
    let captcha_id = opt_str(req, "captchaId")?.ok_or(ApiError::CaptchaFailed)?;
    let answer = opt_str(req, "captchaAnswer")?.ok_or(ApiError::CaptchaFailed)?;
    let code: Option<String> = conn
        .query_row(
            "SELECT code FROM captchas WHERE id = ?",
            [&captcha_id],
            |r| r.get(0),
        )
        .optional()?;
    conn.execute("DELETE FROM captchas WHERE id = ?", [&captcha_id])?;
    match code {
        // Displayed codes are uppercase; typed answers frequently aren't.
        Some(code) if code == answer.to_ascii_uppercase() => Ok(()),
        _ => Err(ApiError::CaptchaFailed),
    }
}

fn handle_captcha_new(state: &mut AppState, _req: &Request) -> ApiResult<Value> {
    let conn = db_conn(state)?;
    sweep_captchas(conn)?;
    let id = new_id();
    let code = auth::generate_captcha();
    conn.execute(
        "INSERT INTO captchas(id, code, created_at) VALUES(?, ?, ?)",
        (&id, &code, db::now_rfc3339()),
    )?;
    Ok(json!({ "captchaId": id, "code": code }))
}

fn handle_admin_login(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let conn = db_conn(state)?;
    check_captcha(conn, req)?;
    let username = required_str(req, "username")?;
    let password = req
        .params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::bad_params("missing password"))?;

    let user = find_user_by_username(conn, &username, ROLE_SUPER_ADMIN)?
        .ok_or_else(|| ApiError::InvalidCredentials("admin not found".into()))?;
    if !auth::verify_password(password, &user.password_salt, &user.password_hash) {
        tracing::warn!(username = %username, "admin login rejected: bad password");
        return Err(ApiError::InvalidCredentials("invalid password".into()));
    }

    tracing::info!(user_id = %user.id, "admin logged in");
    let view = user.to_json();
    state.session = Some(user.to_session());
    Ok(json!({ "user": view }))
}

fn handle_otp_request(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let conn = db_conn(state)?;
    check_captcha(conn, req)?;
    let contact = auth::normalize_contact(&required_str(req, "contact")?);
    if contact.is_empty() {
        return Err(ApiError::bad_params("missing contact"));
    }
    let Some(user) = find_user_by_contact(conn, &contact)? else {
        return Err(ApiError::NotFound(format!("no user registered with {}", contact)));
    };

    let settings = load_otp_settings(conn)?;
    sweep_otps(conn, settings.ttl_minutes)?;

    let code = auth::generate_otp();
    conn.execute(
        "INSERT INTO otps(id, contact, code, created_at) VALUES(?, ?, ?, ?)",
        (new_id(), &contact, &code, db::now_rfc3339()),
    )?;

    // No SMS/email gateway is wired up; delivery is the log line below.
    tracing::info!(user_id = %user.id, contact = %contact, otp = %code, "otp issued");

    let mut result = json!({ "sent": true, "ttlMinutes": settings.ttl_minutes });
    if settings.echo_code {
        result["devCode"] = Value::String(code);
    }
    Ok(result)
}

fn handle_otp_verify(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let conn = db_conn(state)?;
    let contact = auth::normalize_contact(&required_str(req, "contact")?);
    let otp = required_str(req, "otp")?;
    let ttl = load_otp_settings(conn)?.ttl_minutes;
    let swept = sweep_otps(conn, ttl)?;
    if swept > 0 {
        tracing::debug!(swept, "expired otps removed");
    }

    let issued: Vec<String> = {
        let mut stmt =
            conn.prepare("SELECT created_at FROM otps WHERE contact = ? AND code = ?")?;
        let rows = stmt
            .query_map((&contact, &otp), |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    let now = Utc::now();
    let fresh = issued.iter().any(|at| otp_is_fresh(at, now, ttl));
    if !fresh {
        tracing::warn!(contact = %contact, "otp rejected");
        return Err(ApiError::OtpInvalid);
    }

    let user = find_user_by_contact(conn, &contact)?.ok_or(ApiError::OtpInvalid)?;
    let removed = conn.execute("DELETE FROM otps WHERE contact = ?", [&contact])?;
    tracing::info!(user_id = %user.id, otps_removed = removed, "otp login");

    let view = user.to_json();
    state.session = Some(user.to_session());
    Ok(json!({ "user": view }))
}

fn handle_session(state: &mut AppState, _req: &Request) -> ApiResult<Value> {
    let Some(session) = state.session.as_ref() else {
        return Ok(json!({ "user": null }));
    };
    let conn = db_conn(state)?;
    // The user may have been deleted since logging in.
    match load_user(conn, &session.id)? {
        Some(u) => Ok(json!({ "user": u.to_json() })),
        None => {
            state.session = None;
            Ok(json!({ "user": null }))
        }
    }
}

fn handle_logout(state: &mut AppState, _req: &Request) -> ApiResult<Value> {
    if let Some(s) = state.session.take() {
        tracing::info!(user_id = %s.id, "logged out");
    }
    Ok(json!({ "loggedOut": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "auth.captcha.new" => Some(respond(req, handle_captcha_new(state, req))),
        "auth.adminLogin" => Some(respond(req, handle_admin_login(state, req))),
        "auth.otp.request" => Some(respond(req, handle_otp_request(state, req))),
        "auth.otp.verify" => Some(respond(req, handle_otp_verify(state, req))),
        "auth.session" => Some(respond(req, handle_session(state, req))),
        "auth.logout" => Some(respond(req, handle_logout(state, req))),
        _ => None,
    }
}
