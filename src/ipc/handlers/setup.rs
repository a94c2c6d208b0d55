use crate::db;
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{require_admin, require_session, required_str, respond};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Auth,
    Otp,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "auth" => Some(Self::Auth),
            "otp" => Some(Self::Otp),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Auth => "setup.auth",
            Self::Otp => "setup.otp",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Auth => json!({
            "requireCaptcha": true,
            "defaultMemberPassword": "password"
        }),
        SetupSection::Otp => json!({
            "ttlMinutes": 10,
            "echoCode": true
        }),
    }
}

#[derive(Clone, Debug)]
pub struct AuthSettings {
    pub require_captcha: bool,
    pub default_member_password: String,
}

#[derive(Clone, Debug)]
pub struct OtpSettings {
    pub ttl_minutes: i64,
    pub echo_code: bool,
}

fn load_section(conn: &Connection, section: SetupSection) -> ApiResult<Value> {
    let mut merged = default_section(section);
    if let Some(Value::Object(stored)) = db::settings_get_json(conn, section.key())? {
        if let Some(obj) = merged.as_object_mut() {
            for (k, v) in stored {
                // Keys dropped from the defaults are ignored rather than resurrected.
                if obj.contains_key(&k) {
                    obj.insert(k, v);
                }
            }
        }
    }
    Ok(merged)
}

pub fn load_auth_settings(conn: &Connection) -> ApiResult<AuthSettings> {
    let obj = load_section(conn, SetupSection::Auth)?;
    Ok(AuthSettings {
        require_captcha: obj
            .get("requireCaptcha")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        default_member_password: obj
            .get("defaultMemberPassword")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("password")
            .to_string(),
    })
}

pub fn load_otp_settings(conn: &Connection) -> ApiResult<OtpSettings> {
    let obj = load_section(conn, SetupSection::Otp)?;
    Ok(OtpSettings {
        ttl_minutes: obj
            .get("ttlMinutes")
            .and_then(|v| v.as_i64())
            .filter(|v| *v > 0)
            .unwrap_or(10),
        echo_code: obj
            .get("echoCode")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
    })
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_len(v: &Value, key: &str, min_len: usize, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let n = s.chars().count();
    if n < min_len || n > max_len {
        return Err(format!("{} length must be in {}..={}", key, min_len, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Auth => match k.as_str() {
                "requireCaptcha" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "defaultMemberPassword" => {
                    obj.insert(k.clone(), Value::String(parse_string_len(v, k, 4, 64)?));
                }
                _ => return Err(format!("unknown auth field: {}", k)),
            },
            SetupSection::Otp => match k.as_str() {
                "ttlMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 60)?));
                }
                "echoCode" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown otp field: {}", k)),
            },
        }
    }
    Ok(())
}

fn parse_section(req: &Request) -> ApiResult<SetupSection> {
    let raw = required_str(req, "section")?;
    SetupSection::parse(&raw)
        .ok_or_else(|| ApiError::bad_params(format!("unknown section: {} (expected auth or otp)", raw)))
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, _) = require_session(state)?;
    let section = parse_section(req)?;
    load_section(conn, section)
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, user) = require_admin(state)?;
    let section = parse_section(req)?;
    let patch = req
        .params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| ApiError::bad_params("patch must be an object"))?;

    let mut current = load_section(conn, section)?;
    merge_section_patch(section, &mut current, patch).map_err(ApiError::BadParams)?;
    db::settings_set_json(conn, section.key(), &current)?;
    db::record_change(conn, "settings", section.key(), "update")?;
    tracing::info!(section = section.key(), by = %user.id, "setup updated");
    Ok(current)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(respond(req, handle_setup_get(state, req))),
        "setup.update" => Some(respond(req, handle_setup_update(state, req))),
        _ => None,
    }
}
