use rusqlite::Connection;
use serde_json::Value;

use crate::ipc::error::{ok, ApiError, ApiResult};
use crate::ipc::types::{AppState, Request, SessionUser};

pub fn respond(req: &Request, result: ApiResult<Value>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            tracing::warn!(method = %req.method, code = e.code(), error = %e, "request failed");
            e.into_response(&req.id)
        }
    }
}

pub fn db_conn(state: &AppState) -> ApiResult<&Connection> {
    state.db.as_ref().ok_or(ApiError::NoWorkspace)
}

pub fn require_session(state: &AppState) -> ApiResult<(&Connection, &SessionUser)> {
    let conn = db_conn(state)?;
    let user = state.session.as_ref().ok_or(ApiError::NotAuthenticated)?;
    Ok((conn, user))
}

pub fn require_admin(state: &AppState) -> ApiResult<(&Connection, &SessionUser)> {
    let (conn, user) = require_session(state)?;
    if !user.is_admin() {
        return Err(ApiError::Forbidden("super-admin only".into()));
    }
    Ok((conn, user))
}

pub fn required_str(req: &Request, key: &str) -> ApiResult<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_params(format!("missing {}", key)))
}

/// `None` when absent, null, or blank. Non-string values are rejected.
pub fn opt_str(req: &Request, key: &str) -> ApiResult<Option<String>> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| ApiError::bad_params(format!("{} must be string or null", key)))?
                .trim()
                .to_string();
            Ok(if s.is_empty() { None } else { Some(s) })
        }
    }
}

/// Like `opt_str` but keeps surrounding whitespace, which is significant in a
/// password. Only an empty string counts as absent.
pub fn opt_password(req: &Request, key: &str) -> ApiResult<Option<String>> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ApiError::bad_params(format!("{} must be string or null", key))),
    }
}

/// Distinguishes "not sent" (`None`) from "sent as null/blank" (`Some(None)`),
/// which update handlers need to clear optional columns.
pub fn patch_str(req: &Request, key: &str) -> ApiResult<Option<Option<String>>> {
    if req.params.get(key).is_none() {
        return Ok(None);
    }
    opt_str(req, key).map(Some)
}

pub fn opt_i64(req: &Request, key: &str) -> ApiResult<Option<i64>> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        // Form inputs often send numbers as strings.
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ApiError::bad_params(format!("{} must be an integer", key))),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| ApiError::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(params: Value) -> Request {
        Request {
            id: "t".into(),
            method: "test".into(),
            params,
        }
    }

    #[test]
    fn passwords_keep_whitespace() {
        let r = req(json!({ "password": " secret ", "name": " Asha " }));
        assert_eq!(
            opt_password(&r, "password").expect("password"),
            Some(" secret ".to_string())
        );
        assert_eq!(opt_str(&r, "name").expect("name"), Some("Asha".to_string()));
    }

    #[test]
    fn empty_or_missing_password_is_absent() {
        assert_eq!(opt_password(&req(json!({ "password": "" })), "password").expect("empty"), None);
        assert_eq!(opt_password(&req(json!({})), "password").expect("missing"), None);
        assert!(opt_password(&req(json!({ "password": 42 })), "password").is_err());
    }
}
