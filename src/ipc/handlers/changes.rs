use crate::db;
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{opt_i64, require_session, respond};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::collections::HashSet;

const MAX_CHANGES_PER_CALL: usize = 500;

/// Polling replacement for live queries: the shell remembers the last revision it
/// saw and asks for everything newer, then re-lists the collections that changed.
fn handle_changes_since(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, _) = require_session(state)?;
    let since = opt_i64(req, "revision")?.unwrap_or(0);
    if since < 0 {
        return Err(ApiError::bad_params("revision must be >= 0"));
    }
    let collections: Option<HashSet<String>> = match req.params.get("collections") {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| ApiError::bad_params("collections must be strings"))
                })
                .collect::<ApiResult<HashSet<_>>>()?,
        ),
        Some(_) => return Err(ApiError::bad_params("collections must be an array")),
    };

    let mut stmt = conn.prepare(
        "SELECT revision, collection, doc_id, op, at FROM changes
         WHERE revision > ?
         ORDER BY revision ASC",
    )?;
    let mut rows = stmt.query([since])?;

    let mut changes = Vec::new();
    let mut last_seen = since;
    let mut more = false;
    while let Some(row) = rows.next()? {
        let revision: i64 = row.get(0)?;
        let collection: String = row.get(1)?;
        if changes.len() == MAX_CHANGES_PER_CALL {
            more = true;
            break;
        }
        last_seen = revision;
        if let Some(filter) = collections.as_ref() {
            if !filter.contains(&collection) {
                continue;
            }
        }
        changes.push(json!({
            "revision": revision,
            "collection": collection,
            "docId": row.get::<_, String>(2)?,
            "op": row.get::<_, String>(3)?,
            "at": row.get::<_, String>(4)?,
        }));
    }

    // Without a cap hit the caller is fully caught up, even on filtered-out rows.
    let revision = if more { last_seen } else { db::current_revision(conn)?.max(since) };
    Ok(json!({ "revision": revision, "changes": changes, "more": more }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "changes.since" => Some(respond(req, handle_changes_since(state, req))),
        _ => None,
    }
}
