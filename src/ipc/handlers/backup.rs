use crate::backup;
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::helpers::{opt_str, require_admin, required_str, respond};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// `./ws`, `ws/` and an absolute spelling of the same directory all match.
fn same_directory(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

fn handle_export_workspace_bundle(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    require_admin(state)?;
    let workspace = state.workspace.clone().ok_or(ApiError::NoWorkspace)?;
    let out_path = PathBuf::from(required_str(req, "outPath")?);

    let summary =
        backup::export_workspace_bundle(&workspace, &out_path).map_err(ApiError::Backup)?;
    tracing::info!(out = %out_path.to_string_lossy(), sha256 = %summary.db_sha256, "workspace exported");
    Ok(json!({
        "ok": true,
        "path": out_path.to_string_lossy(),
        "bundleFormat": summary.bundle_format,
        "entryCount": summary.entry_count,
        "dbSha256": summary.db_sha256,
    }))
}

fn handle_import_workspace_bundle(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    require_admin(state)?;
    let current = state.workspace.clone().ok_or(ApiError::NoWorkspace)?;
    let in_path = PathBuf::from(required_str(req, "inPath")?);
    let target = opt_str(req, "workspacePath")?
        .map(PathBuf::from)
        .unwrap_or_else(|| current.clone());
    let replacing_current = same_directory(&target, &current);

    if replacing_current {
        // Release the SQLite handle before the file underneath it is swapped.
        state.db = None;
    }
    let imported = backup::import_workspace_bundle(&in_path, &target).map_err(ApiError::Backup);
    if replacing_current {
        // Reopen even on failure so the process isn't left without a workspace.
        if let Err(e) = open_workspace(state, &current) {
            state.workspace = None;
            state.session = None;
            return Err(e);
        }
    }
    let summary = imported?;

    tracing::info!(
        from = %in_path.to_string_lossy(),
        workspace = %target.to_string_lossy(),
        format = %summary.bundle_format_detected,
        "workspace imported"
    );
    Ok(json!({
        "ok": true,
        "workspacePath": target.to_string_lossy(),
        "bundleFormatDetected": summary.bundle_format_detected,
        "reopened": replacing_current,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => {
            Some(respond(req, handle_export_workspace_bundle(state, req)))
        }
        "backup.importWorkspaceBundle" => {
            Some(respond(req, handle_import_workspace_bundle(state, req)))
        }
        _ => None,
    }
}
