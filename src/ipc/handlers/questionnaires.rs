use crate::db;
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{new_id, require_admin, require_session, required_str, respond};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct Questionnaire {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub questions: Vec<String>,
}

impl Questionnaire {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "title": self.title,
            "createdAt": self.created_at,
            "questionCount": self.questions.len(),
            "questions": self.questions,
        })
    }
}

fn load_questions(conn: &Connection, questionnaire_id: &str) -> ApiResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT text FROM questionnaire_questions WHERE questionnaire_id = ? ORDER BY idx")?;
    let questions = stmt
        .query_map([questionnaire_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(questions)
}

pub fn load_questionnaire(conn: &Connection, id: &str) -> ApiResult<Questionnaire> {
    let head: Option<(String, String)> = conn
        .query_row(
            "SELECT title, created_at FROM questionnaires WHERE id = ?",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let (title, created_at) = head.ok_or_else(|| ApiError::not_found("questionnaire", id))?;
    Ok(Questionnaire {
        id: id.to_string(),
        title,
        created_at,
        questions: load_questions(conn, id)?,
    })
}

/// Questions double as answer keys, so they must be non-blank and distinct.
fn parse_questions(req: &Request) -> ApiResult<Vec<String>> {
    let arr = req
        .params
        .get("questions")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ApiError::bad_params("questions must be an array of strings"))?;
    if arr.is_empty() {
        return Err(ApiError::bad_params("at least one question is required"));
    }
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(arr.len());
    for (i, v) in arr.iter().enumerate() {
        let q = v
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::bad_params(format!("question {} is empty", i + 1)))?;
        if !seen.insert(q.clone()) {
            return Err(ApiError::bad_params(format!("duplicate question: {}", q)));
        }
        out.push(q);
    }
    Ok(out)
}

fn handle_questionnaires_create(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, admin) = require_admin(state)?;
    let title = required_str(req, "title")?;
    let questions = parse_questions(req)?;

    let id = new_id();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO questionnaires(id, title, created_at) VALUES(?, ?, ?)",
        (&id, &title, db::now_rfc3339()),
    )?;
    for (idx, q) in questions.iter().enumerate() {
        tx.execute(
            "INSERT INTO questionnaire_questions(questionnaire_id, idx, text) VALUES(?, ?, ?)",
            (&id, idx as i64, q),
        )?;
    }
    db::record_change(&tx, "questionnaires", &id, "create")?;
    tx.commit()?;

    tracing::info!(questionnaire_id = %id, questions = questions.len(), by = %admin.id, "questionnaire created");
    Ok(json!({ "questionnaire": load_questionnaire(conn, &id)?.to_json() }))
}

fn handle_questionnaires_list(state: &mut AppState, _req: &Request) -> ApiResult<Value> {
    let (conn, _) = require_session(state)?;
    let ids: Vec<String> = {
        let mut stmt =
            conn.prepare("SELECT id FROM questionnaires ORDER BY created_at DESC, rowid DESC")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        out.push(load_questionnaire(conn, &id)?.to_json());
    }
    Ok(json!({ "questionnaires": out }))
}

fn handle_questionnaires_get(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, _) = require_session(state)?;
    let id = required_str(req, "questionnaireId")?;
    Ok(json!({ "questionnaire": load_questionnaire(conn, &id)?.to_json() }))
}

fn handle_questionnaires_delete(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, admin) = require_admin(state)?;
    let id = required_str(req, "questionnaireId")?;
    load_questionnaire(conn, &id)?;
    // Schedules and responses carry their own copy of title/questions and stay.
    conn.execute("DELETE FROM questionnaires WHERE id = ?", [&id])?;
    db::record_change(conn, "questionnaires", &id, "delete")?;
    tracing::info!(questionnaire_id = %id, by = %admin.id, "questionnaire deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "questionnaires.create" => Some(respond(req, handle_questionnaires_create(state, req))),
        "questionnaires.list" => Some(respond(req, handle_questionnaires_list(state, req))),
        "questionnaires.get" => Some(respond(req, handle_questionnaires_get(state, req))),
        "questionnaires.delete" => Some(respond(req, handle_questionnaires_delete(state, req))),
        _ => None,
    }
}
