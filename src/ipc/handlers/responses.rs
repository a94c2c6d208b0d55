use crate::db;
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::handlers::questionnaires::load_questionnaire;
use crate::ipc::handlers::schedules::{load_schedule, mark_completed};
use crate::ipc::helpers::{new_id, opt_str, require_admin, require_session, required_str, respond};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, Row};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone)]
struct ResponseRow {
    id: String,
    questionnaire_id: String,
    schedule_id: Option<String>,
    questionnaire_title: String,
    student_name: String,
    submitted_by: String,
    member_name: String,
    date: String,
    created_at: String,
}

impl ResponseRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            questionnaire_id: r.get(1)?,
            schedule_id: r.get(2)?,
            questionnaire_title: r.get(3)?,
            student_name: r.get(4)?,
            submitted_by: r.get(5)?,
            member_name: r.get(6)?,
            date: r.get(7)?,
            created_at: r.get(8)?,
        })
    }

    fn matches_search(&self, needle: &str) -> bool {
        self.student_name.to_lowercase().contains(needle)
            || self.questionnaire_title.to_lowercase().contains(needle)
    }
}

/// What a submission is answering: either a scheduled task's snapshot or a
/// template filled ad hoc.
struct SubmissionTarget {
    questionnaire_id: String,
    schedule_id: Option<String>,
    title: String,
    questions: Vec<String>,
    student_name: String,
}

fn resolve_target(conn: &Connection, req: &Request, user_id: &str) -> ApiResult<SubmissionTarget> {
    if let Some(schedule_id) = opt_str(req, "scheduleId")? {
        let schedule = load_schedule(conn, &schedule_id)?;
        if schedule.assigned_member_id != user_id {
            return Err(ApiError::Forbidden("task is assigned to another member".into()));
        }
        if !schedule.is_pending() {
            return Err(ApiError::Conflict(format!(
                "task already completed: {}",
                schedule.id
            )));
        }
        return Ok(SubmissionTarget {
            questionnaire_id: schedule.template_id,
            schedule_id: Some(schedule.id),
            title: schedule.title,
            questions: schedule.questions,
            student_name: schedule.student_name,
        });
    }

    let questionnaire_id = required_str(req, "questionnaireId")?;
    let q = load_questionnaire(conn, &questionnaire_id)?;
    let student_name = opt_str(req, "studentName")?
        .ok_or_else(|| ApiError::bad_params("enter student name"))?;
    Ok(SubmissionTarget {
        questionnaire_id: q.id,
        schedule_id: None,
        title: q.title,
        questions: q.questions,
        student_name,
    })
}

/// Returns answers in question order. Every question must be answered and no
/// answer may target a question the form doesn't have.
fn collect_answers(questions: &[String], raw: &Map<String, Value>) -> ApiResult<Vec<(String, String)>> {
    let known: HashSet<&str> = questions.iter().map(String::as_str).collect();
    for key in raw.keys() {
        if !known.contains(key.as_str()) {
            return Err(ApiError::bad_params(format!("unknown question: {}", key)));
        }
    }
    let mut out = Vec::with_capacity(questions.len());
    let mut missing = Vec::new();
    for q in questions {
        let answer = raw
            .get(q)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        match answer {
            Some(a) => out.push((q.clone(), a)),
            None => missing.push(q.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(ApiError::BadParams(format!(
            "please answer all questions ({} unanswered)",
            missing.len()
        )));
    }
    Ok(out)
}

fn load_answers(conn: &Connection) -> ApiResult<HashMap<String, Vec<(String, String)>>> {
    let mut stmt = conn
        .prepare("SELECT response_id, question, answer FROM response_answers ORDER BY response_id, idx")?;
    let mut rows = stmt.query([])?;
    let mut out: HashMap<String, Vec<(String, String)>> = HashMap::new();
    while let Some(row) = rows.next()? {
        let rid: String = row.get(0)?;
        out.entry(rid).or_default().push((row.get(1)?, row.get(2)?));
    }
    Ok(out)
}

fn load_responses(conn: &Connection) -> ApiResult<Vec<ResponseRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, questionnaire_id, schedule_id, questionnaire_title, student_name, submitted_by, member_name, date, created_at
         FROM responses
         ORDER BY date DESC, created_at DESC, rowid DESC",
    )?;
    let rows = stmt
        .query_map([], ResponseRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn response_json(r: &ResponseRow, answers: &[(String, String)]) -> Value {
    let answers: Vec<Value> = answers
        .iter()
        .map(|(q, a)| json!({ "question": q, "answer": a }))
        .collect();
    json!({
        "id": r.id,
        "questionnaireId": r.questionnaire_id,
        "scheduleId": r.schedule_id,
        "questionnaireTitle": r.questionnaire_title,
        "studentName": r.student_name,
        "submittedBy": r.submitted_by,
        "memberName": r.member_name,
        "date": r.date,
        "createdAt": r.created_at,
        "answers": answers,
    })
}

fn handle_responses_submit(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, user) = require_session(state)?;
    let target = resolve_target(conn, req, &user.id)?;
    let raw_answers = req
        .params
        .get("answers")
        .and_then(|v| v.as_object())
        .ok_or_else(|| ApiError::bad_params("answers must be an object of question -> answer"))?;
    let answers = collect_answers(&target.questions, raw_answers)?;

    let id = new_id();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO responses(id, questionnaire_id, schedule_id, questionnaire_title, student_name, submitted_by, member_name, date, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &target.questionnaire_id,
            &target.schedule_id,
            &target.title,
            &target.student_name,
            &user.id,
            &user.name,
            db::today(),
            db::now_rfc3339(),
        ),
    )?;
    for (idx, (q, a)) in answers.iter().enumerate() {
        tx.execute(
            "INSERT INTO response_answers(response_id, idx, question, answer) VALUES(?, ?, ?, ?)",
            (&id, idx as i64, q, a),
        )?;
    }
    if let Some(schedule_id) = target.schedule_id.as_deref() {
        mark_completed(&tx, schedule_id, &id)?;
    }
    db::record_change(&tx, "responses", &id, "create")?;
    tx.commit()?;

    tracing::info!(
        response_id = %id,
        questionnaire_id = %target.questionnaire_id,
        schedule_id = ?target.schedule_id,
        by = %user.id,
        "response submitted"
    );
    Ok(json!({
        "responseId": id,
        "scheduleCompleted": target.schedule_id.is_some(),
    }))
}

fn handle_responses_list(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, user) = require_session(state)?;
    let search = opt_str(req, "search")?.map(|s| s.to_lowercase());
    let answers = load_answers(conn)?;
    let empty = Vec::new();

    let responses: Vec<Value> = load_responses(conn)?
        .iter()
        .filter(|r| user.is_admin() || r.submitted_by == user.id)
        .filter(|r| search.as_deref().map(|s| r.matches_search(s)).unwrap_or(true))
        .map(|r| response_json(r, answers.get(&r.id).unwrap_or(&empty)))
        .collect();
    Ok(json!({ "responses": responses }))
}

#[derive(Default)]
struct Tally {
    // Keyed by folded answer; the first spelling seen is what gets reported.
    counts: HashMap<String, (String, i64)>,
}

impl Tally {
    fn add(&mut self, answer: &str) {
        let display = answer.trim();
        let key = display.to_lowercase();
        self.counts
            .entry(key)
            .or_insert_with(|| (display.to_string(), 0))
            .1 += 1;
    }

    fn into_sorted(self) -> Vec<(String, i64)> {
        let mut v: Vec<(String, i64)> = self.counts.into_values().collect();
        v.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        v
    }
}

fn handle_responses_summary(state: &mut AppState, req: &Request) -> ApiResult<Value> {
    let (conn, _) = require_admin(state)?;
    let questionnaire_id = required_str(req, "questionnaireId")?;
    let template = match load_questionnaire(conn, &questionnaire_id) {
        Ok(t) => Some(t),
        Err(ApiError::NotFound(_)) => None,
        Err(e) => return Err(e),
    };

    let rows: Vec<ResponseRow> = load_responses(conn)?
        .into_iter()
        .filter(|r| r.questionnaire_id == questionnaire_id)
        .collect();
    if template.is_none() && rows.is_empty() {
        return Err(ApiError::not_found("questionnaire", &questionnaire_id));
    }
    let answers = load_answers(conn)?;

    // Template order first; questions only found in older snapshots follow.
    let mut question_order: Vec<String> = template
        .as_ref()
        .map(|t| t.questions.clone())
        .unwrap_or_default();
    let mut tallies: HashMap<String, Tally> = HashMap::new();
    let mut per_member: BTreeMap<String, (String, i64)> = BTreeMap::new();
    let mut students: HashSet<String> = HashSet::new();

    // Oldest first so the earliest spelling of an answer is the one reported.
    for r in rows.iter().rev() {
        per_member
            .entry(r.submitted_by.clone())
            .or_insert_with(|| (r.member_name.clone(), 0))
            .1 += 1;
        students.insert(r.student_name.trim().to_lowercase());
        for (q, a) in answers.get(&r.id).map(Vec::as_slice).unwrap_or(&[]) {
            if !question_order.contains(q) {
                question_order.push(q.clone());
            }
            tallies.entry(q.clone()).or_default().add(a);
        }
    }

    let questions: Vec<Value> = question_order
        .iter()
        .map(|q| {
            let sorted = tallies.remove(q).unwrap_or_default().into_sorted();
            let answered: i64 = sorted.iter().map(|(_, n)| n).sum();
            let answers: Vec<Value> = sorted
                .into_iter()
                .map(|(answer, count)| json!({ "answer": answer, "count": count }))
                .collect();
            json!({ "question": q, "answered": answered, "answers": answers })
        })
        .collect();
    let members: Vec<Value> = per_member
        .into_iter()
        .map(|(id, (name, count))| json!({ "memberId": id, "memberName": name, "count": count }))
        .collect();

    let title = template
        .as_ref()
        .map(|t| t.title.clone())
        .or_else(|| rows.first().map(|r| r.questionnaire_title.clone()));

    Ok(json!({
        "questionnaireId": questionnaire_id,
        "title": title,
        "templateDeleted": template.is_none(),
        "responseCount": rows.len(),
        "distinctStudents": students.len(),
        "members": members,
        "questions": questions,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "responses.submit" => Some(respond(req, handle_responses_submit(state, req))),
        "responses.list" => Some(respond(req, handle_responses_list(state, req))),
        "responses.summary" => Some(respond(req, handle_responses_summary(state, req))),
        _ => None,
    }
}
