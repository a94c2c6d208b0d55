use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "counseld.sqlite3";

pub const ROLE_SUPER_ADMIN: &str = "SUPER_ADMIN";
pub const ROLE_MEMBER: &str = "MEMBER";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            username TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            password_salt TEXT NOT NULL,
            mobile TEXT,
            email TEXT,
            role TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'Active',
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_username ON users(username COLLATE NOCASE)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            username TEXT,
            phone TEXT,
            email TEXT,
            standard TEXT NOT NULL,
            division TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reports(
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            created_by TEXT NOT NULL,
            date TEXT NOT NULL,
            school_name TEXT NOT NULL,
            content TEXT NOT NULL,
            student_name TEXT,
            standard TEXT,
            topic TEXT,
            attendees INTEGER,
            updated_at TEXT,
            FOREIGN KEY(created_by) REFERENCES users(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reports_created_by ON reports(created_by)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questionnaires(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS questionnaire_questions(
            questionnaire_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            text TEXT NOT NULL,
            PRIMARY KEY(questionnaire_id, idx),
            FOREIGN KEY(questionnaire_id) REFERENCES questionnaires(id) ON DELETE CASCADE
        )",
        [],
    )?;

    // Schedules snapshot the template so later template edits/deletes don't change
    // a task that was already assigned.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedules(
            id TEXT PRIMARY KEY,
            template_id TEXT NOT NULL,
            title TEXT NOT NULL,
            questions_json TEXT NOT NULL,
            assigned_member_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            student_name TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            FOREIGN KEY(assigned_member_id) REFERENCES users(id) ON DELETE CASCADE
        )",
        [],
    )?;
    ensure_schedules_response_id(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_member ON schedules(assigned_member_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_student ON schedules(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS responses(
            id TEXT PRIMARY KEY,
            questionnaire_id TEXT NOT NULL,
            schedule_id TEXT,
            questionnaire_title TEXT NOT NULL,
            student_name TEXT NOT NULL,
            submitted_by TEXT NOT NULL,
            member_name TEXT NOT NULL,
            date TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_responses_questionnaire ON responses(questionnaire_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_responses_submitted_by ON responses(submitted_by)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS response_answers(
            response_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            question TEXT NOT NULL,
            answer TEXT NOT NULL,
            PRIMARY KEY(response_id, idx),
            FOREIGN KEY(response_id) REFERENCES responses(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            date TEXT NOT NULL,
            type TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_date ON events(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS otps(
            id TEXT PRIMARY KEY,
            contact TEXT NOT NULL,
            code TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_otps_contact ON otps(contact)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS captchas(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS changes(
            revision INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            op TEXT NOT NULL,
            at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

// Workspaces created before task completion was linked to its response lack this column.
fn ensure_schedules_response_id(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "schedules", "response_id")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE schedules ADD COLUMN response_id TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => {
            let v = serde_json::from_str(&s)
                .with_context(|| format!("setting {} is not valid JSON", key))?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Appends one entry to the change feed and returns its revision.
pub fn record_change(
    conn: &Connection,
    collection: &str,
    doc_id: &str,
    op: &str,
) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO changes(collection, doc_id, op, at) VALUES(?, ?, ?, ?)",
        (collection, doc_id, op, now_rfc3339()),
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn current_revision(conn: &Connection) -> anyhow::Result<i64> {
    let rev: Option<i64> = conn.query_row("SELECT MAX(revision) FROM changes", [], |r| r.get(0))?;
    Ok(rev.unwrap_or(0))
}

pub fn count_users(conn: &Connection) -> anyhow::Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn today() -> String {
    chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string()
}
