use serde_json::json;
use thiserror::Error;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadParams(String),

    #[error("select a workspace first")]
    NoWorkspace,

    #[error("log in first")]
    NotAuthenticated,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidCredentials(String),

    #[error("incorrect captcha")]
    CaptchaFailed,

    #[error("invalid or expired OTP")]
    OtpInvalid,

    #[error("failed to open workspace: {0:#}")]
    DbOpen(anyhow::Error),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error("{0:#}")]
    Backup(anyhow::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::BadParams(message.into())
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        Self::NotFound(format!("{} not found: {}", what, id))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadParams(_) => "bad_params",
            Self::NoWorkspace => "no_workspace",
            Self::NotAuthenticated => "not_authenticated",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidCredentials(_) => "invalid_credentials",
            Self::CaptchaFailed => "captcha_failed",
            Self::OtpInvalid => "otp_invalid",
            Self::DbOpen(_) => "db_open_failed",
            Self::Db(_) => "db_query_failed",
            Self::Backup(_) => "backup_failed",
            Self::Internal(_) => "internal",
        }
    }

    pub fn into_response(self, id: &str) -> serde_json::Value {
        err(id, self.code(), self.to_string(), None)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
