use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Value, json};

/// Domain failures surfaced by the engines.
///
/// Every variant maps to a stable message key (`key()`) and a value bag (`bag()`) so the
/// boundary can render or translate it; callers match on the variant, not on the text.
#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("illegal characters in command")]
    CmdIllegal,
    #[error("record already exists")]
    RecordExist,
    #[error("record not found")]
    RecordNotFound,
    #[error("email already exists")]
    EmailIsExist,
    #[error("eab kid and eab hmac key must not be blank")]
    EabKidOrEabHmacKeyCannotBlank,
    #[error("database user or password does not match the existing database")]
    DbUserNotValid,
    #[error("invalid app parameter key: {name}")]
    AppParamKey { name: String },
    #[error("name {name} already exists")]
    NameIsExist { name: String },

    #[error("port {port} is already used by {}", .apps.join(","))]
    PortInOtherApp { port: u16, apps: Vec<String> },
    #[error("port {port} is already in use")]
    PortInUsed { port: u16 },
    #[error("port {port} is already used by {kind} [{name}]")]
    PortExist {
        port: u16,
        kind: String,
        name: String,
    },
    #[error("the number of installations of this app has reached its limit")]
    AppLimit,
    #[error("the backup account is in use and cannot be deleted")]
    AccountCannotDelete,

    #[error("image pull failed, no such host: {detail}")]
    NoSuchHost { detail: String },
    #[error("image pull timed out: {detail}")]
    ImagePullTimeOut { detail: String },
    #[error("image pull failed: {err}")]
    DockerPullImage { err: String },
    #[error("container {name} does not exist")]
    ContainerNotFound { name: String },
    #[error("container {name} is abnormal, check its logs; ")]
    ContainerMsg { name: String },
    #[error("app is in an abnormal state, check the container logs")]
    AppWarn,

    #[error("file {name} not found")]
    FileNotFound { name: String },
    #[error("failed to parse {detail}")]
    FileParse { detail: String },
    #[error("failed to parse app file {name}: {err}")]
    FileParseApp { name: String, err: String },

    #[error("backup of app {name} failed: {err}")]
    AppBackup { name: String, err: String },

    #[error("{name} is busy with another operation")]
    Busy { name: String },
    #[error("the target version is the same as the installed version")]
    VersionSame,
    #[error("the new template has {new} services but the install has {old}")]
    ServiceCountChanged { old: usize, new: usize },
}

impl PanelError {
    pub fn key(&self) -> &'static str {
        match self {
            Self::CmdIllegal => "ErrCmdIllegal",
            Self::RecordExist => "ErrRecordExist",
            Self::RecordNotFound => "ErrRecordNotFound",
            Self::EmailIsExist => "ErrEmailIsExist",
            Self::EabKidOrEabHmacKeyCannotBlank => "ErrEabKidOrEabHmacKeyCannotBlank",
            Self::DbUserNotValid => "ErrDbUserNotValid",
            Self::AppParamKey { .. } => "ErrAppParamKey",
            Self::NameIsExist { .. } => "ErrNameIsExist",
            Self::PortInOtherApp { .. } => "ErrPortInOtherApp",
            Self::PortInUsed { .. } => "ErrPortInUsed",
            Self::PortExist { .. } => "ErrPortExist",
            Self::AppLimit => "ErrAppLimit",
            Self::AccountCannotDelete => "ErrAccountCannotDelete",
            Self::NoSuchHost { .. } => "ErrNoSuchHost",
            Self::ImagePullTimeOut { .. } => "ErrImagePullTimeOut",
            Self::DockerPullImage { .. } => "ErrDockerPullImage",
            Self::ContainerNotFound { .. } => "ErrContainerNotFound",
            Self::ContainerMsg { .. } => "ErrContainerMsg",
            Self::AppWarn => "ErrAppWarn",
            Self::FileNotFound { .. } => "ErrFileNotFound",
            Self::FileParse { .. } => "ErrFileParse",
            Self::FileParseApp { .. } => "ErrFileParseApp",
            Self::AppBackup { .. } => "ErrAppBackup",
            Self::Busy { .. } => "ErrBusy",
            Self::VersionSame => "ErrVersionSame",
            Self::ServiceCountChanged { .. } => "ErrServiceCountChanged",
        }
    }

    pub fn bag(&self) -> Value {
        match self {
            Self::AppParamKey { name }
            | Self::NameIsExist { name }
            | Self::ContainerNotFound { name }
            | Self::ContainerMsg { name }
            | Self::FileNotFound { name }
            | Self::Busy { name } => json!({ "name": name }),
            Self::PortInOtherApp { port, apps } => json!({ "port": port, "apps": apps }),
            Self::PortInUsed { port } => json!({ "port": port }),
            Self::PortExist { port, kind, name } => {
                json!({ "port": port, "type": kind, "name": name })
            }
            Self::NoSuchHost { detail }
            | Self::ImagePullTimeOut { detail }
            | Self::FileParse { detail } => json!({ "detail": detail }),
            Self::DockerPullImage { err } => json!({ "err": err }),
            Self::FileParseApp { name, err } | Self::AppBackup { name, err } => {
                json!({ "name": name, "err": err })
            }
            Self::ServiceCountChanged { old, new } => json!({ "old": old, "new": new }),
            _ => Value::Object(Default::default()),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::RecordNotFound => StatusCode::NOT_FOUND,
            Self::Busy { .. } => StatusCode::CONFLICT,
            Self::CmdIllegal
            | Self::RecordExist
            | Self::EmailIsExist
            | Self::EabKidOrEabHmacKeyCannotBlank
            | Self::DbUserNotValid
            | Self::AppParamKey { .. }
            | Self::NameIsExist { .. }
            | Self::PortInOtherApp { .. }
            | Self::PortInUsed { .. }
            | Self::PortExist { .. }
            | Self::AppLimit
            | Self::AccountCannotDelete
            | Self::VersionSame
            | Self::ServiceCountChanged { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Looks through an `anyhow` chain for a domain error.
pub fn panel_error(err: &anyhow::Error) -> Option<&PanelError> {
    err.chain().find_map(|e| e.downcast_ref::<PanelError>())
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Value,
}

impl ApiError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_argument", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }

    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match panel_error(&err) {
            Some(kind) => Self::new(kind.status(), kind.key(), kind.to_string())
                .with_details(kind.bag()),
            None => {
                tracing::warn!(error = %err, "request failed");
                Self::internal(format!("{err:#}"))
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    details: &'a Value,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: &self.message,
                details: &self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}
