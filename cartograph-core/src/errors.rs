use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};
use thiserror::Error;

#[derive(Error, Debug)]
#[error(transparent)]
pub struct CartographError(Box<ErrorKind>);

impl CartographError {
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    pub fn cancelled() -> Self {
        ErrorKind::Cancelled.into()
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ErrorKind::Validation(message.into()).into()
    }

    pub fn provider(code: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorKind::Provider {
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
        .into()
    }

    pub fn provider_throttled(
        code: impl Into<String>,
        message: impl Into<String>,
        retry_after_ms: u64,
    ) -> Self {
        ErrorKind::Provider {
            code: code.into(),
            message: message.into(),
            retry_after_ms: Some(retry_after_ms),
        }
        .into()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind(), ErrorKind::Cancelled)
    }
}

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("SerdeJsonError: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),
    #[error("SqliteError: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("TomlError: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("InvalidProvider: {0}")]
    InvalidProvider(String),
    #[error("InvalidResourceType: {0}")]
    InvalidResourceType(String),
    #[error("InvalidRelationshipType: {0}")]
    InvalidRelationshipType(String),
    #[error("Validation: {0}")]
    Validation(String),
    #[error("NotFound: {0}")]
    NotFound(String),
    #[error("TenantNotFound: {0}")]
    TenantNotFound(String),
    #[error("TenantInactive: {0}")]
    TenantInactive(String),
    #[error("TenantLimitExceeded: tenant {tenant} exceeded {limit}")]
    TenantLimitExceeded { tenant: String, limit: String },
    #[error("AccountNotFound: {0}")]
    AccountNotFound(String),
    #[error("AdapterMissing: no adapter registered for provider {0}")]
    AdapterMissing(String),
    #[error("Storage: {0}")]
    Storage(String),
    #[error("Provider error {code}: {message}")]
    Provider {
        code: String,
        message: String,
        retry_after_ms: Option<u64>,
    },
    #[error("Cancelled")]
    Cancelled,
}

impl<E> From<E> for CartographError
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        CartographError(Box::new(ErrorKind::from(err)))
    }
}

/// Closed error taxonomy shared by the retry combinator and sync results.
#[derive(
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    PartialOrd,
    Ord,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    Auth,
    Permission,
    Throttle,
    NotFound,
    Conflict,
    Validation,
    Limit,
    Network,
    Service,
    #[serde(other)]
    Unknown,
}

impl ErrorCategory {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Throttle | ErrorCategory::Network | ErrorCategory::Service
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorClass {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub retry_after_ms: Option<u64>,
    pub code: String,
    pub message: String,
}

impl ErrorClass {
    fn new(category: ErrorCategory, code: &str, message: &str) -> Self {
        ErrorClass {
            category,
            retryable: category.retryable(),
            retry_after_ms: None,
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

const AUTH_CODES: &[&str] = &[
    "AuthFailure",
    "UnauthorizedException",
    "InvalidClientTokenId",
    "ExpiredToken",
    "ExpiredTokenException",
    "UNAUTHENTICATED",
    "401",
    "16",
];

const PERMISSION_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "UnauthorizedOperation",
    "Forbidden",
    "PERMISSION_DENIED",
    "403",
    "7",
];

const THROTTLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "TooManyRequests",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "RESOURCE_EXHAUSTED",
    "SlowDown",
    "429",
    "8",
];

const NOT_FOUND_CODES: &[&str] = &[
    "NotFound",
    "ResourceNotFoundException",
    "NoSuchEntity",
    "NoSuchBucket",
    "NOT_FOUND",
    "404",
    "5",
];

const CONFLICT_CODES: &[&str] = &[
    "Conflict",
    "ConflictException",
    "ResourceInUseException",
    "ALREADY_EXISTS",
    "409",
    "6",
];

const VALIDATION_CODES: &[&str] = &[
    "ValidationError",
    "ValidationException",
    "InvalidParameterValue",
    "MalformedQueryString",
    "INVALID_ARGUMENT",
    "400",
    "3",
];

const LIMIT_CODES: &[&str] = &[
    "LimitExceeded",
    "LimitExceededException",
    "QuotaExceeded",
    "ServiceQuotaExceededException",
    "OUT_OF_RANGE",
];

const NETWORK_CODES: &[&str] = &[
    "RequestTimeout",
    "RequestTimeoutException",
    "TimeoutError",
    "NetworkingError",
    "ETIMEDOUT",
    "ECONNRESET",
    "ECONNREFUSED",
    "EAI_AGAIN",
    "EPIPE",
    "DEADLINE_EXCEEDED",
    "408",
    "4",
];

const SERVICE_CODES: &[&str] = &[
    "InternalError",
    "InternalFailure",
    "InternalServerError",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "UNAVAILABLE",
    "500",
    "502",
    "503",
    "504",
    "14",
];

/// Maps a raw provider error code/message pair onto the closed taxonomy.
///
/// Codes cover the common AWS exception names, HTTP status strings and
/// numeric gRPC codes; anything unrecognized lands in `unknown`.
pub fn classify_code(code: &str, message: &str) -> ErrorClass {
    let table: &[(&[&str], ErrorCategory)] = &[
        (THROTTLE_CODES, ErrorCategory::Throttle),
        (AUTH_CODES, ErrorCategory::Auth),
        (PERMISSION_CODES, ErrorCategory::Permission),
        (NOT_FOUND_CODES, ErrorCategory::NotFound),
        (CONFLICT_CODES, ErrorCategory::Conflict),
        (VALIDATION_CODES, ErrorCategory::Validation),
        (LIMIT_CODES, ErrorCategory::Limit),
        (NETWORK_CODES, ErrorCategory::Network),
        (SERVICE_CODES, ErrorCategory::Service),
    ];
    for (codes, category) in table {
        if codes.iter().any(|c| c.eq_ignore_ascii_case(code)) {
            return ErrorClass::new(*category, code, message);
        }
    }
    ErrorClass::new(ErrorCategory::Unknown, code, message)
}

/// Classifies a crate error for retry decisions and sync result reporting.
pub fn classify(err: &CartographError) -> ErrorClass {
    match err.kind() {
        ErrorKind::Provider {
            code,
            message,
            retry_after_ms,
        } => {
            let mut class = classify_code(code, message);
            class.retry_after_ms = *retry_after_ms;
            class
        }
        ErrorKind::IoError(io) => ErrorClass::new(ErrorCategory::Network, "io", &io.to_string()),
        ErrorKind::NotFound(what) => ErrorClass::new(ErrorCategory::NotFound, "not-found", what),
        ErrorKind::AccountNotFound(what) | ErrorKind::TenantNotFound(what) => {
            ErrorClass::new(ErrorCategory::NotFound, "not-found", what)
        }
        ErrorKind::Validation(what)
        | ErrorKind::InvalidProvider(what)
        | ErrorKind::InvalidResourceType(what)
        | ErrorKind::InvalidRelationshipType(what) => {
            ErrorClass::new(ErrorCategory::Validation, "validation", what)
        }
        ErrorKind::TenantLimitExceeded { tenant, limit } => ErrorClass::new(
            ErrorCategory::Limit,
            "limit",
            &format!("tenant {tenant} exceeded {limit}"),
        ),
        ErrorKind::TenantInactive(tenant) => {
            ErrorClass::new(ErrorCategory::Conflict, "tenant-inactive", tenant)
        }
        ErrorKind::AdapterMissing(provider) => {
            ErrorClass::new(ErrorCategory::NotFound, "adapter-missing", provider)
        }
        ErrorKind::SqliteError(db) => {
            ErrorClass::new(ErrorCategory::Service, "sqlite", &db.to_string())
        }
        ErrorKind::Storage(what) => ErrorClass::new(ErrorCategory::Service, "storage", what),
        ErrorKind::Cancelled => ErrorClass::new(ErrorCategory::Unknown, "cancelled", "cancelled"),
        other => ErrorClass::new(ErrorCategory::Unknown, "unknown", &other.to_string()),
    }
}
