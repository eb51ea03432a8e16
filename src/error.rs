use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid argument: {message}"))]
    InvalidArgument { message: String },

    #[snafu(display("The {backend} backend cannot run {operation} inside an ambient transaction"))]
    TransactionUnsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error serializing message content"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Dispatch failed: {source}"))]
    Dispatch {
        #[snafu(source(false))]
        source: eyre::Report,
    },

    #[snafu(display("Internal server error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(eyre::Report, Some)))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }

    pub fn dispatch(e: impl Into<eyre::Report>) -> Self {
        Self::Dispatch { source: e.into() }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn transaction_unsupported(backend: &'static str, operation: &'static str) -> Self {
        Self::TransactionUnsupported { backend, operation }
    }

    pub fn message_not_found(kind: impl std::fmt::Display, id: i64) -> Self {
        Self::NotFound {
            resource: format!("{kind} message {id}"),
        }
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            Self::NotFound { .. } => actix_web::http::StatusCode::NOT_FOUND,

            Self::InvalidArgument { .. } => actix_web::http::StatusCode::BAD_REQUEST,

            Self::TransactionUnsupported { .. }
            | Self::Sqlx { .. }
            | Self::Serialization { .. }
            | Self::Dispatch { .. }
            | Self::InternalServerError { .. }
            | Self::Whatever { .. } => actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
