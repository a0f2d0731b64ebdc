use serde::Serialize;
use thiserror::Error;
use warp::{Rejection, Reply, hyper::StatusCode, reject::Reject};

#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid credentials")]
    InvalidCredentialsError,
    #[error("Could not establish database connection")]
    DatabaseConnectionError,
    #[error("There has been an error executing a query: '{0}'")]
    QueryError(String),
    #[error("There has been an error creating the JWT token")]
    JwtCreationError,
    #[error("There has been an error encrypting / decrypting a password")]
    EncryptionError,
    #[error("There already exists a user with the given identifier: '{0}'")]
    UserExistsError(String),
    #[error("There already exists a group with the given name: '{0}'")]
    GroupExistsError(String),
    #[error("Failed to decode request header as valid utf8")]
    UtfEncodingError,
    #[error("The auth header is not formatted correctly (expected JWT 'Bearer ' header)")]
    InvalidAuthHeaderError,
    #[error("No auth header provided")]
    MissingAuthHeaderError,
    #[error("The request is not formatted correctly")]
    BadRequestError,
    #[error("The JWT is not or no longer valid")]
    InvalidJwtError,
    #[error("Failed to serialise data")]
    SerialisationError,
    #[error("The provided refresh token is invalid")]
    InvalidRefreshTokenError,
    #[error("The request input could not be validated: '{0}'")]
    InvalidRequestInputError(String),
    #[error("The provided password is too weak: '{0}'")]
    WeakPasswordError(String),
    #[error("No {0} found for key {1}")]
    NotFoundError(&'static str, i64),
    #[error("No user found for name '{0}'")]
    UserNotFoundError(String),
    #[error("The current user is not allowed to perform this operation")]
    ForbiddenError,
    #[error("The current user account has not been confirmed by an administrator yet")]
    UnconfirmedUserError,
    #[error("The operation conflicts with the current state of the entity: {0}")]
    StateConflictError(String),
}

impl Reject for Error {}

impl From<diesel::result::Error> for Error {
    fn from(e: diesel::result::Error) -> Self {
        Error::QueryError(e.to_string())
    }
}

/// Wrapper around [`Error`] returned by transaction closures that marks an error as either
/// retryable (e.g. a serialization failure of a serializable transaction) or as a definitive
/// rollback.
#[derive(Error, Debug)]
pub enum TransactionRuntimeError {
    #[error(transparent)]
    Retry(Error),
    #[error(transparent)]
    Rollback(#[from] Error),
}

impl From<diesel::result::Error> for TransactionRuntimeError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::SerializationFailure,
                _,
            ) => TransactionRuntimeError::Retry(e.into()),
            _ => TransactionRuntimeError::Rollback(e.into()),
        }
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    message: String,
    status: String,
}

/// Creates a Rejection response for the given error and logs internal server errors.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Rejection> {
    if let Some(e) = err.find::<Error>() {
        let (code, message) = match e {
            Error::InvalidCredentialsError
            | Error::ForbiddenError
            | Error::UnconfirmedUserError => (StatusCode::FORBIDDEN, e.to_string()),
            Error::MissingAuthHeaderError
            | Error::InvalidJwtError
            | Error::InvalidRefreshTokenError => (StatusCode::UNAUTHORIZED, e.to_string()),
            Error::NotFoundError(_, _) | Error::UserNotFoundError(_) => {
                (StatusCode::NOT_FOUND, e.to_string())
            }
            Error::StateConflictError(_) => (StatusCode::CONFLICT, e.to_string()),
            Error::UserExistsError(_)
            | Error::GroupExistsError(_)
            | Error::UtfEncodingError
            | Error::InvalidAuthHeaderError
            | Error::BadRequestError
            | Error::WeakPasswordError(_)
            | Error::InvalidRequestInputError(_) => (StatusCode::BAD_REQUEST, e.to_string()),
            Error::DatabaseConnectionError
            | Error::QueryError(_)
            | Error::JwtCreationError
            | Error::EncryptionError
            | Error::SerialisationError => {
                log::error!("Encountered internal server error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };

        let err_response = ErrorResponse {
            message,
            status: code.to_string(),
        };

        let json = warp::reply::json(&err_response);

        Ok(warp::reply::with_status(json, code))
    } else {
        Err(err)
    }
}
