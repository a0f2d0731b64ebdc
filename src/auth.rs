use bcrypt::{DEFAULT_COST, hash, verify};
use chrono::{DateTime, Duration, offset::Utc};
use diesel::{dsl::count, expression_methods::BoolExpressionMethods};
use diesel_async::{AsyncPgConnection, RunQueryDsl, scoped_futures::ScopedFutureExt};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;
use warp::{
    Filter, Rejection, Reply,
    filters::header::headers_cloned,
    http::{
        Response, StatusCode,
        header::{self, HeaderMap},
    },
    hyper,
};
use zxcvbn::zxcvbn;

use crate::{
    acquire_db_connection,
    diesel::{ExpressionMethods, OptionalExtension, QueryDsl},
    error::{Error, TransactionRuntimeError},
    mail,
    model::{NewRefreshToken, NewUser, RefreshToken, Role, User},
    notification, retry_on_constraint_violation, run_retryable_transaction,
    schema::{refresh_token, registered_user},
    util::lower,
};

lazy_static! {
    pub static ref ACCESS_TOKEN_EXPIRATION: Duration = Duration::hours(3);
    pub static ref REFRESH_TOKEN_EXPIRATION: Duration = Duration::weeks(1);
}

/// Struct received by the /login request.
#[derive(Deserialize)]
pub struct LoginRequest {
    pub user_name: String,
    pub password: String,
}

/// Struct returned by the /login and /refresh-login endpoints.
#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub refresh_token: String,
    pub expiration_secs: i64,
    pub user: UserInfo,
}

/// Struct received by the /register endpoint used to create a user.
#[derive(Deserialize, Validate)]
pub struct UserRegistration {
    #[validate(length(min = 1, max = 25))]
    pub user_name: String,
    #[validate(length(min = 1, max = 255))]
    pub password: String,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(max = 32))]
    pub display_name: Option<String>,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
    #[validate(length(max = 128))]
    pub company: Option<String>,
    #[validate(length(max = 128))]
    pub position: Option<String>,
}

/// Struct encoded in the JWT that contains its expiry and subject user.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    exp: usize,
    sub: String,
    ver: i32,
}

/// Warp filter for requests that optionally receive the logged in user from the auth header.
pub fn with_user_optional() -> impl Filter<Extract = (Option<User>,), Error = Rejection> + Clone {
    headers_cloned().and_then(get_user_from_auth_header)
}

/// Warp filter for requests that require a logged in user provided by the auth header.
pub fn with_user() -> impl Filter<Extract = (User,), Error = Rejection> + Clone {
    headers_cloned().and_then(require_user_from_auth_header)
}

async fn require_user_from_auth_header(header_map: HeaderMap) -> Result<User, Rejection> {
    match get_user_from_auth_header(header_map).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(warp::reject::custom(Error::MissingAuthHeaderError)),
        Err(e) => Err(e),
    }
}

/// Decodes the user name provided by the JWT if provided and finds the matching User.
///
/// If the token is expired or has been invalidated (the `ver` field doesnt match the
/// `jwt_version` of the user) this returns a 401.
async fn get_user_from_auth_header(header_map: HeaderMap) -> Result<Option<User>, Rejection> {
    const JWT_BEARER_PREFIX: &str = "Bearer ";
    let auth_header = match header_map.get(header::AUTHORIZATION) {
        Some(h) => match std::str::from_utf8(h.as_bytes()) {
            Ok(v) => v,
            Err(_) => return Err(warp::reject::custom(Error::UtfEncodingError)),
        },
        None => return Ok(None),
    };

    if !auth_header.starts_with(JWT_BEARER_PREFIX) {
        return Err(warp::reject::custom(Error::InvalidAuthHeaderError));
    }

    let jwt_token = auth_header.trim_start_matches(JWT_BEARER_PREFIX);
    // fails if expired
    let token_data = decode::<Claims>(
        jwt_token,
        &DecodingKey::from_secret(&crate::JWT_SECRET.to_be_bytes()),
        &Validation::new(Algorithm::HS512),
    )
    .map_err(|_| warp::reject::custom(Error::InvalidJwtError))?;
    let claims = &token_data.claims;

    let mut connection = acquire_db_connection().await?;
    match registered_user::table
        .filter(registered_user::user_name.eq(&claims.sub))
        .get_result::<User>(&mut connection)
        .await
        .optional()
    {
        Ok(Some(registered_user)) if registered_user.jwt_version == claims.ver => {
            Ok(Some(registered_user))
        }
        Ok(_) => Err(warp::reject::custom(Error::InvalidJwtError)),
        Err(e) => Err(warp::reject::custom(Error::QueryError(e.to_string()))),
    }
}

/// Handler for the /login endpoint that receives a json deserialized to the [`LoginRequest`]
/// struct and returns a [`LoginResponse`] if the credentials are correct or a
/// InvalidCredentialsError, which results in a 403, if the credentials are not correct.
pub async fn login_handler(request: LoginRequest) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let found_registered_user = registered_user::table
        .filter(lower(registered_user::user_name).eq(&request.user_name.to_lowercase()))
        .get_result::<User>(&mut connection)
        .await;
    let registered_user = match found_registered_user {
        Ok(registered_user) => {
            let hashed_password = &registered_user.password;
            match verify(&request.password, hashed_password) {
                Ok(valid) => {
                    if valid {
                        diesel::update(registered_user::table)
                            .filter(registered_user::pk.eq(&registered_user.pk))
                            .set(registered_user::password_fail_count.eq(0))
                            .execute(&mut connection)
                            .await
                            .map_err(Error::from)?;
                        registered_user
                    } else {
                        diesel::update(registered_user::table)
                            .filter(registered_user::pk.eq(&registered_user.pk))
                            .set(
                                registered_user::password_fail_count
                                    .eq(registered_user::password_fail_count + 1),
                            )
                            .execute(&mut connection)
                            .await
                            .map_err(Error::from)?;
                        return Err(warp::reject::custom(Error::InvalidCredentialsError));
                    }
                }
                Err(_) => return Err(warp::reject::custom(Error::EncryptionError)),
            }
        }
        Err(diesel::NotFound) => return Err(warp::reject::custom(Error::InvalidCredentialsError)),
        Err(e) => return Err(warp::reject::custom(Error::QueryError(e.to_string()))),
    };

    if registered_user.banned {
        return Err(warp::reject::custom(Error::ForbiddenError));
    }

    let refresh_token_cookie =
        create_refresh_token_cookie(&registered_user, &mut connection).await?;
    create_login_response(registered_user, refresh_token_cookie).map_err(warp::reject::custom)
}

struct RefreshTokenCookie {
    token: String,
    cookie: String,
}

/// Create a HttpOnly Cookie that may be used to refresh logins by generating a UUID which is
/// persisted to the database as a RefreshToken entity which links the UUID to the User.
async fn create_refresh_token_cookie(
    registered_user: &User,
    connection: &mut AsyncPgConnection,
) -> Result<RefreshTokenCookie, Error> {
    let uuid = Uuid::new_v4();
    let current_utc = Utc::now();
    let expiry = current_utc + *REFRESH_TOKEN_EXPIRATION;

    let new_refresh_token = NewRefreshToken {
        uuid,
        expiry,
        invalidated: false,
        fk_user: registered_user.pk,
    };

    let refresh_token = match diesel::insert_into(refresh_token::table)
        .values(&new_refresh_token)
        .get_result::<RefreshToken>(connection)
        .await
    {
        Ok(refresh_token) => refresh_token,
        Err(e) => return Err(Error::QueryError(e.to_string())),
    };

    let uuid = refresh_token.uuid.to_string();
    let expiry = refresh_token.expiry.to_rfc2822();
    let cookie = format_refresh_token_cookie(&uuid, &expiry);

    Ok(RefreshTokenCookie {
        token: uuid,
        cookie,
    })
}

#[inline]
fn format_refresh_token_cookie(uuid: &str, expiry: &str) -> String {
    if cfg!(debug_assertions) {
        // unlike firefox, chrome does not allow setting Secure cookies on localhost
        format!("refresh_token={}; Expires={}; HttpOnly", uuid, expiry)
    } else {
        format!(
            "refresh_token={}; Expires={}; HttpOnly; Secure; SameSite=None",
            uuid, expiry
        )
    }
}

/// Create a [`LoginResponse`] for the provided User and add the provided refresh token cookie.
/// Used when a /login or /refresh-login succeeds.
fn create_login_response(
    registered_user: User,
    refresh_token_cookie: RefreshTokenCookie,
) -> Result<impl Reply, Error> {
    let expiration_period = *ACCESS_TOKEN_EXPIRATION;
    let expiration_secs = expiration_period.num_seconds();
    let expiration = Utc::now()
        .checked_add_signed(expiration_period)
        .expect("Invalid timestamp")
        .timestamp();

    let claims = Claims {
        exp: expiration as usize,
        sub: registered_user.user_name.clone(),
        ver: registered_user.jwt_version,
    };

    let header_value = Header::new(Algorithm::HS512);
    let token = match encode(
        &header_value,
        &claims,
        &EncodingKey::from_secret(&crate::JWT_SECRET.to_be_bytes()),
    ) {
        Ok(token) => token,
        Err(_) => return Err(Error::JwtCreationError),
    };

    let login_response = LoginResponse {
        token,
        refresh_token: refresh_token_cookie.token,
        expiration_secs,
        user: registered_user.into(),
    };

    let json_response =
        serde_json::to_vec(&login_response).map_err(|_| Error::SerialisationError)?;

    let response_body = Response::builder()
        .status(StatusCode::OK)
        .header(header::SET_COOKIE, refresh_token_cookie.cookie)
        .header(header::CONTENT_TYPE, "application/json")
        .body(json_response)
        .map_err(|_| Error::SerialisationError)?;

    Ok(response_body)
}

/// Refreshes a login for the provided refresh token by creating a fresh JWT for the User
/// linked to the refresh token and refreshes the refresh token with a new UUID and resets its
/// expiration.
///
/// Returns a [`LoginResponse`] with the new JWT if the refresh token is valid (the UUID exists
/// and the refresh token is not expired) or else returns a InvalidRefreshTokenError which
/// results in a 401.
pub async fn refresh_login_handler(refresh_token: String) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let (user, refresh_token_cookie) = run_retryable_transaction(&mut connection, |connection| {
        let refresh_token = refresh_token.clone();
        async move {
            let curr_token_uuid =
                Uuid::parse_str(&refresh_token).map_err(|_| Error::InvalidRefreshTokenError)?;
            let current_utc = Utc::now();

            let expiry = current_utc + *REFRESH_TOKEN_EXPIRATION;
            let new_token = Uuid::new_v4();

            let updated_token = diesel::update(refresh_token::table)
                .filter(
                    refresh_token::uuid
                        .eq(&curr_token_uuid)
                        .and(refresh_token::expiry.ge(&current_utc))
                        .and(refresh_token::invalidated.eq(false)),
                )
                .set((
                    refresh_token::uuid.eq(new_token),
                    refresh_token::expiry.eq(expiry),
                ))
                .get_result::<RefreshToken>(connection)
                .await
                .optional()
                .map_err(|e| Error::QueryError(e.to_string()))?
                .ok_or(Error::InvalidRefreshTokenError)?;

            let user = registered_user::table
                .filter(registered_user::pk.eq(updated_token.fk_user))
                .get_result::<User>(connection)
                .await
                .map_err(|e| Error::QueryError(e.to_string()))?;

            let uuid = updated_token.uuid.to_string();
            let expiry = updated_token.expiry.to_rfc2822();

            let cookie = format_refresh_token_cookie(&uuid, &expiry);
            Ok((
                user,
                RefreshTokenCookie {
                    token: uuid,
                    cookie,
                },
            ))
        }
        .scope_boxed()
    })
    .await?;

    create_login_response(user, refresh_token_cookie).map_err(warp::reject::custom)
}

pub async fn logout_handler(refresh_token: Option<String>) -> Result<impl Reply, Rejection> {
    let mut response_builder = Response::builder().status(StatusCode::OK);
    if let Some(refresh_token) = refresh_token {
        let curr_token_uuid =
            Uuid::parse_str(&refresh_token).map_err(|_| Error::BadRequestError)?;
        let mut connection = acquire_db_connection().await?;
        diesel::delete(refresh_token::table.filter(refresh_token::uuid.eq(&curr_token_uuid)))
            .execute(&mut connection)
            .await
            .map_err(Error::from)?;

        let refresh_token_cookie = format_refresh_token_cookie("", &Utc::now().to_rfc2822());
        response_builder = response_builder.header(header::SET_COOKIE, refresh_token_cookie);
    }

    Ok(response_builder.body(hyper::Body::empty()))
}

/// Registers a user by creating a new User. The created account starts with the standard role
/// and remains unconfirmed until an administrator confirms it; unconfirmed accounts may log in
/// and read public groups but cannot contribute content.
///
/// If the given user_name already exists the endpoint returns a UserExistsError which results
/// in a 400.
pub async fn register_handler(
    mut user_registration: UserRegistration,
) -> Result<impl Reply, Rejection> {
    // set empty mail to None since an empty string would not validate
    if let Some(ref email) = user_registration.email {
        if email.trim().is_empty() {
            user_registration.email = None;
        }
    }
    user_registration.validate().map_err(|e| {
        warp::reject::custom(Error::InvalidRequestInputError(format!(
            "Validation failed for UserRegistration: {}",
            e
        )))
    })?;

    check_password_strength(
        &user_registration.password,
        &user_registration.user_name,
        user_registration.email.as_deref(),
        user_registration.display_name.as_deref(),
    )
    .map_err(warp::reject::custom)?;

    let hashed_password = match hash(&user_registration.password, DEFAULT_COST) {
        Ok(hashed_password) => hashed_password,
        Err(_) => return Err(warp::reject::custom(Error::EncryptionError)),
    };

    let new_user = NewUser {
        user_name: user_registration.user_name,
        password: hashed_password,
        email: user_registration.email,
        display_name: user_registration.display_name,
        phone: user_registration.phone,
        company: user_registration.company,
        position: user_registration.position,
        user_role: Role::Standard,
        confirmed: false,
        creation_timestamp: Utc::now(),
    };
    let mut connection = acquire_db_connection().await?;
    let created_user = run_retryable_transaction(&mut connection, |connection| {
        let new_user = new_user.clone();
        async move {
            let existing_count: i64 = registered_user::table
                .select(count(registered_user::pk))
                .filter(lower(registered_user::user_name).eq(&new_user.user_name.to_lowercase()))
                .get_result(connection)
                .await?;

            if existing_count != 0 {
                return Err(TransactionRuntimeError::Rollback(Error::UserExistsError(
                    new_user.user_name.clone(),
                )));
            }

            let created_user = diesel::insert_into(registered_user::table)
                .values(&new_user)
                .get_result::<User>(connection)
                .await
                .map_err(retry_on_constraint_violation)?;

            notification::push_registration_notifications(&created_user, connection).await?;

            Ok(created_user)
        }
        .scope_boxed()
    })
    .await?;

    if mail::mail_enabled() {
        mail::send_registration_notice(&created_user);
    } else {
        log::warn!("Not sending registration notice because mail is not set up.");
    }

    let refresh_token_cookie = create_refresh_token_cookie(&created_user, &mut connection).await?;
    create_login_response(created_user, refresh_token_cookie).map_err(warp::reject::custom)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_name: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub position: Option<String>,
    pub user_role: Role,
    pub confirmed: bool,
    pub banned: bool,
    pub creation_timestamp: DateTime<Utc>,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        Self {
            user_name: user.user_name,
            email: user.email,
            display_name: user.display_name,
            phone: user.phone,
            company: user.company,
            position: user.position,
            user_role: user.user_role,
            confirmed: user.confirmed,
            banned: user.banned,
            creation_timestamp: user.creation_timestamp,
        }
    }
}

pub async fn current_user_info_handler(user: User) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&UserInfo::from(user)))
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub password: String,
    pub new_password: String,
}

pub async fn change_password_handler(
    request: ChangePasswordRequest,
    user: User,
) -> Result<impl Reply, Rejection> {
    let current_password = &user.password;
    let valid = verify(&request.password, current_password).map_err(|_| Error::EncryptionError)?;
    let mut connection = acquire_db_connection().await?;
    if !valid {
        diesel::update(registered_user::table)
            .filter(registered_user::pk.eq(&user.pk))
            .set(registered_user::password_fail_count.eq(registered_user::password_fail_count + 1))
            .execute(&mut connection)
            .await
            .map_err(Error::from)?;
        return Err(warp::reject::custom(Error::InvalidCredentialsError));
    } else {
        diesel::update(registered_user::table)
            .filter(registered_user::pk.eq(&user.pk))
            .set(registered_user::password_fail_count.eq(0))
            .execute(&mut connection)
            .await
            .map_err(Error::from)?;
    }

    check_password_strength(
        &request.new_password,
        &user.user_name,
        user.email.as_deref(),
        user.display_name.as_deref(),
    )
    .map_err(warp::reject::custom)?;

    let hashed_password =
        hash(&request.new_password, DEFAULT_COST).map_err(|_| Error::EncryptionError)?;

    run_retryable_transaction(&mut connection, |connection| {
        let hashed_password = hashed_password.clone();
        async move {
            // changing password increments jwt_version, the updated user needs to be loaded to
            // create a valid JWT
            let user = diesel::update(registered_user::table)
                .filter(registered_user::pk.eq(user.pk))
                .set(registered_user::password.eq(&hashed_password))
                .get_result::<User>(connection)
                .await?;

            diesel::update(refresh_token::table)
                .filter(refresh_token::fk_user.eq(user.pk))
                .set(refresh_token::invalidated.eq(true))
                .execute(connection)
                .await?;

            let refresh_token_cookie = create_refresh_token_cookie(&user, connection).await?;
            create_login_response(user, refresh_token_cookie).map_err(|e| e.into())
        }
        .scope_boxed()
    })
    .await
    .map_err(warp::reject::custom)
}

/// Runs the given password through zxcvbn, treating the user's own identifiers as common words.
pub fn check_password_strength(
    password: &str,
    user_name: &str,
    email: Option<&str>,
    display_name: Option<&str>,
) -> Result<(), Error> {
    let mut zxcvbn_user_data = vec![user_name];
    if let Some(email) = email {
        zxcvbn_user_data.push(email);
    }
    if let Some(display_name) = display_name {
        zxcvbn_user_data.push(display_name);
    }
    let entropy = zxcvbn(password, &zxcvbn_user_data);
    if <u8>::from(entropy.score()) < 3 {
        let feedback = entropy
            .feedback()
            .and_then(|feedback| feedback.warning())
            .map(|warning| warning.to_string())
            .unwrap_or_else(|| String::from("password guessed too easily"));
        return Err(Error::WeakPasswordError(feedback));
    }

    Ok(())
}
