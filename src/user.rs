use bcrypt::{DEFAULT_COST, hash};
use chrono::{DateTime, offset::Utc};
use diesel::{BoolExpressionMethods, ExpressionMethods, QueryDsl, dsl::count};
use diesel_async::{RunQueryDsl, scoped_futures::ScopedFutureExt};
use itertools::Itertools;
use passwords::PasswordGenerator;
use serde::{Deserialize, Serialize};
use validator::Validate;
use warp::{Rejection, Reply};

use crate::{
    acquire_db_connection, counters,
    error::{Error, TransactionRuntimeError},
    mail,
    model::{NewUser, Post, Role, Topic, User},
    notification, perms,
    perms::Capability,
    retry_on_constraint_violation, run_retryable_transaction, run_serializable_transaction,
    schema::{
        post, registered_user, topic, topic_collection, topic_subscription, topic_view,
    },
    util::{PageParameters, PaginatedResponse, lower},
};

async fn load_user_by_name(
    user_name: &str,
    connection: &mut crate::DbConnection,
) -> Result<User, Error> {
    registered_user::table
        .filter(lower(registered_user::user_name).eq(&user_name.to_lowercase()))
        .get_result::<User>(connection)
        .await
        .map_err(|e| match e {
            diesel::NotFound => Error::UserNotFoundError(user_name.to_string()),
            e => e.into(),
        })
}

#[derive(Serialize)]
pub struct UserProfileResponse {
    pub user_name: String,
    pub display_name: Option<String>,
    pub company: Option<String>,
    pub position: Option<String>,
    pub user_role: Role,
    pub confirmed: bool,
    pub banned: bool,
    pub topic_count: i32,
    pub post_count: i64,
    pub creation_timestamp: DateTime<Utc>,
}

/// Loads another user's public profile. The published post count is computed on demand, only
/// the topic count is cached on the user row.
pub async fn get_user_handler(_user: User, user_name: String) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let profile_user = load_user_by_name(&user_name, &mut connection).await?;

    let post_count = post::table
        .inner_join(topic::table)
        .select(count(post::pk))
        .filter(
            post::fk_author
                .eq(profile_user.pk)
                .and(post::draft.eq(false))
                .and(post::deleted.eq(false))
                .and(topic::draft.eq(false))
                .and(topic::deleted.eq(false)),
        )
        .get_result::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&UserProfileResponse {
        user_name: profile_user.user_name,
        display_name: profile_user.display_name,
        company: profile_user.company,
        position: profile_user.position,
        user_role: profile_user.user_role,
        confirmed: profile_user.confirmed,
        banned: profile_user.banned,
        topic_count: profile_user.topic_count,
        post_count,
        creation_timestamp: profile_user.creation_timestamp,
    }))
}

#[derive(Deserialize, Validate)]
pub struct EditProfileRequest {
    #[validate(length(max = 32))]
    pub display_name: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
    #[validate(length(max = 128))]
    pub company: Option<String>,
    #[validate(length(max = 128))]
    pub position: Option<String>,
}

pub async fn edit_profile_handler(
    mut request: EditProfileRequest,
    user: User,
) -> Result<impl Reply, Rejection> {
    // set empty mail to None since an empty string would not validate
    if let Some(ref email) = request.email {
        if email.trim().is_empty() {
            request.email = None;
        }
    }
    request.validate().map_err(|e| {
        warp::reject::custom(Error::InvalidRequestInputError(format!(
            "Validation failed for EditProfileRequest: {}",
            e
        )))
    })?;

    let mut connection = acquire_db_connection().await?;
    let updated_user = diesel::update(registered_user::table)
        .filter(registered_user::pk.eq(user.pk))
        .set((
            registered_user::display_name.eq(request.display_name.or(user.display_name)),
            registered_user::email.eq(request.email.or(user.email)),
            registered_user::phone.eq(request.phone.or(user.phone)),
            registered_user::company.eq(request.company.or(user.company)),
            registered_user::position.eq(request.position.or(user.position)),
        ))
        .get_result::<User>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&crate::auth::UserInfo::from(updated_user)))
}

#[derive(Deserialize)]
pub struct NotificationSettingsRequest {
    pub receive_collect_notification: Option<bool>,
    pub receive_reply_notification: Option<bool>,
    pub receive_subscription_notification: Option<bool>,
}

pub async fn notification_settings_handler(
    request: NotificationSettingsRequest,
    user: User,
) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let updated_user = diesel::update(registered_user::table)
        .filter(registered_user::pk.eq(user.pk))
        .set((
            registered_user::receive_collect_notification.eq(request
                .receive_collect_notification
                .unwrap_or(user.receive_collect_notification)),
            registered_user::receive_reply_notification.eq(request
                .receive_reply_notification
                .unwrap_or(user.receive_reply_notification)),
            registered_user::receive_subscription_notification.eq(request
                .receive_subscription_notification
                .unwrap_or(user.receive_subscription_notification)),
        ))
        .get_result::<User>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&serde_json::json!({
        "receive_collect_notification": updated_user.receive_collect_notification,
        "receive_reply_notification": updated_user.receive_reply_notification,
        "receive_subscription_notification": updated_user.receive_subscription_notification,
    })))
}

#[derive(Serialize)]
pub struct CollectedTopicEntry {
    #[serde(flatten)]
    pub topic: Topic,
    pub author_name: String,
    pub collection_timestamp: DateTime<Utc>,
}

pub async fn get_collections_handler(
    user: User,
    page: PageParameters,
) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let limit = page.limit_or(*crate::TOPICS_PER_PAGE);

    let total_count = topic_collection::table
        .inner_join(topic::table)
        .select(count(topic::pk))
        .filter(
            topic_collection::fk_user
                .eq(user.pk)
                .and(topic::draft.eq(false))
                .and(topic::deleted.eq(false)),
        )
        .get_result::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    let entries = topic_collection::table
        .inner_join(topic::table.inner_join(registered_user::table))
        .filter(
            topic_collection::fk_user
                .eq(user.pk)
                .and(topic::draft.eq(false))
                .and(topic::deleted.eq(false)),
        )
        .select((
            topic::all_columns,
            registered_user::user_name,
            topic_collection::creation_timestamp,
        ))
        .order(topic_collection::creation_timestamp.desc())
        .limit(limit)
        .offset(page.offset(limit))
        .load::<(Topic, String, DateTime<Utc>)>(&mut connection)
        .await
        .map_err(Error::from)?
        .into_iter()
        .map(
            |(topic, author_name, collection_timestamp)| CollectedTopicEntry {
                topic,
                author_name,
                collection_timestamp,
            },
        )
        .collect::<Vec<_>>();

    Ok(warp::reply::json(&PaginatedResponse::new(
        entries,
        &page,
        limit,
        total_count,
    )))
}

#[derive(Serialize)]
pub struct SubscribedTopicEntry {
    #[serde(flatten)]
    pub topic: Topic,
    pub author_name: String,
    /// False when the user never opened the topic since subscribing.
    pub viewed: bool,
}

pub async fn get_subscriptions_handler(
    user: User,
    page: PageParameters,
) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let limit = page.limit_or(*crate::TOPICS_PER_PAGE);

    let total_count = topic_subscription::table
        .inner_join(topic::table)
        .select(count(topic::pk))
        .filter(
            topic_subscription::fk_user
                .eq(user.pk)
                .and(topic::draft.eq(false))
                .and(topic::deleted.eq(false)),
        )
        .get_result::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    let subscribed_topics = topic_subscription::table
        .inner_join(topic::table.inner_join(registered_user::table))
        .filter(
            topic_subscription::fk_user
                .eq(user.pk)
                .and(topic::draft.eq(false))
                .and(topic::deleted.eq(false)),
        )
        .select((topic::all_columns, registered_user::user_name))
        .order(topic_subscription::creation_timestamp.desc())
        .limit(limit)
        .offset(page.offset(limit))
        .load::<(Topic, String)>(&mut connection)
        .await
        .map_err(Error::from)?;

    let topic_pks = subscribed_topics
        .iter()
        .map(|(topic, _)| topic.pk)
        .collect_vec();
    let viewed_pks = topic_view::table
        .select(topic_view::fk_topic)
        .filter(
            topic_view::fk_user
                .eq(user.pk)
                .and(topic_view::fk_topic.eq_any(&topic_pks)),
        )
        .load::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    let entries = subscribed_topics
        .into_iter()
        .map(|(topic, author_name)| SubscribedTopicEntry {
            viewed: viewed_pks.contains(&topic.pk),
            topic,
            author_name,
        })
        .collect::<Vec<_>>();

    Ok(warp::reply::json(&PaginatedResponse::new(
        entries,
        &page,
        limit,
        total_count,
    )))
}

pub async fn get_draft_topics_handler(user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let drafts = topic::table
        .filter(
            topic::fk_author
                .eq(user.pk)
                .and(topic::draft.eq(true))
                .and(topic::deleted.eq(false)),
        )
        .order(topic::edit_timestamp.desc())
        .load::<Topic>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&drafts))
}

#[derive(Serialize)]
pub struct DraftPostEntry {
    #[serde(flatten)]
    pub post: Post,
    pub topic_title: String,
}

pub async fn get_draft_posts_handler(user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let drafts = post::table
        .inner_join(topic::table)
        .filter(
            post::fk_author
                .eq(user.pk)
                .and(post::draft.eq(true))
                .and(post::deleted.eq(false)),
        )
        .select((post::all_columns, topic::title))
        .order(post::edit_timestamp.desc())
        .load::<(Post, String)>(&mut connection)
        .await
        .map_err(Error::from)?
        .into_iter()
        .map(|(post, topic_title)| DraftPostEntry { post, topic_title })
        .collect::<Vec<_>>();

    Ok(warp::reply::json(&drafts))
}

pub async fn get_user_topics_handler(
    _user: User,
    user_name: String,
    page: PageParameters,
) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let profile_user = load_user_by_name(&user_name, &mut connection).await?;
    let limit = page.limit_or(*crate::TOPICS_PER_PAGE);

    let total_count = topic::table
        .select(count(topic::pk))
        .filter(
            topic::fk_author
                .eq(profile_user.pk)
                .and(topic::draft.eq(false))
                .and(topic::deleted.eq(false)),
        )
        .get_result::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    let topics = topic::table
        .filter(
            topic::fk_author
                .eq(profile_user.pk)
                .and(topic::draft.eq(false))
                .and(topic::deleted.eq(false)),
        )
        .order(topic::creation_timestamp.desc())
        .limit(limit)
        .offset(page.offset(limit))
        .load::<Topic>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&PaginatedResponse::new(
        topics,
        &page,
        limit,
        total_count,
    )))
}

pub async fn get_user_posts_handler(
    _user: User,
    user_name: String,
    page: PageParameters,
) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let profile_user = load_user_by_name(&user_name, &mut connection).await?;
    let limit = page.limit_or(*crate::POSTS_PER_PAGE);

    let total_count = post::table
        .select(count(post::pk))
        .filter(
            post::fk_author
                .eq(profile_user.pk)
                .and(post::draft.eq(false))
                .and(post::deleted.eq(false)),
        )
        .get_result::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    let posts = post::table
        .inner_join(topic::table)
        .filter(
            post::fk_author
                .eq(profile_user.pk)
                .and(post::draft.eq(false))
                .and(post::deleted.eq(false)),
        )
        .select((post::all_columns, topic::title))
        .order(post::creation_timestamp.desc())
        .limit(limit)
        .offset(page.offset(limit))
        .load::<(Post, String)>(&mut connection)
        .await
        .map_err(Error::from)?
        .into_iter()
        .map(|(post, topic_title)| DraftPostEntry { post, topic_title })
        .collect::<Vec<_>>();

    Ok(warp::reply::json(&PaginatedResponse::new(
        posts,
        &page,
        limit,
        total_count,
    )))
}

#[derive(Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(length(min = 1, max = 25))]
    pub user_name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(max = 32))]
    pub display_name: Option<String>,
    #[validate(length(max = 128))]
    pub company: Option<String>,
    #[validate(length(max = 128))]
    pub position: Option<String>,
    pub user_role: Option<Role>,
}

/// Creates a pre-confirmed account on behalf of a user, generating an initial password that is
/// mailed to the given address. Assigning a role beyond the standard one requires the
/// ADMINISTER capability.
pub async fn create_user_handler(
    request: CreateUserRequest,
    user: User,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Moderate).map_err(warp::reject::custom)?;
    request.validate().map_err(|e| {
        warp::reject::custom(Error::InvalidRequestInputError(format!(
            "Validation failed for CreateUserRequest: {}",
            e
        )))
    })?;

    let user_role = request.user_role.unwrap_or(Role::Standard);
    if user_role != Role::Standard {
        perms::require_capability(&user, Capability::Administer).map_err(warp::reject::custom)?;
    }

    let password_generator = PasswordGenerator::new()
        .length(12)
        .numbers(true)
        .lowercase_letters(true)
        .uppercase_letters(true)
        .symbols(false)
        .spaces(false)
        .exclude_similar_characters(true)
        .strict(true);
    let initial_password = password_generator
        .generate_one()
        .map_err(|e| Error::QueryError(format!("Failed to generate password: {e}")))?;
    let hashed_password =
        hash(&initial_password, DEFAULT_COST).map_err(|_| Error::EncryptionError)?;

    let new_user = NewUser {
        user_name: request.user_name,
        password: hashed_password,
        email: Some(request.email),
        display_name: request.display_name,
        phone: None,
        company: request.company,
        position: request.position,
        user_role,
        confirmed: true,
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

            diesel::insert_into(registered_user::table)
                .values(&new_user)
                .get_result::<User>(connection)
                .await
                .map_err(retry_on_constraint_violation)
        }
        .scope_boxed()
    })
    .await?;

    if mail::mail_enabled() {
        mail::send_account_created_mail(created_user.clone(), initial_password);
    } else {
        log::warn!("Not sending account creation mail because mail is not set up.");
    }

    Ok(warp::reply::json(&crate::auth::UserInfo::from(created_user)))
}

/// Confirms a registered account, unlocking contribution capabilities.
pub async fn confirm_user_handler(user_name: String, user: User) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Moderate).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    let target_user = load_user_by_name(&user_name, &mut connection).await?;

    if target_user.confirmed {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("user is already confirmed"),
        )));
    }

    let confirmed_user = run_retryable_transaction(&mut connection, |connection| {
        let target_user = target_user.clone();
        async move {
            let confirmed_user = diesel::update(registered_user::table)
                .filter(registered_user::pk.eq(target_user.pk))
                .set(registered_user::confirmed.eq(true))
                .get_result::<User>(connection)
                .await?;

            notification::push_notification(
                confirmed_user.pk,
                String::from("Your account has been confirmed"),
                None,
                connection,
            )
            .await?;

            Ok(confirmed_user)
        }
        .scope_boxed()
    })
    .await?;

    if mail::mail_enabled() && confirmed_user.email.is_some() {
        mail::send_account_confirmed_mail(confirmed_user.clone());
    }

    Ok(warp::reply::json(&crate::auth::UserInfo::from(
        confirmed_user,
    )))
}

#[derive(Deserialize)]
pub struct EditUserRequest {
    pub user_role: Option<Role>,
    pub confirmed: Option<bool>,
    pub banned: Option<bool>,
}

/// Moderation endpoint to confirm, ban or re-role an account. Role changes require the
/// ADMINISTER capability and administrator accounts may only be edited by administrators.
pub async fn edit_user_handler(
    request: EditUserRequest,
    user_name: String,
    user: User,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Moderate).map_err(warp::reject::custom)?;
    if request.user_role.is_some() {
        perms::require_capability(&user, Capability::Administer).map_err(warp::reject::custom)?;
    }

    let mut connection = acquire_db_connection().await?;
    let target_user = load_user_by_name(&user_name, &mut connection).await?;
    if target_user.user_role == Role::Administrator
        && !perms::has_capability(&user, Capability::Administer)
    {
        return Err(warp::reject::custom(Error::ForbiddenError));
    }

    let updated_user = diesel::update(registered_user::table)
        .filter(registered_user::pk.eq(target_user.pk))
        .set((
            registered_user::user_role
                .eq(request.user_role.unwrap_or(target_user.user_role)),
            registered_user::confirmed.eq(request.confirmed.unwrap_or(target_user.confirmed)),
            registered_user::banned.eq(request.banned.unwrap_or(target_user.banned)),
        ))
        .get_result::<User>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&crate::auth::UserInfo::from(updated_user)))
}

/// Deletes an account together with all its content. Administrator accounts cannot be
/// deleted. The aggregates of every group that contained content by the deleted user are
/// recomputed in the same transaction since the cascade may remove counted topics and posts.
pub async fn delete_user_handler(user_name: String, user: User) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Administer).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    let target_user = load_user_by_name(&user_name, &mut connection).await?;

    if target_user.user_role == Role::Administrator {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("administrator accounts cannot be deleted"),
        )));
    }

    run_serializable_transaction(&mut connection, |connection| {
        let target_user_pk = target_user.pk;
        async move {
            let authored_topic_groups = topic::table
                .select(topic::fk_group)
                .filter(topic::fk_author.eq(target_user_pk))
                .load::<i64>(connection)
                .await?;
            let authored_post_groups = post::table
                .inner_join(topic::table)
                .select(topic::fk_group)
                .filter(post::fk_author.eq(target_user_pk))
                .load::<i64>(connection)
                .await?;
            let affected_group_pks = authored_topic_groups
                .into_iter()
                .chain(authored_post_groups)
                .unique()
                .collect_vec();

            diesel::delete(
                registered_user::table.filter(registered_user::pk.eq(target_user_pk)),
            )
            .execute(connection)
            .await?;

            for group_pk in affected_group_pks {
                counters::recompute_group_aggregates(group_pk, connection).await?;
            }

            Ok::<_, TransactionRuntimeError>(())
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply())
}
