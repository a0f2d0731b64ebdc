use chrono::offset::Utc;
use diesel::ExpressionMethods;
use diesel_async::{AsyncPgConnection, RunQueryDsl, scoped_futures::ScopedFutureExt};
use serde::Deserialize;
use validator::Validate;
use warp::{Rejection, Reply};

use crate::{
    acquire_db_connection, counters,
    error::{Error, TransactionRuntimeError},
    model::{Group, Post, Topic, User},
    notification, perms,
    perms::Capability,
    run_serializable_transaction,
    schema::post,
    util::NOT_BLANK_REGEX,
};

#[derive(Deserialize, Validate)]
pub struct EditPostRequest {
    #[validate(length(min = 1, max = 120), regex(path = *NOT_BLANK_REGEX))]
    pub title: Option<String>,
    #[validate(length(min = 1))]
    pub body: Option<String>,
}

pub async fn edit_post_handler(
    request: EditPostRequest,
    post_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    request.validate().map_err(|e| {
        warp::reject::custom(Error::InvalidRequestInputError(format!(
            "Validation failed for EditPostRequest: {}",
            e
        )))
    })?;

    let mut connection = acquire_db_connection().await?;
    let (loaded_post, _, group) =
        perms::load_post_secured(post_pk, &mut connection, Some(&user)).await?;
    perms::require_author_or_admin(&user, loaded_post.fk_author, &group)
        .map_err(warp::reject::custom)?;

    let updated_post = diesel::update(post::table)
        .filter(post::pk.eq(post_pk))
        .set((
            post::title.eq(request.title.unwrap_or(loaded_post.title)),
            post::body.eq(request.body.unwrap_or(loaded_post.body)),
            post::edit_timestamp.eq(Utc::now()),
        ))
        .get_result::<Post>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&updated_post))
}

/// Publishes a draft post, registering it with its topic's and group's aggregates.
pub async fn publish_post_handler(post_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let (loaded_post, containing_topic, group) =
        perms::load_post_secured(post_pk, &mut connection, Some(&user)).await?;
    perms::require_author_or_admin(&user, loaded_post.fk_author, &group)
        .map_err(warp::reject::custom)?;
    perms::check_group_writable(group.visibility, &user).map_err(warp::reject::custom)?;

    if !loaded_post.draft {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("post is already published"),
        )));
    }
    if loaded_post.deleted {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("cannot publish a deleted post"),
        )));
    }
    if !containing_topic.in_scope() {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("cannot publish a post in an unpublished topic"),
        )));
    }

    let published_post = run_serializable_transaction(&mut connection, |connection| {
        let containing_topic = containing_topic.clone();
        let user = user.clone();
        async move {
            // publication refreshes the creation timestamp so the post sorts as newest
            let published_post = diesel::update(post::table)
                .filter(post::pk.eq(post_pk))
                .set((
                    post::draft.eq(false),
                    post::creation_timestamp.eq(Utc::now()),
                ))
                .get_result::<Post>(connection)
                .await?;

            counters::register_published_post(
                containing_topic.fk_group,
                containing_topic.pk,
                post_pk,
                connection,
            )
            .await?;
            notification::push_subscription_notifications(&user, &containing_topic, connection)
                .await?;

            Ok::<_, TransactionRuntimeError>(published_post)
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply::json(&published_post))
}

/// Withdraws a published post back into draft state, removing it from the aggregates.
pub async fn withdraw_post_handler(post_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let (loaded_post, containing_topic, group) =
        perms::load_post_secured(post_pk, &mut connection, Some(&user)).await?;
    perms::require_author_or_admin(&user, loaded_post.fk_author, &group)
        .map_err(warp::reject::custom)?;

    if loaded_post.draft {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("post is already a draft"),
        )));
    }

    let withdrawn_post = run_serializable_transaction(&mut connection, |connection| {
        let loaded_post = loaded_post.clone();
        let containing_topic = containing_topic.clone();
        let group = group.clone();
        async move {
            let withdrawn_post = diesel::update(post::table)
                .filter(post::pk.eq(post_pk))
                .set(post::draft.eq(true))
                .get_result::<Post>(connection)
                .await?;

            if !loaded_post.deleted && containing_topic.in_scope() {
                counters::deregister_posts(&group, &containing_topic, &[post_pk], connection)
                    .await?;
            }

            Ok::<_, TransactionRuntimeError>(withdrawn_post)
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply::json(&withdrawn_post))
}

/// Hides an over-reported post by forcing it back into draft state, removing it from the
/// aggregates under the withdraw rules. Replies keep their state.
async fn hide_reported_post(
    hidden_post: &Post,
    containing_topic: &Topic,
    group: &Group,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    diesel::update(post::table)
        .filter(post::pk.eq(hidden_post.pk))
        .set(post::draft.eq(true))
        .execute(connection)
        .await?;

    if containing_topic.in_scope() {
        counters::deregister_posts(group, containing_topic, &[hidden_post.pk], connection).await?;
    }

    Ok(())
}

/// Reports a post. Once the report count passes the configured threshold the post is
/// withdrawn into draft state automatically, leaving the aggregates exactly as a withdraw
/// would.
pub async fn report_post_handler(post_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    perms::require_confirmed(&user).map_err(warp::reject::custom)?;
    perms::require_capability(&user, Capability::Member).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    let (_, containing_topic, group) =
        perms::load_post_secured(post_pk, &mut connection, Some(&user)).await?;

    run_serializable_transaction(&mut connection, |connection| {
        let containing_topic = containing_topic.clone();
        let group = group.clone();
        async move {
            let reported_post = diesel::update(post::table)
                .filter(post::pk.eq(post_pk))
                .set(post::report_count.eq(post::report_count + 1))
                .get_result::<Post>(connection)
                .await?;

            if counters::auto_hide_triggered(
                reported_post.report_count,
                *crate::MAX_REPORT_COUNT,
                reported_post.in_scope(),
            ) {
                hide_reported_post(&reported_post, &containing_topic, &group, connection).await?;
                notification::push_post_auto_hidden_notification(
                    &reported_post,
                    &containing_topic,
                    connection,
                )
                .await?;
            }

            Ok::<_, TransactionRuntimeError>(())
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply())
}

/// Clears the report counter of a post, used by moderators after reviewing reports. A post
/// that was hidden by the report threshold is republished in the process, re-entering the
/// aggregates under the recompute-newest rule.
pub async fn reset_post_reports_handler(
    post_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Moderate).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    let (loaded_post, containing_topic, _) =
        perms::load_post_secured(post_pk, &mut connection, Some(&user)).await?;

    let updated_post = run_serializable_transaction(&mut connection, |connection| {
        let loaded_post = loaded_post.clone();
        let containing_topic = containing_topic.clone();
        async move {
            let republish = counters::hidden_by_reports(
                loaded_post.draft,
                loaded_post.report_count,
                *crate::MAX_REPORT_COUNT,
            );

            let updated_post = if republish {
                diesel::update(post::table)
                    .filter(post::pk.eq(post_pk))
                    .set((post::report_count.eq(0), post::draft.eq(false)))
                    .get_result::<Post>(connection)
                    .await?
            } else {
                diesel::update(post::table)
                    .filter(post::pk.eq(post_pk))
                    .set(post::report_count.eq(0))
                    .get_result::<Post>(connection)
                    .await?
            };

            if republish && !loaded_post.deleted && containing_topic.in_scope() {
                counters::register_restored_post(
                    containing_topic.fk_group,
                    containing_topic.pk,
                    connection,
                )
                .await?;
            }

            Ok::<_, TransactionRuntimeError>(updated_post)
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply::json(&updated_post))
}
