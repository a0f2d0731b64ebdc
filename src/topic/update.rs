use chrono::offset::Utc;
use diesel::{BoolExpressionMethods, ExpressionMethods, QueryDsl};
use diesel_async::{AsyncPgConnection, RunQueryDsl, scoped_futures::ScopedFutureExt};
use serde::Deserialize;
use validator::Validate;
use warp::{Rejection, Reply};

use crate::{
    acquire_db_connection, counters,
    error::{Error, TransactionRuntimeError},
    model::{Topic, User},
    notification, perms,
    perms::Capability,
    run_serializable_transaction,
    schema::{post, registered_user, topic},
    util::NOT_BLANK_REGEX,
};

#[derive(Deserialize, Validate)]
pub struct EditTopicRequest {
    #[validate(length(min = 1, max = 120), regex(path = *NOT_BLANK_REGEX))]
    pub title: Option<String>,
    #[validate(length(min = 1))]
    pub body: Option<String>,
}

/// Edits the title or body of a topic. Editing never changes the topic's scope, so the
/// aggregates stay untouched.
pub async fn edit_topic_handler(
    request: EditTopicRequest,
    topic_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    request.validate().map_err(|e| {
        warp::reject::custom(Error::InvalidRequestInputError(format!(
            "Validation failed for EditTopicRequest: {}",
            e
        )))
    })?;

    let mut connection = acquire_db_connection().await?;
    let (loaded_topic, group) =
        perms::load_topic_secured(topic_pk, &mut connection, Some(&user)).await?;
    perms::require_author_or_admin(&user, loaded_topic.fk_author, &group)
        .map_err(warp::reject::custom)?;

    let updated_topic = diesel::update(topic::table)
        .filter(topic::pk.eq(topic_pk))
        .set((
            topic::title.eq(request.title.unwrap_or(loaded_topic.title)),
            topic::body.eq(request.body.unwrap_or(loaded_topic.body)),
            topic::edit_timestamp.eq(Utc::now()),
        ))
        .get_result::<Topic>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&updated_topic))
}

/// Publishes a draft topic, registering it with the group's aggregates. The freshly published
/// topic is newest by definition.
pub async fn publish_topic_handler(topic_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let (loaded_topic, group) =
        perms::load_topic_secured(topic_pk, &mut connection, Some(&user)).await?;
    perms::require_author_or_admin(&user, loaded_topic.fk_author, &group)
        .map_err(warp::reject::custom)?;
    perms::check_group_writable(group.visibility, &user).map_err(warp::reject::custom)?;

    if !loaded_topic.draft {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("topic is already published"),
        )));
    }
    if loaded_topic.deleted {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("cannot publish a deleted topic"),
        )));
    }

    let published_topic = run_serializable_transaction(&mut connection, |connection| {
        let loaded_topic = loaded_topic.clone();
        async move {
            // publication also refreshes the creation timestamp so the topic sorts as newest
            let published_topic = diesel::update(topic::table)
                .filter(topic::pk.eq(topic_pk))
                .set((
                    topic::draft.eq(false),
                    topic::creation_timestamp.eq(Utc::now()),
                ))
                .get_result::<Topic>(connection)
                .await?;

            counters::register_published_topic(loaded_topic.fk_group, topic_pk, connection)
                .await?;
            diesel::update(registered_user::table)
                .filter(registered_user::pk.eq(loaded_topic.fk_author))
                .set(registered_user::topic_count.eq(registered_user::topic_count + 1))
                .execute(connection)
                .await?;

            Ok(published_topic)
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply::json(&published_topic))
}

/// Withdraws a published topic back into draft state. Topics that already accumulated
/// published posts cannot be withdrawn since the drafts of other authors' replies would be
/// orphaned; those must be deleted instead.
pub async fn withdraw_topic_handler(topic_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let (loaded_topic, group) =
        perms::load_topic_secured(topic_pk, &mut connection, Some(&user)).await?;
    perms::require_author_or_admin(&user, loaded_topic.fk_author, &group)
        .map_err(warp::reject::custom)?;

    if loaded_topic.draft {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("topic is already a draft"),
        )));
    }
    if loaded_topic.post_count > 0 {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("cannot withdraw a topic that has published posts"),
        )));
    }

    let withdrawn_topic = run_serializable_transaction(&mut connection, |connection| {
        let loaded_topic = loaded_topic.clone();
        let group = group.clone();
        async move {
            let withdrawn_topic = diesel::update(topic::table)
                .filter(topic::pk.eq(topic_pk))
                .set(topic::draft.eq(true))
                .get_result::<Topic>(connection)
                .await?;

            if !loaded_topic.deleted {
                counters::deregister_topic(&group, topic_pk, &[], connection).await?;
                diesel::update(registered_user::table)
                    .filter(registered_user::pk.eq(loaded_topic.fk_author))
                    .set(registered_user::topic_count.eq(registered_user::topic_count - 1))
                    .execute(connection)
                    .await?;
            }

            Ok(withdrawn_topic)
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply::json(&withdrawn_topic))
}

/// Pins a topic to the top of its group listing. Pinning is presentation only and does not
/// affect the aggregates.
pub async fn pin_topic_handler(topic_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    set_topic_pinned(topic_pk, user, true).await
}

pub async fn unpin_topic_handler(topic_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    set_topic_pinned(topic_pk, user, false).await
}

async fn set_topic_pinned(
    topic_pk: i64,
    user: User,
    pinned: bool,
) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let (loaded_topic, group) =
        perms::load_topic_secured(topic_pk, &mut connection, Some(&user)).await?;
    if user.pk != group.fk_admin && !perms::has_capability(&user, Capability::Moderate) {
        return Err(warp::reject::custom(Error::ForbiddenError));
    }
    if loaded_topic.pinned == pinned {
        return Err(warp::reject::custom(Error::StateConflictError(format!(
            "topic is {} pinned",
            if pinned { "already" } else { "not" }
        ))));
    }

    let pinned_timestamp = if pinned { Some(Utc::now()) } else { None };
    let updated_topic = diesel::update(topic::table)
        .filter(topic::pk.eq(topic_pk))
        .set((
            topic::pinned.eq(pinned),
            topic::pinned_timestamp.eq(pinned_timestamp),
        ))
        .get_result::<Topic>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&updated_topic))
}

/// Hides an over-reported topic by forcing it back into draft state alongside its published
/// posts. The whole set leaves the aggregates under the withdraw rules, so a later report
/// reset can republish the topic.
async fn hide_reported_topic(
    hidden_topic: &Topic,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    diesel::update(topic::table)
        .filter(topic::pk.eq(hidden_topic.pk))
        .set(topic::draft.eq(true))
        .execute(connection)
        .await?;

    let removed_post_pks = post::table
        .select(post::pk)
        .filter(
            post::fk_topic
                .eq(hidden_topic.pk)
                .and(post::draft.eq(false))
                .and(post::deleted.eq(false)),
        )
        .load::<i64>(connection)
        .await?;

    if !removed_post_pks.is_empty() {
        diesel::update(post::table)
            .filter(post::pk.eq_any(&removed_post_pks))
            .set(post::draft.eq(true))
            .execute(connection)
            .await?;
        diesel::update(topic::table)
            .filter(topic::pk.eq(hidden_topic.pk))
            .set((
                topic::post_count.eq(topic::post_count - removed_post_pks.len() as i32),
                topic::fk_last_post.eq(None::<i64>),
            ))
            .execute(connection)
            .await?;
    }

    let group = perms::load_group(hidden_topic.fk_group, connection).await?;
    counters::deregister_topic(&group, hidden_topic.pk, &removed_post_pks, connection).await?;
    diesel::update(registered_user::table)
        .filter(registered_user::pk.eq(hidden_topic.fk_author))
        .set(registered_user::topic_count.eq(registered_user::topic_count - 1))
        .execute(connection)
        .await?;

    Ok(())
}

/// Reports a topic. Once the report count passes the configured threshold the topic is
/// withdrawn into draft state automatically, leaving the aggregates exactly as a withdraw
/// would.
pub async fn report_topic_handler(topic_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    perms::require_confirmed(&user).map_err(warp::reject::custom)?;
    perms::require_capability(&user, Capability::Member).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    perms::load_topic_secured(topic_pk, &mut connection, Some(&user)).await?;

    run_serializable_transaction(&mut connection, |connection| {
        async move {
            let reported_topic = diesel::update(topic::table)
                .filter(topic::pk.eq(topic_pk))
                .set(topic::report_count.eq(topic::report_count + 1))
                .get_result::<Topic>(connection)
                .await?;

            if counters::auto_hide_triggered(
                reported_topic.report_count,
                *crate::MAX_REPORT_COUNT,
                reported_topic.in_scope(),
            ) {
                hide_reported_topic(&reported_topic, connection).await?;
                notification::push_topic_auto_hidden_notification(&reported_topic, connection)
                    .await?;
            }

            Ok::<_, TransactionRuntimeError>(())
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply())
}

/// Clears the report counter of a topic, used by moderators after reviewing reports. A topic
/// that was hidden by the report threshold is republished in the process, re-entering the
/// aggregates under the recompute-newest rule. Its posts stay drafts until republished
/// individually.
pub async fn reset_topic_reports_handler(
    topic_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Moderate).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    let (loaded_topic, _) =
        perms::load_topic_secured(topic_pk, &mut connection, Some(&user)).await?;

    let updated_topic = run_serializable_transaction(&mut connection, |connection| {
        let loaded_topic = loaded_topic.clone();
        async move {
            let republish = counters::hidden_by_reports(
                loaded_topic.draft,
                loaded_topic.report_count,
                *crate::MAX_REPORT_COUNT,
            );

            let updated_topic = if republish {
                diesel::update(topic::table)
                    .filter(topic::pk.eq(topic_pk))
                    .set((topic::report_count.eq(0), topic::draft.eq(false)))
                    .get_result::<Topic>(connection)
                    .await?
            } else {
                diesel::update(topic::table)
                    .filter(topic::pk.eq(topic_pk))
                    .set(topic::report_count.eq(0))
                    .get_result::<Topic>(connection)
                    .await?
            };

            if republish && !loaded_topic.deleted {
                counters::register_restored_topic(loaded_topic.fk_group, connection).await?;
                diesel::update(registered_user::table)
                    .filter(registered_user::pk.eq(loaded_topic.fk_author))
                    .set(registered_user::topic_count.eq(registered_user::topic_count + 1))
                    .execute(connection)
                    .await?;
            }

            Ok::<_, TransactionRuntimeError>(updated_topic)
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply::json(&updated_topic))
}
