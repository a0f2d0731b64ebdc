use diesel::{BoolExpressionMethods, ExpressionMethods, QueryDsl, dsl::count};
use diesel_async::{AsyncPgConnection, RunQueryDsl, scoped_futures::ScopedFutureExt};
use warp::{Rejection, Reply};

use crate::{
    acquire_db_connection, counters,
    error::Error,
    model::{Topic, User},
    perms,
    perms::Capability,
    run_serializable_transaction,
    schema::{post, registered_user, topic},
};

/// Soft-deletes a topic, cascading onto its published posts. The posts are flagged deleted
/// alongside the topic, so restoring the topic later does not implicitly restore them.
///
/// `hidden_topic` is the state of the row before hiding; it decides whether the topic (and
/// which of its posts) must leave the group's aggregates.
pub(super) async fn hide_topic(
    hidden_topic: &Topic,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    diesel::update(topic::table)
        .filter(topic::pk.eq(hidden_topic.pk))
        .set(topic::deleted.eq(true))
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
            .set(post::deleted.eq(true))
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

    if hidden_topic.in_scope() {
        let group = perms::load_group(hidden_topic.fk_group, connection).await?;
        counters::deregister_topic(&group, hidden_topic.pk, &removed_post_pks, connection).await?;
        diesel::update(registered_user::table)
            .filter(registered_user::pk.eq(hidden_topic.fk_author))
            .set(registered_user::topic_count.eq(registered_user::topic_count - 1))
            .execute(connection)
            .await?;
    }

    Ok(())
}

pub async fn delete_topic_handler(topic_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let (loaded_topic, group) =
        perms::load_topic_secured(topic_pk, &mut connection, Some(&user)).await?;
    perms::require_author_or_admin(&user, loaded_topic.fk_author, &group)
        .map_err(warp::reject::custom)?;

    if loaded_topic.deleted {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("topic is already deleted"),
        )));
    }

    run_serializable_transaction(&mut connection, |connection| {
        let loaded_topic = loaded_topic.clone();
        async move {
            hide_topic(&loaded_topic, connection).await?;
            Ok(())
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply())
}

/// Restores a soft-deleted topic. The topic's own post aggregates are recomputed from scratch
/// since its posts remain deleted until restored individually, and the group pointer follows
/// the recompute-newest rule rather than promoting the restored topic.
pub async fn restore_topic_handler(topic_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let (loaded_topic, group) =
        perms::load_topic_secured(topic_pk, &mut connection, Some(&user)).await?;
    perms::require_author_or_admin(&user, loaded_topic.fk_author, &group)
        .map_err(warp::reject::custom)?;

    if !loaded_topic.deleted {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("topic is not deleted"),
        )));
    }

    let restored_topic = run_serializable_transaction(&mut connection, |connection| {
        let loaded_topic = loaded_topic.clone();
        async move {
            let live_post_count = post::table
                .select(count(post::pk))
                .filter(
                    post::fk_topic
                        .eq(topic_pk)
                        .and(post::draft.eq(false))
                        .and(post::deleted.eq(false)),
                )
                .get_result::<i64>(connection)
                .await?;

            let restored_topic = diesel::update(topic::table)
                .filter(topic::pk.eq(topic_pk))
                .set((
                    topic::deleted.eq(false),
                    topic::post_count.eq(live_post_count as i32),
                ))
                .get_result::<Topic>(connection)
                .await?;
            counters::recompute_topic_last_post(topic_pk, connection).await?;

            if !restored_topic.draft {
                counters::register_restored_topic(loaded_topic.fk_group, connection).await?;
                diesel::update(registered_user::table)
                    .filter(registered_user::pk.eq(loaded_topic.fk_author))
                    .set(registered_user::topic_count.eq(registered_user::topic_count + 1))
                    .execute(connection)
                    .await?;
            }

            Ok(restored_topic)
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply::json(&restored_topic))
}

/// Permanently removes a topic and everything hanging off it. Only moderators may purge;
/// regular cleanup goes through the soft delete.
pub async fn purge_topic_handler(topic_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Moderate).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    let (loaded_topic, group) =
        perms::load_topic_secured(topic_pk, &mut connection, Some(&user)).await?;

    run_serializable_transaction(&mut connection, |connection| {
        let loaded_topic = loaded_topic.clone();
        let group = group.clone();
        async move {
            let removed_post_pks = post::table
                .select(post::pk)
                .filter(
                    post::fk_topic
                        .eq(topic_pk)
                        .and(post::draft.eq(false))
                        .and(post::deleted.eq(false)),
                )
                .load::<i64>(connection)
                .await?;

            // posts, attachments, collections, subscriptions and views cascade with the row
            diesel::delete(topic::table.filter(topic::pk.eq(topic_pk)))
                .execute(connection)
                .await?;

            if loaded_topic.in_scope() {
                counters::deregister_topic(&group, topic_pk, &removed_post_pks, connection)
                    .await?;
                diesel::update(registered_user::table)
                    .filter(registered_user::pk.eq(loaded_topic.fk_author))
                    .set(registered_user::topic_count.eq(registered_user::topic_count - 1))
                    .execute(connection)
                    .await?;
            }

            Ok(())
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply())
}
