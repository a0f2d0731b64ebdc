use diesel::{ExpressionMethods, QueryDsl};
use diesel_async::{AsyncPgConnection, RunQueryDsl, scoped_futures::ScopedFutureExt};
use serde::Deserialize;
use warp::{Rejection, Reply};

use crate::{
    acquire_db_connection, counters,
    error::{Error, TransactionRuntimeError},
    model::{Group, Topic, User},
    perms,
    perms::Capability,
    run_serializable_transaction,
    schema::{forum_group, topic},
};

#[derive(Deserialize)]
pub struct MigrateGroupRequest {
    pub fk_target_group: i64,
}

/// Reloads a group row inside the migration transaction so the counters work on fresh counts
/// and pointers rather than the values read before the transaction began.
async fn reload_group(
    group_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<Group, TransactionRuntimeError> {
    forum_group::table
        .filter(forum_group::pk.eq(group_pk))
        .get_result::<Group>(connection)
        .await
        .map_err(|e| match e {
            diesel::NotFound => {
                TransactionRuntimeError::Rollback(Error::NotFoundError("group", group_pk))
            }
            e => e.into(),
        })
}

/// Merges all topics of the source group into the target group and leaves the source empty.
/// The target's counts become the sum of both groups and its pointers resolve to the
/// chronologically newer entry.
pub async fn migrate_group_handler(
    request: MigrateGroupRequest,
    source_group_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Administer).map_err(warp::reject::custom)?;
    if request.fk_target_group == source_group_pk {
        return Err(warp::reject::custom(Error::InvalidRequestInputError(
            String::from("cannot migrate a group into itself"),
        )));
    }

    let mut connection = acquire_db_connection().await?;
    let target_group_pk = request.fk_target_group;

    let merged_group = run_serializable_transaction(&mut connection, |connection| {
        async move {
            let source = reload_group(source_group_pk, connection).await?;
            let target = reload_group(target_group_pk, connection).await?;

            counters::merge_groups(&source, &target, connection).await?;

            let merged_group = reload_group(target_group_pk, connection).await?;
            Ok(merged_group)
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply::json(&merged_group))
}

#[derive(Deserialize)]
pub struct MoveTopicRequest {
    pub fk_target_group: i64,
}

/// Moves a single topic into another group, shifting the topic's contribution to the counts
/// and fixing up the pointers on both sides.
pub async fn move_topic_handler(
    request: MoveTopicRequest,
    topic_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Moderate).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    let target_group_pk = request.fk_target_group;

    let moved_topic = run_serializable_transaction(&mut connection, |connection| {
        async move {
            let moved_topic = topic::table
                .filter(topic::pk.eq(topic_pk))
                .get_result::<Topic>(connection)
                .await
                .map_err(|e| match e {
                    diesel::NotFound => {
                        TransactionRuntimeError::Rollback(Error::NotFoundError("topic", topic_pk))
                    }
                    e => e.into(),
                })?;

            if moved_topic.fk_group == target_group_pk {
                return Err(TransactionRuntimeError::Rollback(Error::StateConflictError(
                    String::from("topic is already in the target group"),
                )));
            }

            let source = reload_group(moved_topic.fk_group, connection).await?;
            let target = reload_group(target_group_pk, connection).await?;

            counters::move_topic_between_groups(&moved_topic, &source, &target, connection)
                .await?;

            let moved_topic = topic::table
                .filter(topic::pk.eq(topic_pk))
                .get_result::<Topic>(connection)
                .await?;
            Ok(moved_topic)
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply::json(&moved_topic))
}
