use diesel::{BoolExpressionMethods, ExpressionMethods, QueryDsl};
use diesel_async::{AsyncPgConnection, RunQueryDsl, scoped_futures::ScopedFutureExt};
use warp::{Rejection, Reply};

use crate::{
    acquire_db_connection, counters,
    error::{Error, TransactionRuntimeError},
    model::{Group, Post, Topic, User},
    perms,
    perms::Capability,
    run_serializable_transaction,
    schema::post,
};

/// Selects the rows leaving scope when the given post is hidden: the post itself plus its
/// published direct replies. Nested replies keep their state and remain counted.
fn removed_with_direct_replies(root_post_pk: i64, live_posts: &[(i64, Option<i64>)]) -> Vec<i64> {
    let mut removed = vec![root_post_pk];
    removed.extend(
        live_posts
            .iter()
            .filter(|(_, fk_replied_post)| *fk_replied_post == Some(root_post_pk))
            .map(|(pk, _)| *pk),
    );
    removed
}

/// Soft-deletes a post together with its published direct replies and removes the whole set
/// from the aggregates of the containing topic and group.
///
/// `hidden_post` is the state of the row before hiding.
pub(super) async fn hide_post(
    hidden_post: &Post,
    containing_topic: &Topic,
    group: &Group,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    let removed_post_pks = if hidden_post.in_scope() {
        let live_posts = post::table
            .select((post::pk, post::fk_replied_post))
            .filter(
                post::fk_topic
                    .eq(hidden_post.fk_topic)
                    .and(post::draft.eq(false))
                    .and(post::deleted.eq(false)),
            )
            .load::<(i64, Option<i64>)>(connection)
            .await?;
        removed_with_direct_replies(hidden_post.pk, &live_posts)
    } else {
        vec![hidden_post.pk]
    };

    diesel::update(post::table)
        .filter(post::pk.eq_any(&removed_post_pks))
        .set(post::deleted.eq(true))
        .execute(connection)
        .await?;

    if hidden_post.in_scope() && containing_topic.in_scope() {
        counters::deregister_posts(group, containing_topic, &removed_post_pks, connection).await?;
    }

    Ok(())
}

pub async fn delete_post_handler(post_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let (loaded_post, containing_topic, group) =
        perms::load_post_secured(post_pk, &mut connection, Some(&user)).await?;
    perms::require_author_or_admin(&user, loaded_post.fk_author, &group)
        .map_err(warp::reject::custom)?;

    if loaded_post.deleted {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("post is already deleted"),
        )));
    }

    run_serializable_transaction(&mut connection, |connection| {
        let loaded_post = loaded_post.clone();
        let containing_topic = containing_topic.clone();
        let group = group.clone();
        async move {
            hide_post(&loaded_post, &containing_topic, &group, connection).await?;
            Ok::<_, TransactionRuntimeError>(())
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply())
}

/// Restores a soft-deleted post. Restoring requires the containing topic to be in scope since
/// a post cannot re-enter the aggregates of a hidden topic. The pointers follow the
/// recompute-newest rule instead of promoting the restored post.
pub async fn restore_post_handler(post_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let (loaded_post, containing_topic, group) =
        perms::load_post_secured(post_pk, &mut connection, Some(&user)).await?;
    perms::require_author_or_admin(&user, loaded_post.fk_author, &group)
        .map_err(warp::reject::custom)?;

    if !loaded_post.deleted {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("post is not deleted"),
        )));
    }
    if !containing_topic.in_scope() {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("cannot restore a post of an unpublished topic"),
        )));
    }

    let restored_post = run_serializable_transaction(&mut connection, |connection| {
        let containing_topic = containing_topic.clone();
        async move {
            let restored_post = diesel::update(post::table)
                .filter(post::pk.eq(post_pk))
                .set(post::deleted.eq(false))
                .get_result::<Post>(connection)
                .await?;

            if !restored_post.draft {
                counters::register_restored_post(
                    containing_topic.fk_group,
                    containing_topic.pk,
                    connection,
                )
                .await?;
            }

            Ok::<_, TransactionRuntimeError>(restored_post)
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply::json(&restored_post))
}

/// Permanently removes a post. Replies keep their rows; their reply pointer is cleared by the
/// foreign key. Only moderators may purge.
pub async fn purge_post_handler(post_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Moderate).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    let (loaded_post, containing_topic, group) =
        perms::load_post_secured(post_pk, &mut connection, Some(&user)).await?;

    run_serializable_transaction(&mut connection, |connection| {
        let loaded_post = loaded_post.clone();
        let containing_topic = containing_topic.clone();
        let group = group.clone();
        async move {
            diesel::delete(post::table.filter(post::pk.eq(post_pk)))
                .execute(connection)
                .await?;

            if loaded_post.in_scope() && containing_topic.in_scope() {
                counters::deregister_posts(&group, &containing_topic, &[post_pk], connection)
                    .await?;
            }

            Ok::<_, TransactionRuntimeError>(())
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hide_cascades_to_direct_replies_only() {
        // reply chain 1 <- 2 <- 3 plus an unrelated post 4
        let live_posts = [(1, None), (2, Some(1)), (3, Some(2)), (4, None)];
        assert_eq!(removed_with_direct_replies(1, &live_posts), vec![1, 2]);
    }

    #[test]
    fn test_hide_without_replies_removes_single_post() {
        let live_posts = [(1, None), (2, None)];
        assert_eq!(removed_with_direct_replies(1, &live_posts), vec![1]);
    }
}
