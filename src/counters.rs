//! Maintenance of the denormalized aggregates kept on groups and topics: `topic_count`,
//! `post_count` and the `fk_last_topic` / `fk_last_post` pointers.
//!
//! The counters are caches of a query result, not ground truth. Every mutation that moves a
//! topic or post between the counted (published, not deleted) and uncounted (draft or deleted)
//! state calls into this module inside the same transaction, using atomic increment /
//! decrement expressions so that concurrent transactions cannot lose updates. The from-scratch
//! [`recompute_group_aggregates`] repair path recomputes everything from the authoritative
//! range scans and is run periodically by the scheduler.

use chrono::{DateTime, Utc};
use diesel::{BoolExpressionMethods, ExpressionMethods, OptionalExtension, QueryDsl};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::{
    error::Error,
    model::{Group, Topic},
    schema::{forum_group, post, topic},
};

/// Picks the surviving "last item" pointer when merging a source group into a target group.
/// The chronologically newer entry wins, a non-null entry wins over a null one and the target
/// keeps its pointer on a timestamp tie.
pub fn resolve_merged_pointer(
    target: Option<(i64, DateTime<Utc>)>,
    source: Option<(i64, DateTime<Utc>)>,
) -> Option<i64> {
    match (target, source) {
        (Some((target_pk, target_timestamp)), Some((source_pk, source_timestamp))) => {
            if source_timestamp > target_timestamp {
                Some(source_pk)
            } else {
                Some(target_pk)
            }
        }
        (Some((target_pk, _)), None) => Some(target_pk),
        (None, Some((source_pk, _))) => Some(source_pk),
        (None, None) => None,
    }
}

/// True if the pointer currently references one of the items that just left scope and thus
/// needs to be recomputed.
#[inline]
pub fn pointer_outdated(current: Option<i64>, removed_pks: &[i64]) -> bool {
    current.map(|pk| removed_pks.contains(&pk)).unwrap_or(false)
}

/// True once a report pushes the count strictly past the configured maximum while the item is
/// still in scope. Items that are already drafts or deleted are never hidden again.
#[inline]
pub fn auto_hide_triggered(report_count: i32, max_report_count: i32, in_scope: bool) -> bool {
    report_count > max_report_count && in_scope
}

/// True if an item's current draft state was caused by the report threshold rather than by its
/// author. Only such items are republished when a moderator resets the reports, an ordinary
/// draft keeps its state.
#[inline]
pub fn hidden_by_reports(draft: bool, report_count: i32, max_report_count: i32) -> bool {
    draft && report_count > max_report_count
}

async fn newest_topic_pk(
    group_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<Option<i64>, Error> {
    topic::table
        .select(topic::pk)
        .filter(
            topic::fk_group
                .eq(group_pk)
                .and(topic::draft.eq(false))
                .and(topic::deleted.eq(false)),
        )
        .order(topic::creation_timestamp.desc())
        .first::<i64>(connection)
        .await
        .optional()
        .map_err(Error::from)
}

async fn newest_post_pk_in_group(
    group_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<Option<i64>, Error> {
    post::table
        .inner_join(topic::table)
        .select(post::pk)
        .filter(
            topic::fk_group
                .eq(group_pk)
                .and(topic::draft.eq(false))
                .and(topic::deleted.eq(false))
                .and(post::draft.eq(false))
                .and(post::deleted.eq(false)),
        )
        .order(post::creation_timestamp.desc())
        .first::<i64>(connection)
        .await
        .optional()
        .map_err(Error::from)
}

async fn newest_post_pk_in_topic(
    topic_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<Option<i64>, Error> {
    post::table
        .select(post::pk)
        .filter(
            post::fk_topic
                .eq(topic_pk)
                .and(post::draft.eq(false))
                .and(post::deleted.eq(false)),
        )
        .order(post::creation_timestamp.desc())
        .first::<i64>(connection)
        .await
        .optional()
        .map_err(Error::from)
}

pub async fn recompute_group_last_topic(
    group_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<Option<i64>, Error> {
    let last_topic_pk = newest_topic_pk(group_pk, connection).await?;
    diesel::update(forum_group::table)
        .filter(forum_group::pk.eq(group_pk))
        .set(forum_group::fk_last_topic.eq(last_topic_pk))
        .execute(connection)
        .await?;
    Ok(last_topic_pk)
}

pub async fn recompute_group_last_post(
    group_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<Option<i64>, Error> {
    let last_post_pk = newest_post_pk_in_group(group_pk, connection).await?;
    diesel::update(forum_group::table)
        .filter(forum_group::pk.eq(group_pk))
        .set(forum_group::fk_last_post.eq(last_post_pk))
        .execute(connection)
        .await?;
    Ok(last_post_pk)
}

pub async fn recompute_topic_last_post(
    topic_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<Option<i64>, Error> {
    let last_post_pk = newest_post_pk_in_topic(topic_pk, connection).await?;
    diesel::update(topic::table)
        .filter(topic::pk.eq(topic_pk))
        .set(topic::fk_last_post.eq(last_post_pk))
        .execute(connection)
        .await?;
    Ok(last_post_pk)
}

/// Registers a freshly published topic with its group. The topic is newest by definition, so
/// the pointer is set unconditionally.
pub async fn register_published_topic(
    group_pk: i64,
    topic_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    diesel::update(forum_group::table)
        .filter(forum_group::pk.eq(group_pk))
        .set((
            forum_group::topic_count.eq(forum_group::topic_count + 1),
            forum_group::fk_last_topic.eq(Some(topic_pk)),
        ))
        .execute(connection)
        .await?;
    Ok(())
}

/// Registers a topic that re-entered scope without being newest (restore, report reset).
/// Increments the count and re-runs the recompute-newest rule instead of promoting the topic
/// unconditionally the way the original site did.
pub async fn register_restored_topic(
    group_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    diesel::update(forum_group::table)
        .filter(forum_group::pk.eq(group_pk))
        .set(forum_group::topic_count.eq(forum_group::topic_count + 1))
        .execute(connection)
        .await?;
    recompute_group_last_topic(group_pk, connection).await?;
    Ok(())
}

/// Removes a topic and the given set of cascade-hidden posts from the group's aggregates.
/// `group` is the row loaded earlier in the same transaction; its pointers decide whether a
/// recompute query is needed.
pub async fn deregister_topic(
    group: &Group,
    deregistered_topic_pk: i64,
    removed_post_pks: &[i64],
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    diesel::update(forum_group::table)
        .filter(forum_group::pk.eq(group.pk))
        .set((
            forum_group::topic_count.eq(forum_group::topic_count - 1),
            forum_group::post_count
                .eq(forum_group::post_count - removed_post_pks.len() as i32),
        ))
        .execute(connection)
        .await?;

    if group.fk_last_topic == Some(deregistered_topic_pk) {
        recompute_group_last_topic(group.pk, connection).await?;
    }
    if pointer_outdated(group.fk_last_post, removed_post_pks) {
        recompute_group_last_post(group.pk, connection).await?;
    }
    Ok(())
}

/// Registers a freshly published post with its topic and group, setting both pointers
/// unconditionally.
pub async fn register_published_post(
    group_pk: i64,
    topic_pk: i64,
    post_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    diesel::update(topic::table)
        .filter(topic::pk.eq(topic_pk))
        .set((
            topic::post_count.eq(topic::post_count + 1),
            topic::fk_last_post.eq(Some(post_pk)),
        ))
        .execute(connection)
        .await?;
    diesel::update(forum_group::table)
        .filter(forum_group::pk.eq(group_pk))
        .set((
            forum_group::post_count.eq(forum_group::post_count + 1),
            forum_group::fk_last_post.eq(Some(post_pk)),
        ))
        .execute(connection)
        .await?;
    Ok(())
}

/// Re-registers a restored post, recomputing the pointers instead of promoting the post.
pub async fn register_restored_post(
    group_pk: i64,
    topic_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    diesel::update(topic::table)
        .filter(topic::pk.eq(topic_pk))
        .set(topic::post_count.eq(topic::post_count + 1))
        .execute(connection)
        .await?;
    diesel::update(forum_group::table)
        .filter(forum_group::pk.eq(group_pk))
        .set(forum_group::post_count.eq(forum_group::post_count + 1))
        .execute(connection)
        .await?;
    recompute_topic_last_post(topic_pk, connection).await?;
    recompute_group_last_post(group_pk, connection).await?;
    Ok(())
}

/// Removes the given posts (a post plus its cascade-hidden replies) from the aggregates of
/// their topic and group.
pub async fn deregister_posts(
    group: &Group,
    containing_topic: &Topic,
    removed_post_pks: &[i64],
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    if removed_post_pks.is_empty() {
        return Ok(());
    }

    let removed = removed_post_pks.len() as i32;
    diesel::update(topic::table)
        .filter(topic::pk.eq(containing_topic.pk))
        .set(topic::post_count.eq(topic::post_count - removed))
        .execute(connection)
        .await?;
    diesel::update(forum_group::table)
        .filter(forum_group::pk.eq(group.pk))
        .set(forum_group::post_count.eq(forum_group::post_count - removed))
        .execute(connection)
        .await?;

    if pointer_outdated(containing_topic.fk_last_post, removed_post_pks) {
        recompute_topic_last_post(containing_topic.pk, connection).await?;
    }
    if pointer_outdated(group.fk_last_post, removed_post_pks) {
        recompute_group_last_post(group.pk, connection).await?;
    }
    Ok(())
}

async fn load_topic_timestamp(
    topic_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<Option<(i64, DateTime<Utc>)>, Error> {
    topic::table
        .select((topic::pk, topic::creation_timestamp))
        .filter(topic::pk.eq(topic_pk))
        .first::<(i64, DateTime<Utc>)>(connection)
        .await
        .optional()
        .map_err(Error::from)
}

async fn load_post_timestamp(
    post_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<Option<(i64, DateTime<Utc>)>, Error> {
    post::table
        .select((post::pk, post::creation_timestamp))
        .filter(post::pk.eq(post_pk))
        .first::<(i64, DateTime<Utc>)>(connection)
        .await
        .optional()
        .map_err(Error::from)
}

/// Moves a published topic from `source` to `target`, shifting its own count and the counts
/// of its published posts and fixing up the pointers on both sides. The target pointers only
/// change when the moved topic (or its last post) is newer than the target's current pointer,
/// compared by native timestamp.
pub async fn move_topic_between_groups(
    moved_topic: &Topic,
    source: &Group,
    target: &Group,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    diesel::update(topic::table)
        .filter(topic::pk.eq(moved_topic.pk))
        .set(topic::fk_group.eq(target.pk))
        .execute(connection)
        .await?;

    if !moved_topic.in_scope() {
        // drafts and deleted topics never contributed to either group's aggregates
        return Ok(());
    }

    diesel::update(forum_group::table)
        .filter(forum_group::pk.eq(source.pk))
        .set((
            forum_group::topic_count.eq(forum_group::topic_count - 1),
            forum_group::post_count.eq(forum_group::post_count - moved_topic.post_count),
        ))
        .execute(connection)
        .await?;
    diesel::update(forum_group::table)
        .filter(forum_group::pk.eq(target.pk))
        .set((
            forum_group::topic_count.eq(forum_group::topic_count + 1),
            forum_group::post_count.eq(forum_group::post_count + moved_topic.post_count),
        ))
        .execute(connection)
        .await?;

    if source.fk_last_topic == Some(moved_topic.pk) {
        recompute_group_last_topic(source.pk, connection).await?;
    }
    // the source group's last post may have lived in the moved topic
    if let Some(source_last_post_pk) = source.fk_last_post {
        let moved_with_topic = post::table
            .select(post::pk)
            .filter(
                post::pk
                    .eq(source_last_post_pk)
                    .and(post::fk_topic.eq(moved_topic.pk)),
            )
            .first::<i64>(connection)
            .await
            .optional()?;
        if moved_with_topic.is_some() {
            recompute_group_last_post(source.pk, connection).await?;
        }
    }

    let target_last_topic = match target.fk_last_topic {
        Some(pk) => load_topic_timestamp(pk, connection).await?,
        None => None,
    };
    let resolved_last_topic = resolve_merged_pointer(
        target_last_topic,
        Some((moved_topic.pk, moved_topic.creation_timestamp)),
    );
    let target_last_post = match target.fk_last_post {
        Some(pk) => load_post_timestamp(pk, connection).await?,
        None => None,
    };
    let moved_last_post = match moved_topic.fk_last_post {
        Some(pk) => load_post_timestamp(pk, connection).await?,
        None => None,
    };
    let resolved_last_post = resolve_merged_pointer(target_last_post, moved_last_post);

    diesel::update(forum_group::table)
        .filter(forum_group::pk.eq(target.pk))
        .set((
            forum_group::fk_last_topic.eq(resolved_last_topic),
            forum_group::fk_last_post.eq(resolved_last_post),
        ))
        .execute(connection)
        .await?;
    Ok(())
}

/// Merges every topic of `source` into `target`. Target counts become the sum of both groups,
/// the pointers resolve to the chronologically newer entry and the source group is left empty.
pub async fn merge_groups(
    source: &Group,
    target: &Group,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    diesel::update(topic::table)
        .filter(topic::fk_group.eq(source.pk))
        .set(topic::fk_group.eq(target.pk))
        .execute(connection)
        .await?;

    let target_last_topic = match target.fk_last_topic {
        Some(pk) => load_topic_timestamp(pk, connection).await?,
        None => None,
    };
    let source_last_topic = match source.fk_last_topic {
        Some(pk) => load_topic_timestamp(pk, connection).await?,
        None => None,
    };
    let target_last_post = match target.fk_last_post {
        Some(pk) => load_post_timestamp(pk, connection).await?,
        None => None,
    };
    let source_last_post = match source.fk_last_post {
        Some(pk) => load_post_timestamp(pk, connection).await?,
        None => None,
    };

    diesel::update(forum_group::table)
        .filter(forum_group::pk.eq(target.pk))
        .set((
            forum_group::topic_count.eq(forum_group::topic_count + source.topic_count),
            forum_group::post_count.eq(forum_group::post_count + source.post_count),
            forum_group::fk_last_topic
                .eq(resolve_merged_pointer(target_last_topic, source_last_topic)),
            forum_group::fk_last_post
                .eq(resolve_merged_pointer(target_last_post, source_last_post)),
        ))
        .execute(connection)
        .await?;

    diesel::update(forum_group::table)
        .filter(forum_group::pk.eq(source.pk))
        .set((
            forum_group::topic_count.eq(0),
            forum_group::post_count.eq(0),
            forum_group::fk_last_topic.eq(None::<i64>),
            forum_group::fk_last_post.eq(None::<i64>),
        ))
        .execute(connection)
        .await?;
    Ok(())
}

/// From-scratch repair: recomputes the aggregates of every topic in the group and then the
/// group's own counts and pointers from the authoritative range scans.
pub async fn recompute_group_aggregates(
    group_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    let topic_pks = topic::table
        .select(topic::pk)
        .filter(topic::fk_group.eq(group_pk))
        .load::<i64>(connection)
        .await?;

    for topic_pk in topic_pks {
        let live_post_count = post::table
            .filter(
                post::fk_topic
                    .eq(topic_pk)
                    .and(post::draft.eq(false))
                    .and(post::deleted.eq(false)),
            )
            .count()
            .get_result::<i64>(connection)
            .await?;
        diesel::update(topic::table)
            .filter(topic::pk.eq(topic_pk))
            .set(topic::post_count.eq(live_post_count as i32))
            .execute(connection)
            .await?;
        recompute_topic_last_post(topic_pk, connection).await?;
    }

    let live_topic_count = topic::table
        .filter(
            topic::fk_group
                .eq(group_pk)
                .and(topic::draft.eq(false))
                .and(topic::deleted.eq(false)),
        )
        .count()
        .get_result::<i64>(connection)
        .await?;
    let live_post_count = post::table
        .inner_join(topic::table)
        .filter(
            topic::fk_group
                .eq(group_pk)
                .and(topic::draft.eq(false))
                .and(topic::deleted.eq(false))
                .and(post::draft.eq(false))
                .and(post::deleted.eq(false)),
        )
        .count()
        .get_result::<i64>(connection)
        .await?;

    diesel::update(forum_group::table)
        .filter(forum_group::pk.eq(group_pk))
        .set((
            forum_group::topic_count.eq(live_topic_count as i32),
            forum_group::post_count.eq(live_post_count as i32),
        ))
        .execute(connection)
        .await?;
    recompute_group_last_topic(group_pk, connection).await?;
    recompute_group_last_post(group_pk, connection).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_resolve_merged_pointer_prefers_newer() {
        assert_eq!(
            resolve_merged_pointer(Some((1, ts(100))), Some((2, ts(200)))),
            Some(2)
        );
        assert_eq!(
            resolve_merged_pointer(Some((1, ts(300))), Some((2, ts(200)))),
            Some(1)
        );
    }

    #[test]
    fn test_resolve_merged_pointer_keeps_target_on_tie() {
        assert_eq!(
            resolve_merged_pointer(Some((1, ts(100))), Some((2, ts(100)))),
            Some(1)
        );
    }

    #[test]
    fn test_resolve_merged_pointer_null_handling() {
        assert_eq!(resolve_merged_pointer(None, Some((2, ts(100)))), Some(2));
        assert_eq!(resolve_merged_pointer(Some((1, ts(100))), None), Some(1));
        assert_eq!(resolve_merged_pointer(None, None), None);
    }

    #[test]
    fn test_pointer_outdated() {
        assert!(pointer_outdated(Some(3), &[1, 2, 3]));
        assert!(!pointer_outdated(Some(4), &[1, 2, 3]));
        assert!(!pointer_outdated(None, &[1, 2, 3]));
        assert!(!pointer_outdated(Some(1), &[]));
    }

    #[test]
    fn test_auto_hide_threshold_is_exclusive() {
        assert!(!auto_hide_triggered(5, 5, true));
        assert!(auto_hide_triggered(6, 5, true));
    }

    #[test]
    fn test_auto_hide_skips_items_out_of_scope() {
        assert!(!auto_hide_triggered(6, 5, false));
    }

    #[test]
    fn test_reset_only_republishes_auto_hidden_items() {
        assert!(hidden_by_reports(true, 6, 5));
        // an author's own draft that collected a few reports stays a draft
        assert!(!hidden_by_reports(true, 3, 5));
        // a visible item just loses its report count
        assert!(!hidden_by_reports(false, 6, 5));
    }
}
