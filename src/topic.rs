use diesel::{BoolExpressionMethods, ExpressionMethods, QueryDsl, dsl::count};
use diesel_async::{RunQueryDsl, scoped_futures::ScopedFutureExt};
use serde::Serialize;
use warp::{Rejection, Reply};

use crate::{
    acquire_db_connection,
    error::Error,
    model::{Attachment, Post, Topic, TopicCollection, TopicSubscription, TopicView, User},
    notification,
    perms::{self, Capability},
    run_retryable_transaction,
    schema::{
        attachment, forum_group, post, registered_user, topic, topic_collection,
        topic_subscription, topic_view,
    },
    util::{PageParameters, PaginatedResponse},
};

pub mod create;
pub mod delete;
pub mod update;

#[derive(Serialize)]
pub struct PostEntry {
    #[serde(flatten)]
    pub post: Post,
    pub author_name: String,
}

#[derive(Serialize)]
pub struct TopicDetailResponse {
    #[serde(flatten)]
    pub topic: Topic,
    pub author_name: String,
    pub group_name: String,
    pub posts: PaginatedResponse<PostEntry>,
    pub attachments: Vec<Attachment>,
    pub collected: bool,
    pub subscribed: bool,
}

/// Loads a topic with its published posts. Each view increments the topic's view counter and,
/// for logged in users, marks the topic as viewed for the unread marker on subscriptions.
pub async fn get_topic_handler(
    user: Option<User>,
    topic_pk: i64,
    page: PageParameters,
) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let (loaded_topic, group) =
        perms::load_topic_secured(topic_pk, &mut connection, user.as_ref()).await?;

    let author_name = registered_user::table
        .select(registered_user::user_name)
        .filter(registered_user::pk.eq(loaded_topic.fk_author))
        .first::<String>(&mut connection)
        .await
        .map_err(Error::from)?;

    let limit = page.limit_or(*crate::POSTS_PER_PAGE);
    let total_count = post::table
        .select(count(post::pk))
        .filter(
            post::fk_topic
                .eq(topic_pk)
                .and(post::draft.eq(false))
                .and(post::deleted.eq(false)),
        )
        .get_result::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    let posts = post::table
        .inner_join(registered_user::table)
        .filter(
            post::fk_topic
                .eq(topic_pk)
                .and(post::draft.eq(false))
                .and(post::deleted.eq(false)),
        )
        .select((post::all_columns, registered_user::user_name))
        .order(post::creation_timestamp.asc())
        .limit(limit)
        .offset(page.offset(limit))
        .load::<(Post, String)>(&mut connection)
        .await
        .map_err(Error::from)?
        .into_iter()
        .map(|(post, author_name)| PostEntry { post, author_name })
        .collect::<Vec<_>>();

    let attachments = attachment::table
        .filter(attachment::fk_topic.eq(topic_pk))
        .load::<Attachment>(&mut connection)
        .await
        .map_err(Error::from)?;

    diesel::update(topic::table)
        .filter(topic::pk.eq(topic_pk))
        .set(topic::view_count.eq(topic::view_count + 1))
        .execute(&mut connection)
        .await
        .map_err(Error::from)?;

    let (collected, subscribed) = match user {
        Some(ref user) => {
            diesel::insert_into(topic_view::table)
                .values(&TopicView {
                    fk_user: user.pk,
                    fk_topic: topic_pk,
                })
                .on_conflict_do_nothing()
                .execute(&mut connection)
                .await
                .map_err(Error::from)?;

            let collected = topic_collection::table
                .select(count(topic_collection::fk_topic))
                .filter(
                    topic_collection::fk_user
                        .eq(user.pk)
                        .and(topic_collection::fk_topic.eq(topic_pk)),
                )
                .get_result::<i64>(&mut connection)
                .await
                .map_err(Error::from)?
                > 0;
            let subscribed = topic_subscription::table
                .select(count(topic_subscription::fk_topic))
                .filter(
                    topic_subscription::fk_user
                        .eq(user.pk)
                        .and(topic_subscription::fk_topic.eq(topic_pk)),
                )
                .get_result::<i64>(&mut connection)
                .await
                .map_err(Error::from)?
                > 0;
            (collected, subscribed)
        }
        None => (false, false),
    };

    Ok(warp::reply::json(&TopicDetailResponse {
        topic: loaded_topic,
        author_name,
        group_name: group.name,
        posts: PaginatedResponse::new(posts, &page, limit, total_count),
        attachments,
        collected,
        subscribed,
    }))
}

pub async fn collect_topic_handler(topic_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Collect).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    let (loaded_topic, _) =
        perms::load_topic_secured(topic_pk, &mut connection, Some(&user)).await?;

    run_retryable_transaction(&mut connection, |connection| {
        let loaded_topic = loaded_topic.clone();
        let user = user.clone();
        async move {
            let inserted = diesel::insert_into(topic_collection::table)
                .values(&TopicCollection {
                    fk_user: user.pk,
                    fk_topic: topic_pk,
                    creation_timestamp: chrono::Utc::now(),
                })
                .on_conflict_do_nothing()
                .execute(connection)
                .await?;

            if inserted > 0 {
                notification::push_collect_notification(&user, &loaded_topic, connection).await?;
            }

            Ok(())
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply())
}

pub async fn uncollect_topic_handler(topic_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    diesel::delete(
        topic_collection::table.filter(
            topic_collection::fk_user
                .eq(user.pk)
                .and(topic_collection::fk_topic.eq(topic_pk)),
        ),
    )
    .execute(&mut connection)
    .await
    .map_err(Error::from)?;

    Ok(warp::reply())
}

pub async fn subscribe_topic_handler(topic_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Follow).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    perms::load_topic_secured(topic_pk, &mut connection, Some(&user)).await?;

    diesel::insert_into(topic_subscription::table)
        .values(&TopicSubscription {
            fk_user: user.pk,
            fk_topic: topic_pk,
            creation_timestamp: chrono::Utc::now(),
        })
        .on_conflict_do_nothing()
        .execute(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply())
}

pub async fn unsubscribe_topic_handler(topic_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    diesel::delete(
        topic_subscription::table.filter(
            topic_subscription::fk_user
                .eq(user.pk)
                .and(topic_subscription::fk_topic.eq(topic_pk)),
        ),
    )
    .execute(&mut connection)
    .await
    .map_err(Error::from)?;

    Ok(warp::reply())
}

#[derive(Serialize)]
pub struct ModerationTopicEntry {
    #[serde(flatten)]
    pub topic: Topic,
    pub author_name: String,
    pub group_name: String,
}

/// Lists reported topics for the moderation dashboard, most reported first.
pub async fn get_reported_topics_handler(
    user: User,
    page: PageParameters,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Moderate).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    let limit = page.limit_or(*crate::DELETED_PER_PAGE);

    let total_count = topic::table
        .select(count(topic::pk))
        .filter(topic::report_count.gt(0))
        .get_result::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    let topics = topic::table
        .inner_join(registered_user::table)
        .inner_join(forum_group::table)
        .filter(topic::report_count.gt(0))
        .select((
            topic::all_columns,
            registered_user::user_name,
            forum_group::name,
        ))
        .order((topic::report_count.desc(), topic::creation_timestamp.desc()))
        .limit(limit)
        .offset(page.offset(limit))
        .load::<(Topic, String, String)>(&mut connection)
        .await
        .map_err(Error::from)?
        .into_iter()
        .map(|(topic, author_name, group_name)| ModerationTopicEntry {
            topic,
            author_name,
            group_name,
        })
        .collect::<Vec<_>>();

    Ok(warp::reply::json(&PaginatedResponse::new(
        topics,
        &page,
        limit,
        total_count,
    )))
}

/// Lists soft-deleted topics for the moderation dashboard.
pub async fn get_deleted_topics_handler(
    user: User,
    page: PageParameters,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Moderate).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    let limit = page.limit_or(*crate::DELETED_PER_PAGE);

    let total_count = topic::table
        .select(count(topic::pk))
        .filter(topic::deleted.eq(true))
        .get_result::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    let topics = topic::table
        .inner_join(registered_user::table)
        .inner_join(forum_group::table)
        .filter(topic::deleted.eq(true))
        .select((
            topic::all_columns,
            registered_user::user_name,
            forum_group::name,
        ))
        .order(topic::creation_timestamp.desc())
        .limit(limit)
        .offset(page.offset(limit))
        .load::<(Topic, String, String)>(&mut connection)
        .await
        .map_err(Error::from)?
        .into_iter()
        .map(|(topic, author_name, group_name)| ModerationTopicEntry {
            topic,
            author_name,
            group_name,
        })
        .collect::<Vec<_>>();

    Ok(warp::reply::json(&PaginatedResponse::new(
        topics,
        &page,
        limit,
        total_count,
    )))
}
