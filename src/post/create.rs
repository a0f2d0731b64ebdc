use chrono::offset::Utc;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl};
use diesel_async::{RunQueryDsl, scoped_futures::ScopedFutureExt};
use serde::Deserialize;
use validator::Validate;
use warp::{Rejection, Reply};

use crate::{
    acquire_db_connection, counters,
    error::{Error, TransactionRuntimeError},
    model::{NewPost, Post, User},
    notification, perms,
    perms::Capability,
    run_serializable_transaction,
    schema::post,
    util::NOT_BLANK_REGEX,
};

#[derive(Deserialize, Validate)]
pub struct CreatePostRequest {
    #[validate(length(min = 1, max = 120), regex(path = *NOT_BLANK_REGEX))]
    pub title: String,
    #[validate(length(min = 1))]
    pub body: String,
    /// Post this reply in response to another post of the same topic.
    pub fk_replied_post: Option<i64>,
    /// Save as a draft instead of publishing immediately.
    #[serde(default)]
    pub draft: bool,
}

/// Creates a post in the given topic. Published posts are registered with the aggregates of
/// their topic and group in the same transaction and fan out reply and subscription
/// notifications.
pub async fn create_post_handler(
    request: CreatePostRequest,
    topic_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    request.validate().map_err(|e| {
        warp::reject::custom(Error::InvalidRequestInputError(format!(
            "Validation failed for CreatePostRequest: {}",
            e
        )))
    })?;

    let mut connection = acquire_db_connection().await?;
    let (containing_topic, group) =
        perms::load_topic_secured(topic_pk, &mut connection, Some(&user)).await?;
    perms::check_group_writable(group.visibility, &user).map_err(warp::reject::custom)?;
    perms::require_capability(&user, Capability::Comment).map_err(warp::reject::custom)?;

    if !containing_topic.in_scope() {
        return Err(warp::reject::custom(Error::StateConflictError(
            String::from("cannot post in an unpublished topic"),
        )));
    }

    let replied_post_author = match request.fk_replied_post {
        Some(replied_post_pk) => {
            let replied_post = post::table
                .filter(post::pk.eq(replied_post_pk))
                .get_result::<Post>(&mut connection)
                .await
                .optional()
                .map_err(Error::from)?
                .ok_or(Error::NotFoundError("post", replied_post_pk))?;
            if replied_post.fk_topic != topic_pk || !replied_post.in_scope() {
                return Err(warp::reject::custom(Error::StateConflictError(
                    String::from("replied post is not a published post of this topic"),
                )));
            }
            Some(replied_post.fk_author)
        }
        None => None,
    };

    let current_utc = Utc::now();
    let new_post = NewPost {
        title: request.title,
        body: request.body,
        fk_topic: topic_pk,
        fk_author: user.pk,
        fk_replied_post: request.fk_replied_post,
        draft: request.draft,
        creation_timestamp: current_utc,
        edit_timestamp: current_utc,
    };

    let created_post = run_serializable_transaction(&mut connection, |connection| {
        let new_post = new_post.clone();
        let containing_topic = containing_topic.clone();
        let user = user.clone();
        async move {
            let created_post = diesel::insert_into(post::table)
                .values(&new_post)
                .get_result::<Post>(connection)
                .await?;

            if !created_post.draft {
                counters::register_published_post(
                    containing_topic.fk_group,
                    topic_pk,
                    created_post.pk,
                    connection,
                )
                .await?;

                if let Some(replied_post_author_pk) = replied_post_author {
                    notification::push_reply_notification(
                        &user,
                        replied_post_author_pk,
                        &containing_topic,
                        connection,
                    )
                    .await?;
                }
                notification::push_subscription_notifications(
                    &user,
                    &containing_topic,
                    connection,
                )
                .await?;
            }

            Ok::<_, TransactionRuntimeError>(created_post)
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply::json(&created_post))
}
