use chrono::offset::Utc;
use diesel::ExpressionMethods;
use diesel_async::{RunQueryDsl, scoped_futures::ScopedFutureExt};
use serde::Deserialize;
use validator::Validate;
use warp::{Rejection, Reply};

use crate::{
    acquire_db_connection, counters,
    error::Error,
    model::{NewTopic, Topic, User},
    perms, run_serializable_transaction,
    schema::{registered_user, topic},
    util::NOT_BLANK_REGEX,
};

#[derive(Deserialize, Validate)]
pub struct CreateTopicRequest {
    #[validate(length(min = 1, max = 120), regex(path = *NOT_BLANK_REGEX))]
    pub title: String,
    #[validate(length(min = 1))]
    pub body: String,
    /// Save as a draft instead of publishing immediately.
    #[serde(default)]
    pub draft: bool,
}

/// Creates a topic in the given group. Published topics are registered with the group's
/// aggregates in the same transaction; drafts stay invisible until published.
pub async fn create_topic_handler(
    request: CreateTopicRequest,
    group_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    request.validate().map_err(|e| {
        warp::reject::custom(Error::InvalidRequestInputError(format!(
            "Validation failed for CreateTopicRequest: {}",
            e
        )))
    })?;

    let mut connection = acquire_db_connection().await?;
    let group = perms::load_group(group_pk, &mut connection).await?;
    perms::check_group_writable(group.visibility, &user).map_err(warp::reject::custom)?;

    let current_utc = Utc::now();
    let new_topic = NewTopic {
        title: request.title,
        body: request.body,
        fk_group: group_pk,
        fk_author: user.pk,
        draft: request.draft,
        creation_timestamp: current_utc,
        edit_timestamp: current_utc,
    };

    let created_topic = run_serializable_transaction(&mut connection, |connection| {
        let new_topic = new_topic.clone();
        async move {
            let created_topic = diesel::insert_into(topic::table)
                .values(&new_topic)
                .get_result::<Topic>(connection)
                .await?;

            if !created_topic.draft {
                counters::register_published_topic(group_pk, created_topic.pk, connection).await?;
                diesel::update(registered_user::table)
                    .filter(registered_user::pk.eq(user.pk))
                    .set(registered_user::topic_count.eq(registered_user::topic_count + 1))
                    .execute(connection)
                    .await?;
            }

            Ok(created_topic)
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply::json(&created_topic))
}
