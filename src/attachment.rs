use chrono::offset::Utc;
use diesel::{ExpressionMethods, QueryDsl};
use diesel_async::RunQueryDsl;
use serde::Deserialize;
use validator::Validate;
use warp::{Rejection, Reply};

use crate::{
    acquire_db_connection,
    error::Error,
    model::{Attachment, NewAttachment, User},
    perms,
    schema::attachment,
    util::NOT_BLANK_REGEX,
};

#[derive(Deserialize, Validate)]
pub struct CreateAttachmentRequest {
    #[validate(length(min = 1, max = 255), regex(path = *NOT_BLANK_REGEX))]
    pub filename: String,
    #[validate(length(max = 255))]
    pub thumbnail_filename: Option<String>,
    pub fk_topic: Option<i64>,
    pub fk_post: Option<i64>,
}

/// Attaches an uploaded file to either a topic or a post, never both. Only the author of the
/// attached item, the group admin or a moderator may add attachments.
pub async fn create_attachment_handler(
    request: CreateAttachmentRequest,
    user: User,
) -> Result<impl Reply, Rejection> {
    request.validate().map_err(|e| {
        warp::reject::custom(Error::InvalidRequestInputError(format!(
            "Validation failed for CreateAttachmentRequest: {}",
            e
        )))
    })?;
    if request.fk_topic.is_some() == request.fk_post.is_some() {
        return Err(warp::reject::custom(Error::InvalidRequestInputError(
            String::from("exactly one of fk_topic and fk_post must be set"),
        )));
    }

    let mut connection = acquire_db_connection().await?;
    if let Some(topic_pk) = request.fk_topic {
        let (owning_topic, group) =
            perms::load_topic_secured(topic_pk, &mut connection, Some(&user)).await?;
        perms::require_author_or_admin(&user, owning_topic.fk_author, &group)
            .map_err(warp::reject::custom)?;
    } else if let Some(post_pk) = request.fk_post {
        let (owning_post, _, group) =
            perms::load_post_secured(post_pk, &mut connection, Some(&user)).await?;
        perms::require_author_or_admin(&user, owning_post.fk_author, &group)
            .map_err(warp::reject::custom)?;
    }

    let created_attachment = diesel::insert_into(attachment::table)
        .values(NewAttachment {
            filename: request.filename,
            thumbnail_filename: request.thumbnail_filename,
            fk_topic: request.fk_topic,
            fk_post: request.fk_post,
            creation_timestamp: Utc::now(),
        })
        .get_result::<Attachment>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&created_attachment))
}

pub async fn delete_attachment_handler(
    attachment_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let loaded_attachment = attachment::table
        .filter(attachment::pk.eq(attachment_pk))
        .get_result::<Attachment>(&mut connection)
        .await
        .map_err(|e| match e {
            diesel::NotFound => Error::NotFoundError("attachment", attachment_pk),
            e => e.into(),
        })?;

    if let Some(topic_pk) = loaded_attachment.fk_topic {
        let (owning_topic, group) =
            perms::load_topic_secured(topic_pk, &mut connection, Some(&user)).await?;
        perms::require_author_or_admin(&user, owning_topic.fk_author, &group)
            .map_err(warp::reject::custom)?;
    } else if let Some(post_pk) = loaded_attachment.fk_post {
        let (owning_post, _, group) =
            perms::load_post_secured(post_pk, &mut connection, Some(&user)).await?;
        perms::require_author_or_admin(&user, owning_post.fk_author, &group)
            .map_err(warp::reject::custom)?;
    }

    diesel::delete(attachment::table.filter(attachment::pk.eq(attachment_pk)))
        .execute(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply())
}
