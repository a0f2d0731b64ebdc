use diesel::{ExpressionMethods, QueryDsl, dsl::count};
use diesel_async::RunQueryDsl;
use serde::Serialize;
use warp::{Rejection, Reply};

use crate::{
    acquire_db_connection,
    error::Error,
    model::{Attachment, Post, User},
    perms,
    perms::Capability,
    schema::{attachment, post, registered_user, topic},
    util::{PageParameters, PaginatedResponse},
};

pub mod create;
pub mod delete;
pub mod update;

#[derive(Serialize)]
pub struct PostDetailResponse {
    #[serde(flatten)]
    pub post: Post,
    pub author_name: String,
    pub topic_title: String,
    pub attachments: Vec<Attachment>,
}

pub async fn get_post_handler(
    user: Option<User>,
    post_pk: i64,
) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let (loaded_post, containing_topic, _) =
        perms::load_post_secured(post_pk, &mut connection, user.as_ref()).await?;

    let author_name = registered_user::table
        .select(registered_user::user_name)
        .filter(registered_user::pk.eq(loaded_post.fk_author))
        .first::<String>(&mut connection)
        .await
        .map_err(Error::from)?;

    let attachments = attachment::table
        .filter(attachment::fk_post.eq(post_pk))
        .load::<Attachment>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&PostDetailResponse {
        post: loaded_post,
        author_name,
        topic_title: containing_topic.title,
        attachments,
    }))
}

#[derive(Serialize)]
pub struct ModerationPostEntry {
    #[serde(flatten)]
    pub post: Post,
    pub author_name: String,
    pub topic_title: String,
}

/// Lists reported posts for the moderation dashboard, most reported first.
pub async fn get_reported_posts_handler(
    user: User,
    page: PageParameters,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Moderate).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    let limit = page.limit_or(*crate::DELETED_PER_PAGE);

    let total_count = post::table
        .select(count(post::pk))
        .filter(post::report_count.gt(0))
        .get_result::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    let posts = post::table
        .inner_join(registered_user::table)
        .inner_join(topic::table)
        .filter(post::report_count.gt(0))
        .select((post::all_columns, registered_user::user_name, topic::title))
        .order((post::report_count.desc(), post::creation_timestamp.desc()))
        .limit(limit)
        .offset(page.offset(limit))
        .load::<(Post, String, String)>(&mut connection)
        .await
        .map_err(Error::from)?
        .into_iter()
        .map(|(post, author_name, topic_title)| ModerationPostEntry {
            post,
            author_name,
            topic_title,
        })
        .collect::<Vec<_>>();

    Ok(warp::reply::json(&PaginatedResponse::new(
        posts,
        &page,
        limit,
        total_count,
    )))
}

/// Lists soft-deleted posts for the moderation dashboard.
pub async fn get_deleted_posts_handler(
    user: User,
    page: PageParameters,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Moderate).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    let limit = page.limit_or(*crate::DELETED_PER_PAGE);

    let total_count = post::table
        .select(count(post::pk))
        .filter(post::deleted.eq(true))
        .get_result::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    let posts = post::table
        .inner_join(registered_user::table)
        .inner_join(topic::table)
        .filter(post::deleted.eq(true))
        .select((post::all_columns, registered_user::user_name, topic::title))
        .order(post::creation_timestamp.desc())
        .limit(limit)
        .offset(page.offset(limit))
        .load::<(Post, String, String)>(&mut connection)
        .await
        .map_err(Error::from)?
        .into_iter()
        .map(|(post, author_name, topic_title)| ModerationPostEntry {
            post,
            author_name,
            topic_title,
        })
        .collect::<Vec<_>>();

    Ok(warp::reply::json(&PaginatedResponse::new(
        posts,
        &page,
        limit,
        total_count,
    )))
}
