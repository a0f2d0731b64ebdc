use diesel::{BoolExpressionMethods, ExpressionMethods, OptionalExtension, QueryDsl, dsl::count};
use diesel_async::{AsyncPgConnection, RunQueryDsl, scoped_futures::ScopedFutureExt};
use serde::{Deserialize, Serialize};
use validator::Validate;
use warp::{Rejection, Reply};

use crate::{
    acquire_db_connection, counters,
    error::{Error, TransactionRuntimeError},
    model::{Group, NewGroup, Topic, User, Visibility},
    notification, perms,
    perms::Capability,
    run_serializable_transaction,
    schema::{forum_group, post, registered_user, topic},
    util::{NOT_BLANK_REGEX, PageParameters, PaginatedResponse, lower},
};

pub mod migrate;

#[derive(Serialize)]
pub struct LastTopicSummary {
    pub pk: i64,
    pub title: String,
    pub creation_timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
pub struct LastPostSummary {
    pub pk: i64,
    pub fk_topic: i64,
    pub author_name: String,
    pub creation_timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
pub struct GroupListEntry {
    #[serde(flatten)]
    pub group: Group,
    pub last_topic: Option<LastTopicSummary>,
    pub last_post: Option<LastPostSummary>,
}

async fn load_last_topic_summary(
    group: &Group,
    connection: &mut AsyncPgConnection,
) -> Result<Option<LastTopicSummary>, Error> {
    let Some(last_topic_pk) = group.fk_last_topic else {
        return Ok(None);
    };
    Ok(topic::table
        .select((topic::pk, topic::title, topic::creation_timestamp))
        .filter(topic::pk.eq(last_topic_pk))
        .first::<(i64, String, chrono::DateTime<chrono::Utc>)>(connection)
        .await
        .optional()?
        .map(|(pk, title, creation_timestamp)| LastTopicSummary {
            pk,
            title,
            creation_timestamp,
        }))
}

async fn load_last_post_summary(
    group: &Group,
    connection: &mut AsyncPgConnection,
) -> Result<Option<LastPostSummary>, Error> {
    let Some(last_post_pk) = group.fk_last_post else {
        return Ok(None);
    };
    Ok(post::table
        .inner_join(registered_user::table)
        .select((
            post::pk,
            post::fk_topic,
            registered_user::user_name,
            post::creation_timestamp,
        ))
        .filter(post::pk.eq(last_post_pk))
        .first::<(i64, i64, String, chrono::DateTime<chrono::Utc>)>(connection)
        .await
        .optional()?
        .map(
            |(pk, fk_topic, author_name, creation_timestamp)| LastPostSummary {
                pk,
                fk_topic,
                author_name,
                creation_timestamp,
            },
        ))
}

/// Lists all groups the requesting (possibly anonymous) user may read, together with their
/// counts and the resolved "last topic" / "last post" pointers.
pub async fn get_groups_handler(user: Option<User>) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let groups = forum_group::table
        .order(forum_group::name.asc())
        .load::<Group>(&mut connection)
        .await
        .map_err(Error::from)?;

    let mut entries = Vec::new();
    for group in groups {
        if perms::check_group_readable(group.visibility, user.as_ref()).is_err() {
            continue;
        }
        let last_topic = load_last_topic_summary(&group, &mut connection).await?;
        let last_post = load_last_post_summary(&group, &mut connection).await?;
        entries.push(GroupListEntry {
            group,
            last_topic,
            last_post,
        });
    }

    Ok(warp::reply::json(&entries))
}

#[derive(Serialize)]
pub struct TopicListEntry {
    #[serde(flatten)]
    pub topic: Topic,
    pub author_name: String,
}

#[derive(Serialize)]
pub struct GroupDetailResponse {
    #[serde(flatten)]
    pub group: Group,
    pub admin_name: String,
    pub pinned_topics: Vec<TopicListEntry>,
    pub topics: PaginatedResponse<TopicListEntry>,
}

/// Loads a group with its pinned topics and a page of its published topics, newest first.
pub async fn get_group_handler(
    user: Option<User>,
    group_pk: i64,
    page: PageParameters,
) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let group = perms::load_group(group_pk, &mut connection).await?;
    perms::check_group_readable(group.visibility, user.as_ref()).map_err(warp::reject::custom)?;

    let admin_name = registered_user::table
        .select(registered_user::user_name)
        .filter(registered_user::pk.eq(group.fk_admin))
        .first::<String>(&mut connection)
        .await
        .map_err(Error::from)?;

    let pinned_topics = topic::table
        .inner_join(registered_user::table)
        .filter(
            topic::fk_group
                .eq(group_pk)
                .and(topic::pinned.eq(true))
                .and(topic::draft.eq(false))
                .and(topic::deleted.eq(false)),
        )
        .select((topic::all_columns, registered_user::user_name))
        .order(topic::pinned_timestamp.desc())
        .load::<(Topic, String)>(&mut connection)
        .await
        .map_err(Error::from)?
        .into_iter()
        .map(|(topic, author_name)| TopicListEntry { topic, author_name })
        .collect::<Vec<_>>();

    let limit = page.limit_or(*crate::TOPICS_PER_PAGE);
    let total_count = topic::table
        .select(count(topic::pk))
        .filter(
            topic::fk_group
                .eq(group_pk)
                .and(topic::draft.eq(false))
                .and(topic::deleted.eq(false)),
        )
        .get_result::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    let topics = topic::table
        .inner_join(registered_user::table)
        .filter(
            topic::fk_group
                .eq(group_pk)
                .and(topic::draft.eq(false))
                .and(topic::deleted.eq(false)),
        )
        .select((topic::all_columns, registered_user::user_name))
        .order(topic::creation_timestamp.desc())
        .limit(limit)
        .offset(page.offset(limit))
        .load::<(Topic, String)>(&mut connection)
        .await
        .map_err(Error::from)?
        .into_iter()
        .map(|(topic, author_name)| TopicListEntry { topic, author_name })
        .collect::<Vec<_>>();

    Ok(warp::reply::json(&GroupDetailResponse {
        group,
        admin_name,
        pinned_topics,
        topics: PaginatedResponse::new(topics, &page, limit, total_count),
    }))
}

#[derive(Deserialize, Validate)]
pub struct CreateGroupRequest {
    #[validate(length(min = 1, max = 64), regex(path = *NOT_BLANK_REGEX))]
    pub name: String,
    #[validate(length(max = 512))]
    pub description: Option<String>,
    pub visibility: Visibility,
    /// User managing the group, defaults to the creating administrator.
    pub fk_admin: Option<i64>,
}

pub async fn create_group_handler(
    request: CreateGroupRequest,
    user: User,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Administer).map_err(warp::reject::custom)?;
    request.validate().map_err(|e| {
        warp::reject::custom(Error::InvalidRequestInputError(format!(
            "Validation failed for CreateGroupRequest: {}",
            e
        )))
    })?;

    let mut connection = acquire_db_connection().await?;
    let fk_admin = request.fk_admin.unwrap_or(user.pk);
    let new_group = NewGroup {
        name: request.name,
        description: request.description,
        visibility: request.visibility,
        fk_admin,
        creation_timestamp: chrono::Utc::now(),
    };

    let created_group = run_serializable_transaction(&mut connection, |connection| {
        let new_group = new_group.clone();
        async move {
            let existing_count: i64 = forum_group::table
                .select(count(forum_group::pk))
                .filter(lower(forum_group::name).eq(&new_group.name.to_lowercase()))
                .get_result(connection)
                .await?;
            if existing_count != 0 {
                return Err(TransactionRuntimeError::Rollback(Error::GroupExistsError(
                    new_group.name.clone(),
                )));
            }

            let created_group = diesel::insert_into(forum_group::table)
                .values(&new_group)
                .get_result::<Group>(connection)
                .await?;

            if created_group.fk_admin != user.pk {
                notification::push_notification(
                    created_group.fk_admin,
                    format!("You were made admin of group '{}'", created_group.name),
                    Some(format!("/group/{}", created_group.pk)),
                    connection,
                )
                .await?;
            }

            Ok(created_group)
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply::json(&created_group))
}

#[derive(Clone, Deserialize, Validate)]
pub struct EditGroupRequest {
    #[validate(length(min = 1, max = 64), regex(path = *NOT_BLANK_REGEX))]
    pub name: Option<String>,
    #[validate(length(max = 512))]
    pub description: Option<String>,
    pub visibility: Option<Visibility>,
    pub fk_admin: Option<i64>,
}

pub async fn edit_group_handler(
    request: EditGroupRequest,
    group_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    request.validate().map_err(|e| {
        warp::reject::custom(Error::InvalidRequestInputError(format!(
            "Validation failed for EditGroupRequest: {}",
            e
        )))
    })?;

    let mut connection = acquire_db_connection().await?;
    let group = perms::load_group(group_pk, &mut connection).await?;
    if user.pk != group.fk_admin && !perms::has_capability(&user, Capability::Administer) {
        return Err(warp::reject::custom(Error::ForbiddenError));
    }
    // only administrators may reassign the managing user
    if request.fk_admin.is_some() {
        perms::require_capability(&user, Capability::Administer).map_err(warp::reject::custom)?;
    }

    let updated_group = run_serializable_transaction(&mut connection, |connection| {
        let request = request.clone();
        let group = group.clone();
        async move {
            if let Some(ref name) = request.name {
                let conflicting_count: i64 = forum_group::table
                    .select(count(forum_group::pk))
                    .filter(
                        lower(forum_group::name)
                            .eq(&name.to_lowercase())
                            .and(forum_group::pk.ne(group_pk)),
                    )
                    .get_result(connection)
                    .await?;
                if conflicting_count != 0 {
                    return Err(TransactionRuntimeError::Rollback(Error::GroupExistsError(
                        name.clone(),
                    )));
                }
            }

            let updated_group = diesel::update(forum_group::table)
                .filter(forum_group::pk.eq(group_pk))
                .set((
                    forum_group::name.eq(request.name.unwrap_or(group.name)),
                    forum_group::description
                        .eq(request.description.or(group.description)),
                    forum_group::visibility
                        .eq(request.visibility.unwrap_or(group.visibility)),
                    forum_group::fk_admin.eq(request.fk_admin.unwrap_or(group.fk_admin)),
                ))
                .get_result::<Group>(connection)
                .await?;

            Ok(updated_group)
        }
        .scope_boxed()
    })
    .await?;

    Ok(warp::reply::json(&updated_group))
}

/// Deletes a group permanently together with all its topics and posts.
pub async fn delete_group_handler(group_pk: i64, user: User) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Administer).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;

    let deleted = diesel::delete(forum_group::table.filter(forum_group::pk.eq(group_pk)))
        .execute(&mut connection)
        .await
        .map_err(Error::from)?;
    if deleted == 0 {
        return Err(warp::reject::custom(Error::NotFoundError(
            "group", group_pk,
        )));
    }

    Ok(warp::reply())
}

/// From-scratch repair of the group's counts and pointers, available to moderators when the
/// cached aggregates are suspected to have drifted.
pub async fn recompute_group_aggregates_handler(
    group_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Moderate).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    perms::load_group(group_pk, &mut connection).await?;

    run_serializable_transaction(&mut connection, |connection| {
        async move {
            counters::recompute_group_aggregates(group_pk, connection)
                .await
                .map_err(Into::into)
        }
        .scope_boxed()
    })
    .await?;

    let group = perms::load_group(group_pk, &mut connection).await?;
    Ok(warp::reply::json(&group))
}
