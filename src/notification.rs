use chrono::offset::Utc;
use diesel::{BoolExpressionMethods, ExpressionMethods, QueryDsl, dsl::count};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use warp::{Rejection, Reply};

use crate::{
    acquire_db_connection,
    error::Error,
    model::{NewNotification, Notification, Post, Role, Topic, User},
    schema::{notification, registered_user, topic_subscription},
    util::{PageParameters, PaginatedResponse},
};

/// Persists a notification for the given receiver. Notifications are plain messages with an
/// optional link to the entity they are about.
pub async fn push_notification(
    fk_receiver: i64,
    message: String,
    link: Option<String>,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    diesel::insert_into(notification::table)
        .values(&NewNotification {
            message,
            link,
            read: false,
            fk_receiver,
            creation_timestamp: Utc::now(),
        })
        .execute(connection)
        .await?;
    Ok(())
}

/// Notifies all administrators that a new account awaits confirmation.
pub async fn push_registration_notifications(
    created_user: &User,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    let admin_pks = registered_user::table
        .select(registered_user::pk)
        .filter(registered_user::user_role.eq(Role::Administrator))
        .load::<i64>(connection)
        .await?;

    for admin_pk in admin_pks {
        push_notification(
            admin_pk,
            format!(
                "New user '{}' registered and awaits confirmation",
                created_user.user_name
            ),
            Some(String::from("/moderation/users")),
            connection,
        )
        .await?;
    }
    Ok(())
}

/// Notifies the author of the replied post, honoring their reply notification setting and
/// skipping self-replies.
pub async fn push_reply_notification(
    replying_user: &User,
    replied_post_author_pk: i64,
    containing_topic: &Topic,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    if replied_post_author_pk == replying_user.pk {
        return Ok(());
    }

    let wants_notification = registered_user::table
        .select(registered_user::receive_reply_notification)
        .filter(registered_user::pk.eq(replied_post_author_pk))
        .first::<bool>(connection)
        .await?;
    if !wants_notification {
        return Ok(());
    }

    push_notification(
        replied_post_author_pk,
        format!(
            "{} replied to your post in topic '{}'",
            replying_user.user_name, containing_topic.title
        ),
        Some(format!("/topic/{}", containing_topic.pk)),
        connection,
    )
    .await
}

/// Notifies the topic author that their topic was added to a collection.
pub async fn push_collect_notification(
    collecting_user: &User,
    collected_topic: &Topic,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    if collected_topic.fk_author == collecting_user.pk {
        return Ok(());
    }

    let wants_notification = registered_user::table
        .select(registered_user::receive_collect_notification)
        .filter(registered_user::pk.eq(collected_topic.fk_author))
        .first::<bool>(connection)
        .await?;
    if !wants_notification {
        return Ok(());
    }

    push_notification(
        collected_topic.fk_author,
        format!(
            "{} collected your topic '{}'",
            collecting_user.user_name, collected_topic.title
        ),
        Some(format!("/topic/{}", collected_topic.pk)),
        connection,
    )
    .await
}

/// Notifies every subscriber of the topic about a freshly published post, excluding the
/// posting user and subscribers that disabled subscription notifications.
pub async fn push_subscription_notifications(
    posting_user: &User,
    containing_topic: &Topic,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    let subscriber_pks = topic_subscription::table
        .inner_join(registered_user::table)
        .select(topic_subscription::fk_user)
        .filter(
            topic_subscription::fk_topic
                .eq(containing_topic.pk)
                .and(topic_subscription::fk_user.ne(posting_user.pk))
                .and(registered_user::receive_subscription_notification),
        )
        .load::<i64>(connection)
        .await?;

    for subscriber_pk in subscriber_pks {
        push_notification(
            subscriber_pk,
            format!(
                "{} posted in topic '{}' you subscribed to",
                posting_user.user_name, containing_topic.title
            ),
            Some(format!("/topic/{}", containing_topic.pk)),
            connection,
        )
        .await?;
    }
    Ok(())
}

/// Notifies the author of a topic that was hidden automatically after passing the report
/// threshold.
pub async fn push_topic_auto_hidden_notification(
    hidden_topic: &Topic,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    push_notification(
        hidden_topic.fk_author,
        format!(
            "Your topic '{}' was hidden after being reported repeatedly",
            hidden_topic.title
        ),
        Some(format!("/topic/{}", hidden_topic.pk)),
        connection,
    )
    .await
}

/// Notifies the author of a post that was hidden automatically after passing the report
/// threshold.
pub async fn push_post_auto_hidden_notification(
    hidden_post: &Post,
    containing_topic: &Topic,
    connection: &mut AsyncPgConnection,
) -> Result<(), Error> {
    push_notification(
        hidden_post.fk_author,
        format!(
            "Your post in topic '{}' was hidden after being reported repeatedly",
            containing_topic.title
        ),
        Some(format!("/topic/{}", containing_topic.pk)),
        connection,
    )
    .await
}

pub async fn get_notifications_handler(
    user: User,
    page: PageParameters,
) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let limit = page.limit_or(*crate::NOTIFICATIONS_PER_PAGE);

    let total_count = notification::table
        .select(count(notification::pk))
        .filter(notification::fk_receiver.eq(user.pk))
        .get_result::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    let notifications = notification::table
        .filter(notification::fk_receiver.eq(user.pk))
        .order(notification::creation_timestamp.desc())
        .limit(limit)
        .offset(page.offset(limit))
        .load::<Notification>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&PaginatedResponse::new(
        notifications,
        &page,
        limit,
        total_count,
    )))
}

pub async fn unread_notification_count_handler(user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let unread_count = notification::table
        .select(count(notification::pk))
        .filter(
            notification::fk_receiver
                .eq(user.pk)
                .and(notification::read.eq(false)),
        )
        .get_result::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&serde_json::json!({
        "unread_count": unread_count
    })))
}

pub async fn read_notification_handler(
    notification_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let updated = diesel::update(notification::table)
        .filter(
            notification::pk
                .eq(notification_pk)
                .and(notification::fk_receiver.eq(user.pk)),
        )
        .set(notification::read.eq(true))
        .execute(&mut connection)
        .await
        .map_err(Error::from)?;

    if updated == 0 {
        return Err(warp::reject::custom(Error::NotFoundError(
            "notification",
            notification_pk,
        )));
    }

    Ok(warp::reply())
}

pub async fn read_all_notifications_handler(user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    diesel::update(notification::table)
        .filter(
            notification::fk_receiver
                .eq(user.pk)
                .and(notification::read.eq(false)),
        )
        .set(notification::read.eq(true))
        .execute(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply())
}

pub async fn delete_notification_handler(
    notification_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let deleted = diesel::delete(
        notification::table.filter(
            notification::pk
                .eq(notification_pk)
                .and(notification::fk_receiver.eq(user.pk)),
        ),
    )
    .execute(&mut connection)
    .await
    .map_err(Error::from)?;

    if deleted == 0 {
        return Err(warp::reject::custom(Error::NotFoundError(
            "notification",
            notification_pk,
        )));
    }

    Ok(warp::reply())
}

pub async fn delete_all_notifications_handler(user: User) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    diesel::delete(notification::table.filter(notification::fk_receiver.eq(user.pk)))
        .execute(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply())
}
