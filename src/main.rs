#[macro_use]
extern crate diesel;
use chrono::Utc;
use clokwerk::Scheduler;
#[cfg(feature = "auto_migration")]
use diesel_migrations::{EmbeddedMigrations, embed_migrations};

use diesel_async::{
    AsyncPgConnection,
    pooled_connection::{
        AsyncDieselConnectionManager,
        deadpool::{Object, Pool},
    },
    scoped_futures::ScopedBoxFuture,
};
use dotenvy::dotenv;
use error::{Error, TransactionRuntimeError};
use lazy_static::lazy_static;
use std::{str::FromStr, thread::JoinHandle};
use url::Url;
use warp::Filter;

use crate::util::{OptFmt, PageParameters};

mod attachment;
mod auth;
mod company;
mod counters;
mod error;
mod group;
mod mail;
mod model;
mod notification;
mod perms;
mod post;
mod schema;
mod task;
mod topic;
mod user;
mod util;

pub type DbConnection = Object<AsyncPgConnection>;

lazy_static! {
    pub static ref CONNECTION_POOL: Pool<AsyncPgConnection> = {
        let database_url = std::env::var("DATABASE_URL")
            .expect("Missing environment variable DATABASE_URL must be set to connect to postgres");
        let connection_manager =
            AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let max_db_connections = std::env::var("MAX_DB_CONNECTIONS")
            .unwrap_or_else(|_| String::from("25"))
            .parse::<usize>()
            .expect("MAX_DB_CONNECTIONS is not a valid usize");
        Pool::builder(connection_manager)
            .max_size(max_db_connections)
            .build()
            .expect("Failed to initialise connection pool")
    };
    pub static ref JWT_SECRET: u64 = {
        let secret_str = std::env::var("JWT_SECRET")
            .expect("Missing environment variable JWT_SECRET must be set to generate JWT tokens.");
        u64::from_str(&secret_str).expect("JWT_SECRET var is not a valid u64 value")
    };
    pub static ref PORT: u16 = {
        let port_str =
            std::env::var("API_PORT").expect("Missing environment variable API_PORT must be set.");
        u16::from_str(&port_str).expect("API_PORT var is not a valid u16 value")
    };
    pub static ref CERT_PATH: Option<String> = std::env::var("CERT_PATH").ok();
    pub static ref KEY_PATH: Option<String> = std::env::var("KEY_PATH").ok();
    pub static ref API_BASE_URL: Url = std::env::var("API_BASE_URL")
        .map(|url| Url::parse(&url).expect("API_BASE_URL is not valid"))
        .unwrap_or_else(|_| {
            let protocol = if CERT_PATH.is_some() { "https" } else { "http" };

            Url::parse(&format!("{protocol}://localhost:{}/", *PORT)).unwrap()
        });
    /// Number of reports beyond which a topic or post is hidden automatically.
    pub static ref MAX_REPORT_COUNT: i32 = std::env::var("MAX_REPORT_COUNT")
        .unwrap_or_else(|_| String::from("5"))
        .parse::<i32>()
        .expect("MAX_REPORT_COUNT is not a valid i32");
    pub static ref TOPICS_PER_PAGE: u32 = parse_page_size("TOPICS_PER_PAGE", 10);
    pub static ref POSTS_PER_PAGE: u32 = parse_page_size("POSTS_PER_PAGE", 10);
    pub static ref NOTIFICATIONS_PER_PAGE: u32 = parse_page_size("NOTIFICATIONS_PER_PAGE", 30);
    pub static ref DELETED_PER_PAGE: u32 = parse_page_size("DELETED_PER_PAGE", 15);
    pub static ref NEWS_PER_PAGE: u32 = parse_page_size("NEWS_PER_PAGE", 9);
}

fn parse_page_size(var: &str, default: u32) -> u32 {
    std::env::var(var)
        .map(|v| {
            v.parse::<u32>()
                .unwrap_or_else(|_| panic!("{var} is not a valid u32"))
        })
        .unwrap_or(default)
}

#[cfg(feature = "auto_migration")]
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

fn main() {
    dotenv().ok();

    // initialise certain lazy statics on startup
    lazy_static::initialize(&CONNECTION_POOL);
    lazy_static::initialize(&JWT_SECRET);
    lazy_static::initialize(&PORT);
    lazy_static::initialize(&API_BASE_URL);
    lazy_static::initialize(&MAX_REPORT_COUNT);

    setup_logger();

    let _task_scheduler = start_task_scheduler_runtime(configure_scheduler());

    setup_tokio_runtime();
}

pub async fn acquire_db_connection() -> Result<DbConnection, Error> {
    CONNECTION_POOL
        .get()
        .await
        .map_err(|_| Error::DatabaseConnectionError)
}

pub async fn run_retryable_transaction<'a, T, F>(
    connection: &mut DbConnection,
    function: F,
) -> Result<T, Error>
where
    F: for<'r> Fn(
            &'r mut AsyncPgConnection,
        ) -> ScopedBoxFuture<'a, 'r, Result<T, TransactionRuntimeError>>
        + Sync,
    T: 'a,
{
    let mut retry_count: usize = 0;
    loop {
        retry_count += 1;
        let transaction_result = connection
            .build_transaction()
            .read_committed()
            .run(&function)
            .await;

        match transaction_result {
            Err(TransactionRuntimeError::Retry(_)) if retry_count <= 10 => { /* retry max 10 attempts */
            }
            Err(TransactionRuntimeError::Retry(e)) => break Err(e),
            Err(TransactionRuntimeError::Rollback(e)) => break Err(e),
            Ok(res) => break Ok(res),
        }
    }
}

pub async fn run_serializable_transaction<'a, T, F>(
    connection: &mut DbConnection,
    function: F,
) -> Result<T, Error>
where
    F: for<'r> Fn(
            &'r mut AsyncPgConnection,
        ) -> ScopedBoxFuture<'a, 'r, Result<T, TransactionRuntimeError>>
        + Sync,
    T: 'a,
{
    let mut retry_count: usize = 0;
    loop {
        retry_count += 1;
        let transaction_result = connection
            .build_transaction()
            .serializable()
            .run(&function)
            .await;

        match transaction_result {
            Err(TransactionRuntimeError::Retry(_)) if retry_count <= 10 => { /* retry max 10 attempts */
            }
            Err(TransactionRuntimeError::Retry(e)) => break Err(e),
            Err(TransactionRuntimeError::Rollback(e)) => break Err(e),
            Ok(res) => break Ok(res),
        }
    }
}

/// Retry a transaction if it fails due to a unique or foreign key constraint violation when concurrent transactions insert the same data
/// or concurrent transaction deletes data used as a foreign key by another transaction.
pub fn retry_on_constraint_violation(e: diesel::result::Error) -> TransactionRuntimeError {
    match e {
        diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation
            | diesel::result::DatabaseErrorKind::ForeignKeyViolation,
            _,
        ) => TransactionRuntimeError::Retry(e.into()),
        _ => TransactionRuntimeError::Rollback(e.into()),
    }
}

/// Start a tokio runtime that runs a warp server.
#[tokio::main]
async fn setup_tokio_runtime() {
    #[cfg(feature = "auto_migration")]
    {
        use diesel_migrations::MigrationHarness;
        log::info!("Running diesel migrations");
        let database_url =
            std::env::var("DATABASE_URL").expect("Missing environment variable DATABASE_URL");
        let mut connection = <diesel::PgConnection as diesel::Connection>::establish(&database_url)
            .expect("Failed to establish migration connection");
        if let Err(e) = connection.run_pending_migrations(MIGRATIONS) {
            panic!("Failed running db migrations: {}", e);
        }
        log::info!("Done running diesel migrations");
    }

    let login_route = warp::path("login")
        .and(warp::post())
        .and(warp::body::json())
        .and_then(auth::login_handler);

    let refresh_login_route = warp::path("refresh-login")
        .and(warp::post())
        .and(warp::cookie("refresh_token"))
        .and_then(auth::refresh_login_handler);

    let refresh_token_route = warp::path("refresh-token")
        .and(warp::post())
        .and(warp::path::param())
        .and_then(auth::refresh_login_handler);

    let logout_route = warp::path("logout")
        .and(warp::post())
        .and(warp::cookie::optional("refresh_token"))
        .and_then(auth::logout_handler);

    let register_route = warp::path("register")
        .and(warp::post())
        .and(warp::body::json())
        .and_then(auth::register_handler);

    let current_user_info_route = warp::path("current-user-info")
        .and(warp::get())
        .and(auth::with_user())
        .and_then(auth::current_user_info_handler);

    let change_password_route = warp::path("change-password")
        .and(warp::post())
        .and(warp::body::json())
        .and(auth::with_user())
        .and_then(auth::change_password_handler);

    let auth_routes = login_route
        .or(refresh_login_route)
        .or(refresh_token_route)
        .or(logout_route)
        .or(register_route)
        .or(current_user_info_route)
        .or(change_password_route)
        .boxed();

    let get_user_route = warp::path("get-user")
        .and(warp::get())
        .and(auth::with_user())
        .and(warp::path::param())
        .and_then(user::get_user_handler);

    let edit_profile_route = warp::path("edit-profile")
        .and(warp::post())
        .and(warp::body::json())
        .and(auth::with_user())
        .and_then(user::edit_profile_handler);

    let notification_settings_route = warp::path("notification-settings")
        .and(warp::post())
        .and(warp::body::json())
        .and(auth::with_user())
        .and_then(user::notification_settings_handler);

    let get_collections_route = warp::path("get-collections")
        .and(warp::get())
        .and(auth::with_user())
        .and(warp::query::<PageParameters>())
        .and_then(user::get_collections_handler);

    let get_subscriptions_route = warp::path("get-subscriptions")
        .and(warp::get())
        .and(auth::with_user())
        .and(warp::query::<PageParameters>())
        .and_then(user::get_subscriptions_handler);

    let get_draft_topics_route = warp::path("get-draft-topics")
        .and(warp::get())
        .and(auth::with_user())
        .and_then(user::get_draft_topics_handler);

    let get_draft_posts_route = warp::path("get-draft-posts")
        .and(warp::get())
        .and(auth::with_user())
        .and_then(user::get_draft_posts_handler);

    let get_user_topics_route = warp::path("get-user-topics")
        .and(warp::get())
        .and(auth::with_user())
        .and(warp::path::param())
        .and(warp::query::<PageParameters>())
        .and_then(user::get_user_topics_handler);

    let get_user_posts_route = warp::path("get-user-posts")
        .and(warp::get())
        .and(auth::with_user())
        .and(warp::path::param())
        .and(warp::query::<PageParameters>())
        .and_then(user::get_user_posts_handler);

    let create_user_route = warp::path("create-user")
        .and(warp::post())
        .and(warp::body::json())
        .and(auth::with_user())
        .and_then(user::create_user_handler);

    let confirm_user_route = warp::path("confirm-user")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(user::confirm_user_handler);

    let edit_user_route = warp::path("edit-user")
        .and(warp::post())
        .and(warp::body::json())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(user::edit_user_handler);

    let delete_user_route = warp::path("delete-user")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(user::delete_user_handler);

    let user_routes = get_user_route
        .or(edit_profile_route)
        .or(notification_settings_route)
        .or(get_collections_route)
        .or(get_subscriptions_route)
        .or(get_draft_topics_route)
        .or(get_draft_posts_route)
        .or(get_user_topics_route)
        .or(get_user_posts_route)
        .or(create_user_route)
        .or(confirm_user_route)
        .or(edit_user_route)
        .or(delete_user_route)
        .boxed();

    let get_notifications_route = warp::path("get-notifications")
        .and(warp::get())
        .and(auth::with_user())
        .and(warp::query::<PageParameters>())
        .and_then(notification::get_notifications_handler);

    let unread_notification_count_route = warp::path("unread-notification-count")
        .and(warp::get())
        .and(auth::with_user())
        .and_then(notification::unread_notification_count_handler);

    let read_notification_route = warp::path("read-notification")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(notification::read_notification_handler);

    let read_all_notifications_route = warp::path("read-all-notifications")
        .and(warp::post())
        .and(auth::with_user())
        .and_then(notification::read_all_notifications_handler);

    let delete_notification_route = warp::path("delete-notification")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(notification::delete_notification_handler);

    let delete_all_notifications_route = warp::path("delete-all-notifications")
        .and(warp::post())
        .and(auth::with_user())
        .and_then(notification::delete_all_notifications_handler);

    let notification_routes = get_notifications_route
        .or(unread_notification_count_route)
        .or(read_notification_route)
        .or(read_all_notifications_route)
        .or(delete_notification_route)
        .or(delete_all_notifications_route)
        .boxed();

    let get_groups_route = warp::path("get-groups")
        .and(warp::get())
        .and(auth::with_user_optional())
        .and_then(group::get_groups_handler);

    let get_group_route = warp::path("get-group")
        .and(warp::get())
        .and(auth::with_user_optional())
        .and(warp::path::param())
        .and(warp::query::<PageParameters>())
        .and_then(group::get_group_handler);

    let create_group_route = warp::path("create-group")
        .and(warp::post())
        .and(warp::body::json())
        .and(auth::with_user())
        .and_then(group::create_group_handler);

    let edit_group_route = warp::path("edit-group")
        .and(warp::post())
        .and(warp::body::json())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(group::edit_group_handler);

    let delete_group_route = warp::path("delete-group")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(group::delete_group_handler);

    let migrate_group_route = warp::path("migrate-group")
        .and(warp::post())
        .and(warp::body::json())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(group::migrate::migrate_group_handler);

    let move_topic_route = warp::path("move-topic")
        .and(warp::post())
        .and(warp::body::json())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(group::migrate::move_topic_handler);

    let recompute_group_route = warp::path("recompute-group-aggregates")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(group::recompute_group_aggregates_handler);

    let group_routes = get_groups_route
        .or(get_group_route)
        .or(create_group_route)
        .or(edit_group_route)
        .or(delete_group_route)
        .or(migrate_group_route)
        .or(move_topic_route)
        .or(recompute_group_route)
        .boxed();

    let create_topic_route = warp::path("create-topic")
        .and(warp::post())
        .and(warp::body::json())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::create::create_topic_handler);

    let get_topic_route = warp::path("get-topic")
        .and(warp::get())
        .and(auth::with_user_optional())
        .and(warp::path::param())
        .and(warp::query::<PageParameters>())
        .and_then(topic::get_topic_handler);

    let edit_topic_route = warp::path("edit-topic")
        .and(warp::post())
        .and(warp::body::json())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::update::edit_topic_handler);

    let publish_topic_route = warp::path("publish-topic")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::update::publish_topic_handler);

    let withdraw_topic_route = warp::path("withdraw-topic")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::update::withdraw_topic_handler);

    let pin_topic_route = warp::path("pin-topic")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::update::pin_topic_handler);

    let unpin_topic_route = warp::path("unpin-topic")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::update::unpin_topic_handler);

    let report_topic_route = warp::path("report-topic")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::update::report_topic_handler);

    let reset_topic_reports_route = warp::path("reset-topic-reports")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::update::reset_topic_reports_handler);

    let delete_topic_route = warp::path("delete-topic")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::delete::delete_topic_handler);

    let restore_topic_route = warp::path("restore-topic")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::delete::restore_topic_handler);

    let purge_topic_route = warp::path("purge-topic")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::delete::purge_topic_handler);

    let collect_topic_route = warp::path("collect-topic")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::collect_topic_handler);

    let uncollect_topic_route = warp::path("uncollect-topic")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::uncollect_topic_handler);

    let subscribe_topic_route = warp::path("subscribe-topic")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::subscribe_topic_handler);

    let unsubscribe_topic_route = warp::path("unsubscribe-topic")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(topic::unsubscribe_topic_handler);

    let reported_topics_route = warp::path("get-reported-topics")
        .and(warp::get())
        .and(auth::with_user())
        .and(warp::query::<PageParameters>())
        .and_then(topic::get_reported_topics_handler);

    let deleted_topics_route = warp::path("get-deleted-topics")
        .and(warp::get())
        .and(auth::with_user())
        .and(warp::query::<PageParameters>())
        .and_then(topic::get_deleted_topics_handler);

    let topic_routes = create_topic_route
        .or(get_topic_route)
        .or(edit_topic_route)
        .or(publish_topic_route)
        .or(withdraw_topic_route)
        .or(pin_topic_route)
        .or(unpin_topic_route)
        .or(report_topic_route)
        .or(reset_topic_reports_route)
        .or(delete_topic_route)
        .or(restore_topic_route)
        .or(purge_topic_route)
        .or(collect_topic_route)
        .or(uncollect_topic_route)
        .or(subscribe_topic_route)
        .or(unsubscribe_topic_route)
        .or(reported_topics_route)
        .or(deleted_topics_route)
        .boxed();

    let create_post_route = warp::path("create-post")
        .and(warp::post())
        .and(warp::body::json())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(post::create::create_post_handler);

    let get_post_route = warp::path("get-post")
        .and(warp::get())
        .and(auth::with_user_optional())
        .and(warp::path::param())
        .and_then(post::get_post_handler);

    let edit_post_route = warp::path("edit-post")
        .and(warp::post())
        .and(warp::body::json())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(post::update::edit_post_handler);

    let publish_post_route = warp::path("publish-post")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(post::update::publish_post_handler);

    let withdraw_post_route = warp::path("withdraw-post")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(post::update::withdraw_post_handler);

    let report_post_route = warp::path("report-post")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(post::update::report_post_handler);

    let reset_post_reports_route = warp::path("reset-post-reports")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(post::update::reset_post_reports_handler);

    let delete_post_route = warp::path("delete-post")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(post::delete::delete_post_handler);

    let restore_post_route = warp::path("restore-post")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(post::delete::restore_post_handler);

    let purge_post_route = warp::path("purge-post")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(post::delete::purge_post_handler);

    let reported_posts_route = warp::path("get-reported-posts")
        .and(warp::get())
        .and(auth::with_user())
        .and(warp::query::<PageParameters>())
        .and_then(post::get_reported_posts_handler);

    let deleted_posts_route = warp::path("get-deleted-posts")
        .and(warp::get())
        .and(auth::with_user())
        .and(warp::query::<PageParameters>())
        .and_then(post::get_deleted_posts_handler);

    let post_routes = create_post_route
        .or(get_post_route)
        .or(edit_post_route)
        .or(publish_post_route)
        .or(withdraw_post_route)
        .or(report_post_route)
        .or(reset_post_reports_route)
        .or(delete_post_route)
        .or(restore_post_route)
        .or(purge_post_route)
        .or(reported_posts_route)
        .or(deleted_posts_route)
        .boxed();

    let create_attachment_route = warp::path("create-attachment")
        .and(warp::post())
        .and(warp::body::json())
        .and(auth::with_user())
        .and_then(attachment::create_attachment_handler);

    let delete_attachment_route = warp::path("delete-attachment")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(attachment::delete_attachment_handler);

    let get_content_items_route = warp::path("get-content-items")
        .and(warp::get())
        .and(warp::path::param())
        .and(warp::query::<PageParameters>())
        .and_then(company::get_content_items_handler);

    let get_content_item_route = warp::path("get-content-item")
        .and(warp::get())
        .and(warp::path::param())
        .and_then(company::get_content_item_handler);

    let create_content_item_route = warp::path("create-content-item")
        .and(warp::post())
        .and(warp::body::json())
        .and(auth::with_user())
        .and_then(company::create_content_item_handler);

    let edit_content_item_route = warp::path("edit-content-item")
        .and(warp::post())
        .and(warp::body::json())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(company::edit_content_item_handler);

    let delete_content_item_route = warp::path("delete-content-item")
        .and(warp::post())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(company::delete_content_item_handler);

    let set_content_photo_route = warp::path("set-content-photo")
        .and(warp::post())
        .and(warp::body::json())
        .and(warp::path::param())
        .and(auth::with_user())
        .and_then(company::set_content_photo_handler);

    let content_manage_counts_route = warp::path("get-content-manage-counts")
        .and(warp::get())
        .and(auth::with_user())
        .and_then(company::get_content_manage_counts_handler);

    let misc_routes = create_attachment_route
        .or(delete_attachment_route)
        .or(get_content_items_route)
        .or(get_content_item_route)
        .or(create_content_item_route)
        .or(edit_content_item_route)
        .or(delete_content_item_route)
        .or(set_content_photo_route)
        .or(content_manage_counts_route)
        .boxed();

    let routes = auth_routes
        .or(user_routes)
        .or(notification_routes)
        .or(group_routes)
        .or(topic_routes)
        .or(post_routes)
        .or(misc_routes)
        .boxed();

    let filter = routes
        .recover(error::handle_rejection)
        .with(warp::log::custom(|info| {
            let log_level = if info.elapsed().as_secs() >= 10 {
                log::Level::Warn
            } else if info.elapsed().as_millis() >= 250 {
                log::Level::Info
            } else {
                log::Level::Debug
            };

            log::log!(
                target: "tecon_forum::api",
                log_level,
                "{} \"{} {} {:?}\" {} \"{}\" \"{}\" {:?}",
                OptFmt(info.remote_addr()),
                info.method(),
                info.path(),
                info.version(),
                info.status().as_u16(),
                OptFmt(info.referer()),
                OptFmt(info.user_agent()),
                info.elapsed(),
            );
        }));

    #[cfg(debug_assertions)]
    let filter = filter.with(
        warp::cors()
            .allow_any_origin()
            .allow_header("content-type")
            .allow_header("Authorization")
            .allow_credentials(true)
            .allow_method(warp::http::Method::DELETE)
            .allow_method(warp::http::Method::GET)
            .allow_method(warp::http::Method::OPTIONS)
            .allow_method(warp::http::Method::PATCH)
            .allow_method(warp::http::Method::POST),
    );

    if CERT_PATH.is_some() && KEY_PATH.is_some() {
        warp::serve(filter)
            .tls()
            .cert_path(CERT_PATH.as_ref().unwrap())
            .key_path(KEY_PATH.as_ref().unwrap())
            .run(([0, 0, 0, 0], *PORT))
            .await;
    } else {
        warp::serve(filter).run(([0, 0, 0, 0], *PORT)).await;
    }
}

fn setup_logger() {
    // create logs dir as fern does not appear to handle that itself
    if !std::path::Path::new("logs/").exists() {
        std::fs::create_dir("logs").expect("Failed to create logs/ directory");
    }

    let logging_level = if cfg!(debug_assertions) {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}]{}[{}] {}",
                record.level(),
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .level_for("tecon_forum", logging_level)
        .level_for("tecon_forum_server", logging_level)
        .chain(std::io::stdout())
        .chain(fern::DateBased::new("logs/", "logs_%Y-%m-%d.log"))
        .apply()
        .expect("Failed to set up logging");
}

fn configure_scheduler() -> Scheduler<Utc> {
    let mut scheduler = Scheduler::with_tz(Utc);
    scheduler.every(clokwerk::Interval::Hours(6)).run(|| {
        task::submit_task(
            "recompute_group_aggregates",
            task::recompute_all_group_aggregates,
        )
    });
    scheduler.every(clokwerk::Interval::Hours(24)).run(|| {
        task::submit_task("clear_expired_refresh_tokens", task::clear_expired_refresh_tokens)
    });

    scheduler
}

fn start_task_scheduler_runtime(scheduler: Scheduler<Utc>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(String::from("task_scheduler"))
        .spawn(move || {
            let mut task_scheduler_sentinel = TaskSchedulerSentinel { scheduler };

            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .thread_name("task_tokio_worker")
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    eprintln!("Failed to start task scheduler runtime: {}", e);
                    std::process::exit(1);
                }
            };

            runtime.block_on(async {
                loop {
                    task_scheduler_sentinel.scheduler.run_pending();
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            });
        })
        .expect("Failed to spawn task scheduler thread")
}

struct TaskSchedulerSentinel {
    scheduler: Scheduler<Utc>,
}

impl Drop for TaskSchedulerSentinel {
    fn drop(&mut self) {
        if std::thread::panicking() {
            start_task_scheduler_runtime(configure_scheduler());
        }
    }
}
