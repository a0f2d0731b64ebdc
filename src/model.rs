#![allow(clippy::extra_unused_lifetimes)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, offset::Utc};
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Varchar;
use diesel::{Associations, Identifiable, Insertable, Queryable, QueryableByName};
use serde::{Deserialize, Serialize};

use crate::schema::*;

/// Role assigned to a registered user. Stored as a lower case varchar; the capability set
/// granted by each role is defined in [`crate::perms`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsExpression, FromSqlRow, Serialize, Deserialize)]
#[diesel(sql_type = Varchar)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Standard,
    Member,
    Publicist,
    Moderator,
    Administrator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Standard => "standard",
            Role::Member => "member",
            Role::Publicist => "publicist",
            Role::Moderator => "moderator",
            Role::Administrator => "administrator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Role::Standard),
            "member" => Ok(Role::Member),
            "publicist" => Ok(Role::Publicist),
            "moderator" => Ok(Role::Moderator),
            "administrator" => Ok(Role::Administrator),
            _ => Err(()),
        }
    }
}

impl ToSql<Varchar, Pg> for Role {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <str as ToSql<Varchar, Pg>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<Varchar, Pg> for Role {
    fn from_sql(value: PgValue<'_>) -> deserialize::Result<Self> {
        let s = <String as FromSql<Varchar, Pg>>::from_sql(value)?;
        Role::from_str(&s).map_err(|_| format!("Unrecognised user role '{s}'").into())
    }
}

/// Visibility tier of a forum group.
///
/// `Public` groups are readable by guests, `Registered` groups require a logged in account,
/// `Restricted` groups additionally require the account to be confirmed and `Internal` groups
/// require the MEMBER capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsExpression, FromSqlRow, Serialize, Deserialize)]
#[diesel(sql_type = Varchar)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Internal,
    Restricted,
    Registered,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Internal => "internal",
            Visibility::Restricted => "restricted",
            Visibility::Registered => "registered",
            Visibility::Public => "public",
        }
    }
}

impl FromStr for Visibility {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(Visibility::Internal),
            "restricted" => Ok(Visibility::Restricted),
            "registered" => Ok(Visibility::Registered),
            "public" => Ok(Visibility::Public),
            _ => Err(()),
        }
    }
}

impl ToSql<Varchar, Pg> for Visibility {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <str as ToSql<Varchar, Pg>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<Varchar, Pg> for Visibility {
    fn from_sql(value: PgValue<'_>) -> deserialize::Result<Self> {
        let s = <String as FromSql<Varchar, Pg>>::from_sql(value)?;
        Visibility::from_str(&s).map_err(|_| format!("Unrecognised visibility '{s}'").into())
    }
}

#[derive(Identifiable, Queryable, QueryableByName, Serialize, Clone)]
#[diesel(table_name = registered_user)]
#[diesel(primary_key(pk))]
pub struct User {
    pub pk: i64,
    pub user_name: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub position: Option<String>,
    pub avatar_object_key: Option<String>,
    pub user_role: Role,
    pub confirmed: bool,
    pub banned: bool,
    pub receive_collect_notification: bool,
    pub receive_reply_notification: bool,
    pub receive_subscription_notification: bool,
    pub topic_count: i32,
    #[serde(skip_serializing)]
    pub jwt_version: i32,
    #[serde(skip_serializing)]
    pub password_fail_count: i32,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Clone, Insertable)]
#[diesel(table_name = registered_user)]
pub struct NewUser {
    pub user_name: String,
    pub password: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub position: Option<String>,
    pub user_role: Role,
    pub confirmed: bool,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Associations, Identifiable, Insertable, Queryable)]
#[diesel(belongs_to(User, foreign_key = fk_user))]
#[diesel(table_name = refresh_token)]
#[diesel(primary_key(pk))]
pub struct RefreshToken {
    pub pk: i64,
    pub uuid: uuid::Uuid,
    pub expiry: DateTime<Utc>,
    pub invalidated: bool,
    pub fk_user: i64,
}

#[derive(Insertable)]
#[diesel(table_name = refresh_token)]
pub struct NewRefreshToken {
    pub uuid: uuid::Uuid,
    pub expiry: DateTime<Utc>,
    pub invalidated: bool,
    pub fk_user: i64,
}

#[derive(Associations, Clone, Identifiable, Queryable, QueryableByName, Serialize)]
#[diesel(table_name = forum_group)]
#[diesel(primary_key(pk))]
#[diesel(belongs_to(User, foreign_key = fk_admin))]
pub struct Group {
    pub pk: i64,
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
    pub fk_admin: i64,
    pub fk_last_topic: Option<i64>,
    pub fk_last_post: Option<i64>,
    pub topic_count: i32,
    pub post_count: i32,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Clone, Insertable)]
#[diesel(table_name = forum_group)]
pub struct NewGroup {
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
    pub fk_admin: i64,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Associations, Clone, Identifiable, Queryable, QueryableByName, Serialize)]
#[diesel(table_name = topic)]
#[diesel(primary_key(pk))]
#[diesel(belongs_to(Group, foreign_key = fk_group))]
pub struct Topic {
    pub pk: i64,
    pub title: String,
    pub body: String,
    pub fk_group: i64,
    pub fk_author: i64,
    pub draft: bool,
    pub deleted: bool,
    pub pinned: bool,
    pub pinned_timestamp: Option<DateTime<Utc>>,
    pub report_count: i32,
    pub view_count: i32,
    pub fk_last_post: Option<i64>,
    pub post_count: i32,
    pub creation_timestamp: DateTime<Utc>,
    pub edit_timestamp: DateTime<Utc>,
}

impl Topic {
    /// True if the topic contributes to its ancestors' counts and pointers.
    #[inline]
    pub fn in_scope(&self) -> bool {
        !self.draft && !self.deleted
    }
}

#[derive(Clone, Insertable)]
#[diesel(table_name = topic)]
pub struct NewTopic {
    pub title: String,
    pub body: String,
    pub fk_group: i64,
    pub fk_author: i64,
    pub draft: bool,
    pub creation_timestamp: DateTime<Utc>,
    pub edit_timestamp: DateTime<Utc>,
}

#[derive(Associations, Clone, Identifiable, Queryable, QueryableByName, Serialize)]
#[diesel(table_name = post)]
#[diesel(primary_key(pk))]
#[diesel(belongs_to(Topic, foreign_key = fk_topic))]
pub struct Post {
    pub pk: i64,
    pub title: String,
    pub body: String,
    pub fk_topic: i64,
    pub fk_author: i64,
    pub fk_replied_post: Option<i64>,
    pub draft: bool,
    pub deleted: bool,
    pub report_count: i32,
    pub creation_timestamp: DateTime<Utc>,
    pub edit_timestamp: DateTime<Utc>,
}

impl Post {
    #[inline]
    pub fn in_scope(&self) -> bool {
        !self.draft && !self.deleted
    }
}

#[derive(Clone, Insertable)]
#[diesel(table_name = post)]
pub struct NewPost {
    pub title: String,
    pub body: String,
    pub fk_topic: i64,
    pub fk_author: i64,
    pub fk_replied_post: Option<i64>,
    pub draft: bool,
    pub creation_timestamp: DateTime<Utc>,
    pub edit_timestamp: DateTime<Utc>,
}

#[derive(Clone, Identifiable, Queryable, QueryableByName, Serialize)]
#[diesel(table_name = attachment)]
#[diesel(primary_key(pk))]
pub struct Attachment {
    pub pk: i64,
    pub filename: String,
    pub thumbnail_filename: Option<String>,
    pub fk_topic: Option<i64>,
    pub fk_post: Option<i64>,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = attachment)]
pub struct NewAttachment {
    pub filename: String,
    pub thumbnail_filename: Option<String>,
    pub fk_topic: Option<i64>,
    pub fk_post: Option<i64>,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Associations, Clone, Identifiable, Queryable, QueryableByName, Serialize)]
#[diesel(table_name = notification)]
#[diesel(primary_key(pk))]
#[diesel(belongs_to(User, foreign_key = fk_receiver))]
pub struct Notification {
    pub pk: i64,
    pub message: String,
    pub link: Option<String>,
    pub read: bool,
    pub fk_receiver: i64,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = notification)]
pub struct NewNotification {
    pub message: String,
    pub link: Option<String>,
    pub read: bool,
    pub fk_receiver: i64,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Clone, Identifiable, Insertable, Queryable, Serialize)]
#[diesel(table_name = topic_collection)]
#[diesel(primary_key(fk_user, fk_topic))]
pub struct TopicCollection {
    pub fk_user: i64,
    pub fk_topic: i64,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Clone, Identifiable, Insertable, Queryable, Serialize)]
#[diesel(table_name = topic_subscription)]
#[diesel(primary_key(fk_user, fk_topic))]
pub struct TopicSubscription {
    pub fk_user: i64,
    pub fk_topic: i64,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Clone, Identifiable, Insertable, Queryable, Serialize)]
#[diesel(table_name = topic_view)]
#[diesel(primary_key(fk_user, fk_topic))]
pub struct TopicView {
    pub fk_user: i64,
    pub fk_topic: i64,
}

#[derive(Clone, Identifiable, Queryable, Serialize)]
#[diesel(table_name = content_series)]
#[diesel(primary_key(pk))]
pub struct ContentSeries {
    pub pk: i64,
    pub name: String,
}

#[derive(Associations, Clone, Identifiable, Queryable, Serialize)]
#[diesel(table_name = content_item)]
#[diesel(primary_key(pk))]
#[diesel(belongs_to(ContentSeries, foreign_key = fk_series))]
pub struct ContentItem {
    pub pk: i64,
    pub title: String,
    pub body: String,
    pub draft: bool,
    pub fk_series: i64,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = content_item)]
pub struct NewContentItem {
    pub title: String,
    pub body: String,
    pub draft: bool,
    pub fk_series: i64,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Clone, Identifiable, Queryable, Serialize)]
#[diesel(table_name = content_photo)]
#[diesel(primary_key(pk))]
pub struct ContentPhoto {
    pub pk: i64,
    pub filename: String,
    pub thumbnail_filename: Option<String>,
    pub fk_item: i64,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = content_photo)]
pub struct NewContentPhoto {
    pub filename: String,
    pub thumbnail_filename: Option<String>,
    pub fk_item: i64,
    pub creation_timestamp: DateTime<Utc>,
}
