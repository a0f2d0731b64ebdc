use std::collections::HashMap;

use diesel::{ExpressionMethods, OptionalExtension, QueryDsl};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use lazy_static::lazy_static;

use crate::{
    error::Error,
    model::{Group, Post, Role, Topic, User, Visibility},
    schema::{forum_group, post, topic},
};

/// Capabilities granted to roles. Handlers check capabilities by name instead of dispatching
/// on role identity; the role to capability mapping is a fixed table built once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Follow,
    Collect,
    Comment,
    Publish,
    Member,
    Publicity,
    Moderate,
    Administer,
}

lazy_static! {
    static ref ROLE_CAPABILITIES: HashMap<Role, &'static [Capability]> = {
        use Capability::*;
        static STANDARD: [Capability; 4] = [Follow, Collect, Comment, Publish];
        static MEMBER: [Capability; 5] = [Follow, Collect, Comment, Publish, Member];
        static PUBLICIST: [Capability; 6] = [Follow, Collect, Comment, Publish, Member, Publicity];
        static MODERATOR: [Capability; 7] =
            [Follow, Collect, Comment, Publish, Member, Publicity, Moderate];
        static ADMINISTRATOR: [Capability; 8] = [
            Follow, Collect, Comment, Publish, Member, Publicity, Moderate, Administer,
        ];

        let mut map: HashMap<Role, &'static [Capability]> = HashMap::new();
        map.insert(Role::Standard, &STANDARD);
        map.insert(Role::Member, &MEMBER);
        map.insert(Role::Publicist, &PUBLICIST);
        map.insert(Role::Moderator, &MODERATOR);
        map.insert(Role::Administrator, &ADMINISTRATOR);
        map
    };
}

#[inline]
pub fn has_capability(user: &User, capability: Capability) -> bool {
    !user.banned
        && ROLE_CAPABILITIES
            .get(&user.user_role)
            .map(|capabilities| capabilities.contains(&capability))
            .unwrap_or(false)
}

pub fn require_capability(user: &User, capability: Capability) -> Result<(), Error> {
    if has_capability(user, capability) {
        Ok(())
    } else {
        Err(Error::ForbiddenError)
    }
}

pub fn require_confirmed(user: &User) -> Result<(), Error> {
    if user.confirmed {
        Ok(())
    } else {
        Err(Error::UnconfirmedUserError)
    }
}

/// Checks whether the given (possibly anonymous) user may read content in a group of the given
/// visibility tier.
pub fn check_group_readable(visibility: Visibility, user: Option<&User>) -> Result<(), Error> {
    match visibility {
        Visibility::Public => Ok(()),
        Visibility::Registered => user.map(|_| ()).ok_or(Error::ForbiddenError),
        Visibility::Restricted => match user {
            Some(user) => require_confirmed(user),
            None => Err(Error::ForbiddenError),
        },
        Visibility::Internal => match user {
            Some(user) => {
                require_confirmed(user)?;
                require_capability(user, Capability::Member)
            }
            None => Err(Error::ForbiddenError),
        },
    }
}

/// Checks whether the user may create topics or posts in the group. Restricted and internal
/// groups require the MEMBER capability, all tiers require a confirmed account.
pub fn check_group_writable(visibility: Visibility, user: &User) -> Result<(), Error> {
    require_confirmed(user)?;
    require_capability(user, Capability::Publish)?;
    match visibility {
        Visibility::Public | Visibility::Registered => Ok(()),
        Visibility::Restricted | Visibility::Internal => {
            require_capability(user, Capability::Member)
        }
    }
}

/// True if the user is the author of the entity, the admin of the owning group or carries the
/// MODERATE capability. This is the management rule shared by edit, delete and restore.
#[inline]
pub fn is_author_or_admin(user: &User, fk_author: i64, group: &Group) -> bool {
    user.pk == fk_author || user.pk == group.fk_admin || has_capability(user, Capability::Moderate)
}

pub fn require_author_or_admin(user: &User, fk_author: i64, group: &Group) -> Result<(), Error> {
    if is_author_or_admin(user, fk_author, group) {
        Ok(())
    } else {
        Err(Error::ForbiddenError)
    }
}

pub async fn load_group(
    group_pk: i64,
    connection: &mut AsyncPgConnection,
) -> Result<Group, Error> {
    forum_group::table
        .filter(forum_group::pk.eq(group_pk))
        .get_result::<Group>(connection)
        .await
        .optional()?
        .ok_or(Error::NotFoundError("group", group_pk))
}

/// Loads a topic and its group, enforcing the group's visibility tier and hiding drafts and
/// soft-deleted topics from everyone but their author, the group admin and moderators.
pub async fn load_topic_secured(
    topic_pk: i64,
    connection: &mut AsyncPgConnection,
    user: Option<&User>,
) -> Result<(Topic, Group), Error> {
    let (loaded_topic, group) = topic::table
        .inner_join(forum_group::table)
        .filter(topic::pk.eq(topic_pk))
        .get_result::<(Topic, Group)>(connection)
        .await
        .optional()?
        .ok_or(Error::NotFoundError("topic", topic_pk))?;

    check_group_readable(group.visibility, user)?;

    if (loaded_topic.draft || loaded_topic.deleted)
        && !user
            .map(|user| is_author_or_admin(user, loaded_topic.fk_author, &group))
            .unwrap_or(false)
    {
        return Err(Error::NotFoundError("topic", topic_pk));
    }

    Ok((loaded_topic, group))
}

/// Loads a post with its topic and group applying the same access rules as
/// [`load_topic_secured`].
pub async fn load_post_secured(
    post_pk: i64,
    connection: &mut AsyncPgConnection,
    user: Option<&User>,
) -> Result<(Post, Topic, Group), Error> {
    let (loaded_post, (loaded_topic, group)) = post::table
        .inner_join(topic::table.inner_join(forum_group::table))
        .filter(post::pk.eq(post_pk))
        .get_result::<(Post, (Topic, Group))>(connection)
        .await
        .optional()?
        .ok_or(Error::NotFoundError("post", post_pk))?;

    check_group_readable(group.visibility, user)?;

    if (loaded_post.draft || loaded_post.deleted)
        && !user
            .map(|user| is_author_or_admin(user, loaded_post.fk_author, &group))
            .unwrap_or(false)
    {
        return Err(Error::NotFoundError("post", post_pk));
    }

    Ok((loaded_post, loaded_topic, group))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user_with_role(user_role: Role) -> User {
        User {
            pk: 1,
            user_name: String::from("test"),
            password: String::new(),
            email: None,
            display_name: None,
            phone: None,
            company: None,
            position: None,
            avatar_object_key: None,
            user_role,
            confirmed: true,
            banned: false,
            receive_collect_notification: true,
            receive_reply_notification: true,
            receive_subscription_notification: true,
            topic_count: 0,
            jwt_version: 0,
            password_fail_count: 0,
            creation_timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_capability_table_is_cumulative() {
        let standard = user_with_role(Role::Standard);
        assert!(has_capability(&standard, Capability::Publish));
        assert!(!has_capability(&standard, Capability::Member));
        assert!(!has_capability(&standard, Capability::Moderate));

        let member = user_with_role(Role::Member);
        assert!(has_capability(&member, Capability::Member));
        assert!(!has_capability(&member, Capability::Publicity));

        let publicist = user_with_role(Role::Publicist);
        assert!(has_capability(&publicist, Capability::Publicity));
        assert!(!has_capability(&publicist, Capability::Moderate));

        let moderator = user_with_role(Role::Moderator);
        assert!(has_capability(&moderator, Capability::Moderate));
        assert!(!has_capability(&moderator, Capability::Administer));

        let administrator = user_with_role(Role::Administrator);
        assert!(has_capability(&administrator, Capability::Administer));
    }

    #[test]
    fn test_require_capability_rejects_standard_users_for_member() {
        let standard = user_with_role(Role::Standard);
        assert!(require_capability(&standard, Capability::Member).is_err());
        let member = user_with_role(Role::Member);
        assert!(require_capability(&member, Capability::Member).is_ok());
    }

    #[test]
    fn test_banned_user_has_no_capabilities() {
        let mut user = user_with_role(Role::Administrator);
        user.banned = true;
        assert!(!has_capability(&user, Capability::Follow));
        assert!(!has_capability(&user, Capability::Administer));
    }

    #[test]
    fn test_visibility_tiers() {
        let standard = user_with_role(Role::Standard);
        let member = user_with_role(Role::Member);
        let mut unconfirmed = user_with_role(Role::Standard);
        unconfirmed.confirmed = false;

        assert!(check_group_readable(Visibility::Public, None).is_ok());
        assert!(check_group_readable(Visibility::Registered, None).is_err());
        assert!(check_group_readable(Visibility::Registered, Some(&unconfirmed)).is_ok());
        assert!(check_group_readable(Visibility::Restricted, Some(&unconfirmed)).is_err());
        assert!(check_group_readable(Visibility::Restricted, Some(&standard)).is_ok());
        assert!(check_group_readable(Visibility::Internal, Some(&standard)).is_err());
        assert!(check_group_readable(Visibility::Internal, Some(&member)).is_ok());
    }
}
