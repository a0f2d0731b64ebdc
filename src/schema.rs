table! {
    registered_user (pk) {
        pk -> Int8,
        user_name -> Varchar,
        password -> Varchar,
        email -> Nullable<Varchar>,
        display_name -> Nullable<Varchar>,
        phone -> Nullable<Varchar>,
        company -> Nullable<Varchar>,
        position -> Nullable<Varchar>,
        avatar_object_key -> Nullable<Varchar>,
        user_role -> Varchar,
        confirmed -> Bool,
        banned -> Bool,
        receive_collect_notification -> Bool,
        receive_reply_notification -> Bool,
        receive_subscription_notification -> Bool,
        topic_count -> Int4,
        jwt_version -> Int4,
        password_fail_count -> Int4,
        creation_timestamp -> Timestamptz,
    }
}

table! {
    refresh_token (pk) {
        pk -> Int8,
        uuid -> Uuid,
        expiry -> Timestamptz,
        invalidated -> Bool,
        fk_user -> Int8,
    }
}

table! {
    forum_group (pk) {
        pk -> Int8,
        name -> Varchar,
        description -> Nullable<Text>,
        visibility -> Varchar,
        fk_admin -> Int8,
        fk_last_topic -> Nullable<Int8>,
        fk_last_post -> Nullable<Int8>,
        topic_count -> Int4,
        post_count -> Int4,
        creation_timestamp -> Timestamptz,
    }
}

table! {
    topic (pk) {
        pk -> Int8,
        title -> Varchar,
        body -> Text,
        fk_group -> Int8,
        fk_author -> Int8,
        draft -> Bool,
        deleted -> Bool,
        pinned -> Bool,
        pinned_timestamp -> Nullable<Timestamptz>,
        report_count -> Int4,
        view_count -> Int4,
        fk_last_post -> Nullable<Int8>,
        post_count -> Int4,
        creation_timestamp -> Timestamptz,
        edit_timestamp -> Timestamptz,
    }
}

table! {
    post (pk) {
        pk -> Int8,
        title -> Varchar,
        body -> Text,
        fk_topic -> Int8,
        fk_author -> Int8,
        fk_replied_post -> Nullable<Int8>,
        draft -> Bool,
        deleted -> Bool,
        report_count -> Int4,
        creation_timestamp -> Timestamptz,
        edit_timestamp -> Timestamptz,
    }
}

table! {
    attachment (pk) {
        pk -> Int8,
        filename -> Varchar,
        thumbnail_filename -> Nullable<Varchar>,
        fk_topic -> Nullable<Int8>,
        fk_post -> Nullable<Int8>,
        creation_timestamp -> Timestamptz,
    }
}

table! {
    notification (pk) {
        pk -> Int8,
        message -> Text,
        link -> Nullable<Varchar>,
        read -> Bool,
        fk_receiver -> Int8,
        creation_timestamp -> Timestamptz,
    }
}

table! {
    topic_collection (fk_user, fk_topic) {
        fk_user -> Int8,
        fk_topic -> Int8,
        creation_timestamp -> Timestamptz,
    }
}

table! {
    topic_subscription (fk_user, fk_topic) {
        fk_user -> Int8,
        fk_topic -> Int8,
        creation_timestamp -> Timestamptz,
    }
}

table! {
    topic_view (fk_user, fk_topic) {
        fk_user -> Int8,
        fk_topic -> Int8,
    }
}

table! {
    content_series (pk) {
        pk -> Int8,
        name -> Varchar,
    }
}

table! {
    content_item (pk) {
        pk -> Int8,
        title -> Varchar,
        body -> Text,
        draft -> Bool,
        fk_series -> Int8,
        creation_timestamp -> Timestamptz,
    }
}

table! {
    content_photo (pk) {
        pk -> Int8,
        filename -> Varchar,
        thumbnail_filename -> Nullable<Varchar>,
        fk_item -> Int8,
        creation_timestamp -> Timestamptz,
    }
}

joinable!(refresh_token -> registered_user (fk_user));
joinable!(forum_group -> registered_user (fk_admin));
joinable!(topic -> forum_group (fk_group));
joinable!(topic -> registered_user (fk_author));
joinable!(post -> topic (fk_topic));
joinable!(post -> registered_user (fk_author));
joinable!(attachment -> topic (fk_topic));
joinable!(attachment -> post (fk_post));
joinable!(notification -> registered_user (fk_receiver));
joinable!(topic_collection -> registered_user (fk_user));
joinable!(topic_collection -> topic (fk_topic));
joinable!(topic_subscription -> registered_user (fk_user));
joinable!(topic_subscription -> topic (fk_topic));
joinable!(topic_view -> registered_user (fk_user));
joinable!(topic_view -> topic (fk_topic));
joinable!(content_item -> content_series (fk_series));
joinable!(content_photo -> content_item (fk_item));

allow_tables_to_appear_in_same_query!(
    registered_user,
    refresh_token,
    forum_group,
    topic,
    post,
    attachment,
    notification,
    topic_collection,
    topic_subscription,
    topic_view,
    content_series,
    content_item,
    content_photo,
);
