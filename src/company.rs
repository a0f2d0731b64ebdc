use std::collections::HashMap;

use chrono::offset::Utc;
use diesel::{BoolExpressionMethods, ExpressionMethods, QueryDsl, dsl::count};
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use validator::Validate;
use warp::{Rejection, Reply};

use crate::{
    acquire_db_connection,
    error::Error,
    model::{ContentItem, ContentPhoto, ContentSeries, NewContentItem, NewContentPhoto, User},
    perms,
    perms::Capability,
    schema::{content_item, content_photo, content_series},
    util::{NOT_BLANK_REGEX, PageParameters, PaginatedResponse},
};

async fn load_series(
    series_pk: i64,
    connection: &mut crate::DbConnection,
) -> Result<ContentSeries, Error> {
    content_series::table
        .filter(content_series::pk.eq(series_pk))
        .get_result::<ContentSeries>(connection)
        .await
        .map_err(|e| match e {
            diesel::NotFound => Error::NotFoundError("content_series", series_pk),
            e => e.into(),
        })
}

#[derive(Serialize)]
pub struct ContentItemEntry {
    #[serde(flatten)]
    pub item: ContentItem,
    pub cover_photo: Option<ContentPhoto>,
}

/// Public listing of the published items of a content series, newest first, with the first
/// photo of each item as its cover.
pub async fn get_content_items_handler(
    series_pk: i64,
    page: PageParameters,
) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let series = load_series(series_pk, &mut connection).await?;
    let limit = page.limit_or(*crate::NEWS_PER_PAGE);

    let total_count = content_item::table
        .select(count(content_item::pk))
        .filter(
            content_item::fk_series
                .eq(series.pk)
                .and(content_item::draft.eq(false)),
        )
        .get_result::<i64>(&mut connection)
        .await
        .map_err(Error::from)?;

    let items = content_item::table
        .filter(
            content_item::fk_series
                .eq(series.pk)
                .and(content_item::draft.eq(false)),
        )
        .order(content_item::creation_timestamp.desc())
        .limit(limit)
        .offset(page.offset(limit))
        .load::<ContentItem>(&mut connection)
        .await
        .map_err(Error::from)?;

    let item_pks = items.iter().map(|item| item.pk).collect::<Vec<_>>();
    let photos = content_photo::table
        .filter(content_photo::fk_item.eq_any(&item_pks))
        .order(content_photo::creation_timestamp.asc())
        .load::<ContentPhoto>(&mut connection)
        .await
        .map_err(Error::from)?;
    let mut cover_photos = HashMap::new();
    for photo in photos {
        cover_photos.entry(photo.fk_item).or_insert(photo);
    }

    let entries = items
        .into_iter()
        .map(|item| ContentItemEntry {
            cover_photo: cover_photos.remove(&item.pk),
            item,
        })
        .collect::<Vec<_>>();

    Ok(warp::reply::json(&PaginatedResponse::new(
        entries,
        &page,
        limit,
        total_count,
    )))
}

#[derive(Serialize)]
pub struct ContentItemDetailResponse {
    #[serde(flatten)]
    pub item: ContentItem,
    pub series_name: String,
    pub photos: Vec<ContentPhoto>,
}

pub async fn get_content_item_handler(item_pk: i64) -> Result<impl Reply, Rejection> {
    let mut connection = acquire_db_connection().await?;
    let (item, series_name) = content_item::table
        .inner_join(content_series::table)
        .filter(content_item::pk.eq(item_pk).and(content_item::draft.eq(false)))
        .select((content_item::all_columns, content_series::name))
        .get_result::<(ContentItem, String)>(&mut connection)
        .await
        .map_err(|e| match e {
            diesel::NotFound => Error::NotFoundError("content_item", item_pk),
            e => Error::from(e),
        })?;

    let photos = content_photo::table
        .filter(content_photo::fk_item.eq(item.pk))
        .order(content_photo::creation_timestamp.asc())
        .load::<ContentPhoto>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&ContentItemDetailResponse {
        item,
        series_name,
        photos,
    }))
}

#[derive(Deserialize, Validate)]
pub struct CreateContentItemRequest {
    #[validate(length(min = 1, max = 120), regex(path = *NOT_BLANK_REGEX))]
    pub title: String,
    #[validate(length(min = 1))]
    pub body: String,
    #[serde(default)]
    pub draft: bool,
    pub fk_series: i64,
}

pub async fn create_content_item_handler(
    request: CreateContentItemRequest,
    user: User,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Publicity).map_err(warp::reject::custom)?;
    request.validate().map_err(|e| {
        warp::reject::custom(Error::InvalidRequestInputError(format!(
            "Validation failed for CreateContentItemRequest: {}",
            e
        )))
    })?;

    let mut connection = acquire_db_connection().await?;
    let series = load_series(request.fk_series, &mut connection).await?;
    let created_item = diesel::insert_into(content_item::table)
        .values(NewContentItem {
            title: request.title,
            body: request.body,
            draft: request.draft,
            fk_series: series.pk,
            creation_timestamp: Utc::now(),
        })
        .get_result::<ContentItem>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&created_item))
}

#[derive(Deserialize, Validate)]
pub struct EditContentItemRequest {
    #[validate(length(min = 1, max = 120), regex(path = *NOT_BLANK_REGEX))]
    pub title: Option<String>,
    #[validate(length(min = 1))]
    pub body: Option<String>,
    pub draft: Option<bool>,
}

/// Edits a content item. Publishing a draft refreshes the creation timestamp so the item
/// appears at the top of its series.
pub async fn edit_content_item_handler(
    request: EditContentItemRequest,
    item_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Publicity).map_err(warp::reject::custom)?;
    request.validate().map_err(|e| {
        warp::reject::custom(Error::InvalidRequestInputError(format!(
            "Validation failed for EditContentItemRequest: {}",
            e
        )))
    })?;

    let mut connection = acquire_db_connection().await?;
    let item = content_item::table
        .filter(content_item::pk.eq(item_pk))
        .get_result::<ContentItem>(&mut connection)
        .await
        .map_err(|e| match e {
            diesel::NotFound => Error::NotFoundError("content_item", item_pk),
            e => Error::from(e),
        })?;

    let draft = request.draft.unwrap_or(item.draft);
    let creation_timestamp = if item.draft && !draft {
        Utc::now()
    } else {
        item.creation_timestamp
    };
    let updated_item = diesel::update(content_item::table)
        .filter(content_item::pk.eq(item.pk))
        .set((
            content_item::title.eq(request.title.unwrap_or(item.title)),
            content_item::body.eq(request.body.unwrap_or(item.body)),
            content_item::draft.eq(draft),
            content_item::creation_timestamp.eq(creation_timestamp),
        ))
        .get_result::<ContentItem>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&updated_item))
}

pub async fn delete_content_item_handler(
    item_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Publicity).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;
    let deleted_count = diesel::delete(content_item::table.filter(content_item::pk.eq(item_pk)))
        .execute(&mut connection)
        .await
        .map_err(Error::from)?;
    if deleted_count == 0 {
        return Err(warp::reject::custom(Error::NotFoundError(
            "content_item",
            item_pk,
        )));
    }

    Ok(warp::reply())
}

#[derive(Deserialize, Validate)]
pub struct SetContentPhotoRequest {
    #[validate(length(min = 1, max = 255), regex(path = *NOT_BLANK_REGEX))]
    pub filename: String,
    #[validate(length(max = 255))]
    pub thumbnail_filename: Option<String>,
}

/// Adds a photo to a content item.
pub async fn set_content_photo_handler(
    request: SetContentPhotoRequest,
    item_pk: i64,
    user: User,
) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Publicity).map_err(warp::reject::custom)?;
    request.validate().map_err(|e| {
        warp::reject::custom(Error::InvalidRequestInputError(format!(
            "Validation failed for SetContentPhotoRequest: {}",
            e
        )))
    })?;

    let mut connection = acquire_db_connection().await?;
    let item = content_item::table
        .filter(content_item::pk.eq(item_pk))
        .get_result::<ContentItem>(&mut connection)
        .await
        .map_err(|e| match e {
            diesel::NotFound => Error::NotFoundError("content_item", item_pk),
            e => Error::from(e),
        })?;

    let created_photo = diesel::insert_into(content_photo::table)
        .values(NewContentPhoto {
            filename: request.filename,
            thumbnail_filename: request.thumbnail_filename,
            fk_item: item.pk,
            creation_timestamp: Utc::now(),
        })
        .get_result::<ContentPhoto>(&mut connection)
        .await
        .map_err(Error::from)?;

    Ok(warp::reply::json(&created_photo))
}

#[derive(Serialize)]
pub struct SeriesCounts {
    pub series_pk: i64,
    pub series_name: String,
    pub published_count: i64,
    pub draft_count: i64,
}

/// Per-series item counts for the management view, drafts included.
pub async fn get_content_manage_counts_handler(user: User) -> Result<impl Reply, Rejection> {
    perms::require_capability(&user, Capability::Publicity).map_err(warp::reject::custom)?;
    let mut connection = acquire_db_connection().await?;

    let series = content_series::table
        .order(content_series::name.asc())
        .load::<ContentSeries>(&mut connection)
        .await
        .map_err(Error::from)?;
    let item_flags = content_item::table
        .select((content_item::fk_series, content_item::draft))
        .load::<(i64, bool)>(&mut connection)
        .await
        .map_err(Error::from)?;

    let mut counts_by_series: HashMap<i64, (i64, i64)> = HashMap::new();
    for (fk_series, draft) in item_flags {
        let counts = counts_by_series.entry(fk_series).or_default();
        if draft {
            counts.1 += 1;
        } else {
            counts.0 += 1;
        }
    }

    let response = series
        .into_iter()
        .map(|series| {
            let (published_count, draft_count) =
                counts_by_series.remove(&series.pk).unwrap_or((0, 0));
            SeriesCounts {
                series_pk: series.pk,
                series_name: series.name,
                published_count,
                draft_count,
            }
        })
        .collect::<Vec<_>>();

    Ok(warp::reply::json(&response))
}
