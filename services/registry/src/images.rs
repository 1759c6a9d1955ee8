//! Image routes and the `x-image-meta-*` header codec

use std::fmt;
use std::pin::Pin;

use axum::Router;
use axum::body::{Body, BodyDataStream};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::stream::{Peekable, StreamExt};
use serde::Serialize;

use crate::error::{RegistryError, RegistryResult};
use crate::image::{Image, ImageId, ImageSummary, ImageUpdate, NewImage, Properties};
use crate::metadata::ImageFilter;
use crate::registry::Registry;

/// Prefix of every image metadata header
pub const META_PREFIX: &str = "x-image-meta-";

/// Prefix of image property headers
pub const PROPERTY_PREFIX: &str = "x-image-meta-property-";

/// Router for image operations
pub(crate) fn router() -> Router<Registry> {
    Router::new()
        .route("/", get(list_summaries))
        .route("/images", get(list_summaries).post(create_image))
        .route("/images/detail", get(list_details))
        .route(
            "/images/{id}",
            get(get_image)
                .head(head_image)
                .put(update_image)
                .delete(delete_image),
        )
}

#[derive(Debug, Serialize)]
struct Images<T> {
    images: Vec<T>,
}

#[derive(Debug, Serialize)]
struct ImageBody {
    image: Image,
}

/// List image summaries
async fn list_summaries(
    State(registry): State<Registry>,
    Query(filter): Query<ImageFilter>,
) -> RegistryResult<Json<Images<ImageSummary>>> {
    let images = registry.list_summaries(&filter).await?;
    Ok(Json(Images { images }))
}

/// List full image records
async fn list_details(
    State(registry): State<Registry>,
    Query(filter): Query<ImageFilter>,
) -> RegistryResult<Json<Images<Image>>> {
    let images = registry.list_details(&filter).await?;
    Ok(Json(Images { images }))
}

/// Register an image, ingesting the request body as its content if present
async fn create_image(
    State(registry): State<Registry>,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    check_store(&headers, &registry)?;
    let new = new_image(&headers)?;

    let image = if let Some(content) = content(&headers, body).await {
        registry.create_with_content(new, content).await?
    } else {
        registry.create(new).await?
    };

    let location = format!("/images/{}", image.id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(ImageBody { image }),
    )
        .into_response())
}

/// Image metadata as headers
async fn head_image(
    State(registry): State<Registry>,
    Path(id): Path<ImageId>,
) -> RegistryResult<Response> {
    let image = registry.get(id).await?;
    Ok((StatusCode::OK, image_headers(&image)).into_response())
}

/// Stream image content, with its metadata as headers
async fn get_image(
    State(registry): State<Registry>,
    Path(id): Path<ImageId>,
) -> RegistryResult<Response> {
    let (image, content) = registry.retrieve(id).await?;

    let mut headers = image_headers(&image);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(image.size));

    Ok((StatusCode::OK, headers, Body::from_stream(content)).into_response())
}

/// Apply header changes, ingesting the request body as content if present
async fn update_image(
    State(registry): State<Registry>,
    Path(id): Path<ImageId>,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Json<ImageBody>> {
    check_store(&headers, &registry)?;
    let changes = image_update(&headers)?;

    let image = if let Some(content) = content(&headers, body).await {
        registry.update_with_content(id, changes, content).await?
    } else {
        registry.update(id, changes).await?
    };

    Ok(Json(ImageBody { image }))
}

/// Delete an image
async fn delete_image(
    State(registry): State<Registry>,
    Path(id): Path<ImageId>,
) -> RegistryResult<StatusCode> {
    registry.delete(id).await?;
    Ok(StatusCode::OK)
}

/// The request body as image content, if the request carries any.
///
/// Content must be sent as `application/octet-stream`. A body known to be
/// empty, or one that ends before its first chunk, is not content.
async fn content(headers: &HeaderMap, body: Body) -> Option<Pin<Box<Peekable<BodyDataStream>>>> {
    let octet_stream = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/octet-stream"));
    let zero_length = headers
        .get(header::CONTENT_LENGTH)
        .is_some_and(|value| value.as_bytes() == b"0");

    if zero_length || http_body::Body::size_hint(&body).exact() == Some(0) {
        return None;
    }
    if !octet_stream {
        tracing::debug!("Ignoring request body that is not application/octet-stream");
        return None;
    }

    let mut stream = Box::pin(body.into_data_stream().peekable());
    stream.as_mut().peek().await.is_some().then_some(stream)
}

/// Reject requests that name a store other than the configured one
fn check_store(headers: &HeaderMap, registry: &Registry) -> RegistryResult<()> {
    let storage = registry.storage();
    match meta(headers, "store")? {
        Some(store) if store != storage.scheme() && store != storage.name() => {
            Err(RegistryError::UnknownStore(store))
        }
        _ => Ok(()),
    }
}

fn meta(headers: &HeaderMap, field: &str) -> RegistryResult<Option<String>> {
    let name = format!("{META_PREFIX}{field}");
    headers
        .get(name.as_str())
        .map(|value| {
            value
                .to_str()
                .map(|s| s.trim().to_owned())
                .map_err(|_| RegistryError::InvalidRequest(format!("{name} is not valid text")))
        })
        .transpose()
}

fn meta_bool(headers: &HeaderMap, field: &str) -> RegistryResult<Option<bool>> {
    let Some(value) = meta(headers, field)? else {
        return Ok(None);
    };

    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(Some(true)),
        "false" | "off" | "no" | "0" => Ok(Some(false)),
        _ => Err(RegistryError::InvalidRequest(format!(
            "{META_PREFIX}{field} must be a boolean, got '{value}'"
        ))),
    }
}

fn properties(headers: &HeaderMap) -> RegistryResult<Properties> {
    let mut properties = Properties::new();
    for (name, value) in headers {
        let Some(key) = name.as_str().strip_prefix(PROPERTY_PREFIX) else {
            continue;
        };
        let value = value.to_str().map_err(|_| {
            RegistryError::InvalidRequest(format!("property {key} is not valid text"))
        })?;
        properties.insert(key.to_owned(), value.trim().to_owned());
    }
    Ok(properties)
}

/// Decode a create request's headers
pub fn new_image(headers: &HeaderMap) -> RegistryResult<NewImage> {
    Ok(NewImage {
        name: meta(headers, "name")?,
        is_public: meta_bool(headers, "is-public")?.unwrap_or(false),
        disk_format: meta(headers, "disk-format")?,
        container_format: meta(headers, "container-format")?,
        status: meta(headers, "status")?,
        owner: meta(headers, "owner")?,
        properties: properties(headers)?,
        checksum: meta(headers, "checksum")?,
    })
}

/// Decode an update request's headers
pub fn image_update(headers: &HeaderMap) -> RegistryResult<ImageUpdate> {
    Ok(ImageUpdate {
        name: meta(headers, "name")?,
        is_public: meta_bool(headers, "is-public")?,
        disk_format: meta(headers, "disk-format")?,
        container_format: meta(headers, "container-format")?,
        status: meta(headers, "status")?,
        owner: meta(headers, "owner")?,
        properties: properties(headers)?,
        purge_properties: meta_bool(headers, "purge-props")?.unwrap_or(false),
        checksum: meta(headers, "checksum")?,
    })
}

/// Encode an image record as response headers
///
/// The checksum doubles as the `ETag`.
pub fn image_headers(image: &Image) -> HeaderMap {
    let mut headers = HeaderMap::new();

    insert(&mut headers, "id", image.id);
    if let Some(name) = &image.name {
        insert(&mut headers, "name", name);
    }
    insert(&mut headers, "is-public", image.is_public);
    if let Some(disk_format) = image.disk_format {
        insert(&mut headers, "disk-format", disk_format);
    }
    if let Some(container_format) = image.container_format {
        insert(&mut headers, "container-format", container_format);
    }
    insert(&mut headers, "status", image.status);
    insert(&mut headers, "size", image.size);
    if let Some(checksum) = &image.checksum {
        insert(&mut headers, "checksum", checksum);
        if let Ok(etag) = HeaderValue::try_from(checksum.as_str()) {
            headers.insert(header::ETAG, etag);
        }
    }
    if let Some(location) = &image.location {
        insert(&mut headers, "location", location);
    }
    if let Some(owner) = &image.owner {
        insert(&mut headers, "owner", owner);
    }
    insert(&mut headers, "created-at", image.created_at.to_rfc3339());
    insert(&mut headers, "updated-at", image.updated_at.to_rfc3339());
    if let Some(deleted_at) = image.deleted_at {
        insert(&mut headers, "deleted-at", deleted_at.to_rfc3339());
    }
    insert(&mut headers, "deleted", image.deleted);

    for (key, value) in &image.properties {
        insert(&mut headers, &format!("property-{key}"), value);
    }

    headers
}

fn insert(headers: &mut HeaderMap, field: &str, value: impl fmt::Display) {
    let name = HeaderName::try_from(format!("{META_PREFIX}{field}"));
    let value = HeaderValue::try_from(value.to_string());
    match (name, value) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => tracing::trace!(field, "Skipping field not representable as a header"),
    }
}
