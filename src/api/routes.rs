use std::convert::Infallible;
use std::io::Cursor;
use std::sync::Arc;

use rocket::http::{ContentType, Header, Status};
use rocket::request::{FromRequest, Outcome};
use rocket::{request::Request, response::{self, Response, Responder}};
use rocket::State;

use crate::api::ApiError;
use crate::cache::CachePolicy;
use crate::config::ConfigStore;
use crate::images::detect_image_type;

/// `Host` header of the incoming request, used to build absolute image URLs.
/// Falls back to `localhost:<port>` when the client sent none.
pub struct RequestHost(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestHost {
    type Error = Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let host = req
            .headers()
            .get_one("Host")
            .filter(|host| !host.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("localhost:{}", req.rocket().config().port));
        Outcome::Success(RequestHost(host))
    }
}

#[get("/")]
pub async fn index(host: RequestHost, policy: &State<CachePolicy>) -> Result<String, ApiError> {
    let served = policy.serve(&host.0).await?;
    log::debug!("Served {} ({:?})", served.url, served.source);
    Ok(served.url)
}

#[get("/favicon.ico")]
pub fn favicon() -> Status {
    Status::NotFound
}

#[get("/reload")]
pub fn reload(config: &State<Arc<ConfigStore>>) -> Result<&'static str, ApiError> {
    config.reload()?;
    Ok("Config reloaded")
}

#[get("/<folder>/<name>")]
pub async fn cached_image(
    folder: &str,
    name: &str,
    policy: &State<CachePolicy>,
) -> Option<ImageResponse> {
    let config = policy.config().snapshot();
    if folder != config.cache_folder {
        return None;
    }

    let entry = policy.store(&config).lookup(name)?;
    match tokio::fs::read(entry.path()).await {
        Ok(data) => Some(ImageResponse {
            content_type: detect_image_type(&data).to_string(),
            data,
        }),
        Err(e) => {
            log::warn!("Failed to read cached image {}: {}", entry.path().display(), e);
            None
        }
    }
}

#[post("/<_..>")]
pub fn post_not_allowed() -> Status {
    Status::MethodNotAllowed
}

#[put("/<_..>")]
pub fn put_not_allowed() -> Status {
    Status::MethodNotAllowed
}

#[delete("/<_..>")]
pub fn delete_not_allowed() -> Status {
    Status::MethodNotAllowed
}

#[patch("/<_..>")]
pub fn patch_not_allowed() -> Status {
    Status::MethodNotAllowed
}

#[options("/<_..>")]
pub fn options_not_allowed() -> Status {
    Status::MethodNotAllowed
}

// Responder for image data
pub struct ImageResponse {
    pub data: Vec<u8>,
    pub content_type: String,
}

impl<'r> Responder<'r, 'static> for ImageResponse {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let content_type = match self.content_type.as_str() {
            "image/png" => ContentType::PNG,
            _ => ContentType::JPEG,
        };
        let etag = format!("\"{:x}\"", md5::compute(&self.data));
        // Check If-None-Match header
        if let Some(if_none_match) = req.headers().get_one("If-None-Match") {
            if if_none_match == etag {
                return Response::build()
                    .status(Status::NotModified)
                    .header(Header::new("ETag", etag))
                    .header(Header::new("Cache-Control", "public, max-age=86400"))
                    .ok();
            }
        }
        Response::build()
            .header(content_type)
            .header(Header::new("Cache-Control", "public, max-age=86400"))
            .header(Header::new("ETag", etag))
            .sized_body(self.data.len(), Cursor::new(self.data))
            .ok()
    }
}
