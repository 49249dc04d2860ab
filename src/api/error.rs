use crate::config::ConfigError;
use crate::images::FetchError;
use rocket::http::Status;
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    FetchError(FetchError),
    ConfigError(ConfigError),
}

impl From<FetchError> for ApiError {
    fn from(error: FetchError) -> Self {
        ApiError::FetchError(error)
    }
}

impl From<ConfigError> for ApiError {
    fn from(error: ConfigError) -> Self {
        ApiError::ConfigError(error)
    }
}

impl ApiError {
    fn status(&self) -> Status {
        match self {
            ApiError::FetchError(FetchError::Network(error)) if error.is_timeout() => Status::GatewayTimeout,
            ApiError::FetchError(error) if error.is_upstream() => Status::BadGateway,
            ApiError::FetchError(FetchError::NoRemotes) => Status::ServiceUnavailable,
            ApiError::FetchError(_) => Status::InternalServerError,
            ApiError::ConfigError(_) => Status::InternalServerError,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ApiError::FetchError(FetchError::NoRemotes) => "No remotes",
            ApiError::FetchError(FetchError::Network(_)) => "Upstream network error",
            ApiError::FetchError(FetchError::BadUpstreamStatus(_)) => "Bad upstream status",
            ApiError::FetchError(FetchError::NoImageUrlFound(_)) => "Image URL not found",
            ApiError::FetchError(FetchError::Filesystem { .. }) => "Filesystem error",
            ApiError::FetchError(FetchError::Transcode(_)) => "Image processing error",
            ApiError::FetchError(FetchError::Worker(_)) => "Internal error",
            ApiError::ConfigError(_) => "Config error",
        }
    }
}

impl<'r> rocket::response::Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        let message = match &self {
            ApiError::FetchError(error) => error.to_string(),
            ApiError::ConfigError(error) => error.to_string(),
        };
        log::error!("Request failed: {}", message);

        let body = json!({
            "error": self.label(),
            "message": message
        })
        .to_string();

        rocket::Response::build()
            .status(self.status())
            .header(rocket::http::ContentType::JSON)
            .sized_body(body.len(), std::io::Cursor::new(body))
            .ok()
    }
}
