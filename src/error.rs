use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid plugin configuration: {0}")]
    Config(String),

    #[error("failed to fetch source image {path}: {source}")]
    Fetch {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to resolve source path: {0}")]
    PathRejected(String),

    #[error("failed to decode image: {0}")]
    ImageDecodeError(#[from] image::ImageError),

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("failed to encode image to {format}: {source}")]
    ImageEncodeError {
        format: String,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to create image buffer")]
    ImageBufferError,

    #[error("Not allowed")]
    Hotlink,

    #[error("Rate limit exceeded")]
    RateLimited,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Hotlink | AppError::PathRejected(_) => StatusCode::FORBIDDEN,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Plain-text message only; never a backtrace or debug repr.
        HttpResponse::build(self.status_code())
            .content_type("text/plain; charset=utf-8")
            .body(self.to_string())
    }
}
