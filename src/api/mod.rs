pub mod error;
pub mod routes;

pub use error::ApiError;
