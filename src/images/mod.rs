pub mod source;
pub mod tools;

pub use source::{FetchError, ImageSource, Located, RemoteFetcher};
pub use tools::{detect_image_type, extract_image_url, image_extension, transcode, TranscodeError};
