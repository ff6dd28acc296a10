//! Shared helpers.
//!
//! - **URL validation**: media references and API base URLs from the backend
//! - **Task panics**: converting a panicking background task into an error value

mod task;
mod url_validator;

pub use task::catch_task_panic;
pub use url_validator::{validate_media_url, UrlValidationError};
