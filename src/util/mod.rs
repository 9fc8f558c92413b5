//! Utility functions for common operations.
//!
//! - **URL validation**: feed URLs must parse and use http(s)
//! - **Host extraction**: used for same-host pacing between fetches

mod url_validator;

pub use url_validator::{host_of, validate_url, UrlValidationError};
