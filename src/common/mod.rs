//! Common utilities and types

pub mod country;
pub mod error;

pub use country::{sanitize_city, CountryCode, UNKNOWN_CITY};
pub use error::{Error, Result};
