//! Shrinks the URLs in a status update by handing each one to an external
//! helper process (`bti-shrink-urls`) and splicing back any shorter result.

pub mod config;
pub mod error;
pub mod helper;
pub mod locator;
pub mod shrinker;

pub use error::{PatternError, ShortenFailure, SpawnError};
pub use helper::{Candidate, HelperConfig, HelperSession, UrlShortener};
pub use locator::{Span, UrlLocator, UrlPattern, URL_PATTERN};
pub use shrinker::{splice, ShrinkReport, Shrinker};
