//! GitHub issues as a paginated, time-ordered extraction source

pub mod source;

pub use source::{DEFAULT_API_URL, GithubIssuesSource, GithubSettings, MAX_PER_PAGE};
