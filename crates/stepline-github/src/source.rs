//! GitHub REST issues endpoint as a [`PageSource`]

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use stepline_core::{
    HttpConfig, PageRequest, PageSource, RateLimit, RawResponse, SHARED_RUNTIME, SettingsError,
    TransportError, build_client,
};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// GitHub caps `per_page` at 100
pub const MAX_PER_PAGE: u32 = 100;

const ACCEPT_V3: &str = "application/vnd.github.v3+json";

/// Connection details for one repository
#[derive(Clone)]
pub struct GithubSettings {
    pub api_url: String,
    pub token: String,
    pub owner: String,
    pub repo: String,
    pub user_agent: String,
    pub http: HttpConfig,
}

impl std::fmt::Debug for GithubSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubSettings")
            .field("api_url", &self.api_url)
            .field("token", &if self.token.is_empty() { "" } else { "***" })
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("user_agent", &self.user_agent)
            .field("http", &self.http)
            .finish()
    }
}

impl GithubSettings {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: token.into(),
            owner: owner.into(),
            repo: repo.into(),
            user_agent: concat!("stepline/", env!("CARGO_PKG_VERSION")).to_string(),
            http: HttpConfig::default(),
        }
    }

    /// Reject settings that cannot produce a valid request
    pub fn validate(&self, per_page: u32) -> Result<(), SettingsError> {
        for (name, value) in [
            ("owner", &self.owner),
            ("repo", &self.repo),
            ("token", &self.token),
            ("api_url", &self.api_url),
        ] {
            if value.trim().is_empty() {
                return Err(SettingsError(format!("github {name} is not set")));
            }
        }
        for (name, value) in [("owner", &self.owner), ("repo", &self.repo)] {
            let url_safe = value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
            if !url_safe || value == "." || value == ".." {
                return Err(SettingsError(format!(
                    "github {name} {value:?} must be ASCII letters, digits, '.', '_' or '-'"
                )));
            }
        }
        if self.http.connect_timeout > self.http.read_timeout {
            return Err(SettingsError(format!(
                "connect timeout {:?} exceeds request timeout {:?}",
                self.http.connect_timeout, self.http.read_timeout
            )));
        }
        if !(1..=MAX_PER_PAGE).contains(&per_page) {
            return Err(SettingsError(format!(
                "per_page must be between 1 and {MAX_PER_PAGE}, got {per_page}"
            )));
        }
        Ok(())
    }

    /// `owner/repo`
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    fn issues_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/issues",
            self.api_url.trim_end_matches('/'),
            self.owner,
            self.repo
        )
    }
}

/// Issues of one repository, oldest update first, including closed ones.
///
/// The bearer token lives only in the client's default headers.
pub struct GithubIssuesSource {
    client: reqwest::Client,
    url: String,
    slug: String,
}

impl GithubIssuesSource {
    pub fn new(settings: &GithubSettings) -> Result<Self, SettingsError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", settings.token.trim()))
            .map_err(|_| SettingsError("github token contains invalid characters".into()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_V3));

        let client = build_client(&settings.http, &settings.user_agent, headers)
            .map_err(|e| SettingsError(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: settings.issues_url(),
            slug: settings.slug(),
        })
    }

    async fn get(&self, request: &PageRequest) -> Result<RawResponse, reqwest::Error> {
        let resp = self
            .client
            .get(&self.url)
            .query(&[
                ("state", "all"),
                ("since", request.since.as_str()),
                ("sort", "updated"),
                ("direction", "asc"),
            ])
            .query(&[("per_page", request.per_page), ("page", request.page)])
            .send()
            .await?;
        let status = resp.status().as_u16();
        let rate_limit = RateLimit::from_headers(resp.headers());
        let body = resp.text().await?;
        Ok(RawResponse {
            status,
            body,
            rate_limit,
        })
    }
}

impl PageSource for GithubIssuesSource {
    fn get_page(&self, request: &PageRequest) -> Result<RawResponse, TransportError> {
        log::debug!("GET {} page {}", self.slug, request.page);
        SHARED_RUNTIME
            .handle()
            .block_on(self.get(request))
            .map_err(TransportError::from_reqwest)
    }

    fn target(&self) -> String {
        self.slug.clone()
    }
}
