//! Typed Rust client for the Google Compute Engine REST API.
//!
//! Covers the subset needed for leasing desktop VMs:
//! instances (insert, get, start, stop, delete), images (insert, get,
//! delete) and zone operations (wait).

mod types;

pub use types::*;

const BASE_URL: &str = "https://compute.googleapis.com/compute/v1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("compute api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("compute api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("compute operation {operation} failed: {message}")]
    Operation { operation: String, message: String },
}

impl Error {
    /// HTTP status of an API error, if the request reached the API at all.
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status().is_some_and(|s| s.as_u16() == 404)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the Compute Engine REST API, scoped to one project.
#[derive(Clone)]
pub struct GceClient {
    token: String,
    project: String,
    base_url: String,
    http: reqwest::Client,
}

impl GceClient {
    pub fn new(token: impl Into<String>, project: impl Into<String>) -> Self {
        Self::with_base_url(token, project, BASE_URL)
    }

    /// Point the client at a different endpoint (emulators, tests).
    pub fn with_base_url(
        token: impl Into<String>,
        project: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            project: project.into(),
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn url(&self, path: &str) -> String {
        format!("{}/projects/{}{path}", self.base_url, self.project)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    /// Surface a finished operation's error list as an `Error::Operation`.
    fn finished(op: Operation) -> Result<Operation> {
        match op.error_message() {
            Some(message) => Err(Error::Operation {
                operation: op.name,
                message,
            }),
            None => Ok(op),
        }
    }

    // ── Instances ────────────────────────────────────────────────────

    pub async fn insert_instance(&self, zone: &str, req: &InsertInstanceRequest) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url(&format!("/zones/{zone}/instances")))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        let op: Operation = Self::check(resp, "insert instance").await?.json().await?;
        Self::finished(op)
    }

    pub async fn get_instance(&self, zone: &str, name: &str) -> Result<Instance> {
        let resp = self
            .http
            .get(self.url(&format!("/zones/{zone}/instances/{name}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "get instance")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn start_instance(&self, zone: &str, name: &str) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url(&format!("/zones/{zone}/instances/{name}/start")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        let op: Operation = Self::check(resp, "start instance").await?.json().await?;
        Self::finished(op)
    }

    pub async fn stop_instance(&self, zone: &str, name: &str) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url(&format!("/zones/{zone}/instances/{name}/stop")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        let op: Operation = Self::check(resp, "stop instance").await?.json().await?;
        Self::finished(op)
    }

    pub async fn delete_instance(&self, zone: &str, name: &str) -> Result<Operation> {
        let resp = self
            .http
            .delete(self.url(&format!("/zones/{zone}/instances/{name}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        let op: Operation = Self::check(resp, "delete instance").await?.json().await?;
        Self::finished(op)
    }

    // ── Images ───────────────────────────────────────────────────────

    /// Start an image build from a disk. `forceCreate` allows imaging the
    /// boot disk of a running VM.
    pub async fn insert_image(&self, req: &InsertImageRequest) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url("/global/images"))
            .header("Authorization", self.auth())
            .query(&[("forceCreate", "true")])
            .json(req)
            .send()
            .await?;

        let op: Operation = Self::check(resp, "insert image").await?.json().await?;
        Self::finished(op)
    }

    pub async fn get_image(&self, name: &str) -> Result<Image> {
        let resp = self
            .http
            .get(self.url(&format!("/global/images/{name}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "get image")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn delete_image(&self, name: &str) -> Result<Operation> {
        let resp = self
            .http
            .delete(self.url(&format!("/global/images/{name}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        let op: Operation = Self::check(resp, "delete image").await?.json().await?;
        Self::finished(op)
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Block server-side (up to ~2 minutes) until a zonal operation is DONE
    /// or the wait deadline passes; returns the operation either way.
    pub async fn wait_zone_operation(&self, zone: &str, operation: &str) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url(&format!("/zones/{zone}/operations/{operation}/wait")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        let op: Operation = Self::check(resp, "wait operation").await?.json().await?;
        Self::finished(op)
    }
}
