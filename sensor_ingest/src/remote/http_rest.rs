use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response, Url};
use serde::{Serialize, de::DeserializeOwned};
use shared_utils::env::get_env_var;

use crate::{
    errors::Error,
    models::{
        api::{ErrorEnvelope, SessionStatus, Snapshot, TimeResponse},
        session::{FinalSummary, Session, SessionConfig},
    },
    remote::{ByteStream, RemoteError, RemoteNode},
};

/// Environment variable consulted by [`HttpRemote::from_env`].
pub const ENDPOINT_ENV: &str = "SESSION_SYNC_ENDPOINT";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY: usize = 512;

/// `reqwest`-backed [`RemoteNode`].
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base: Url,
}

impl HttpRemote {
    /// Creates a client for `endpoint` (e.g. `http://10.0.0.2:8080`).
    ///
    /// `timeout` bounds every request, including the full body of file downloads.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let mut base = Url::parse(endpoint.trim())
            .map_err(|_| RemoteError::InvalidEndpoint(endpoint.to_string()))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(RemoteError::InvalidEndpoint(endpoint.to_string()));
        }
        // Url::join treats the last segment as a file unless the path ends in '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    /// Creates a client from the `SESSION_SYNC_ENDPOINT` environment variable.
    pub fn from_env() -> Result<Self, Error> {
        let endpoint = get_env_var(ENDPOINT_ENV)?;
        Ok(Self::new(&endpoint, DEFAULT_TIMEOUT)?)
    }

    /// Base URL every request is resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> Result<Url, RemoteError> {
        self.base
            .join(path)
            .map_err(|_| RemoteError::InvalidEndpoint(format!("{}{path}", self.base)))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, RemoteError> {
        let response = self.client.get(url).query(query).send().await?;
        let response = check_status(response).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn post_json<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        url: Url,
        body: Option<&B>,
    ) -> Result<T, RemoteError> {
        let mut request = self.client.post(url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = check_status(request.send().await?).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    fn session_url(&self, session_id: &str, action: Option<&str>) -> Result<Url, RemoteError> {
        let mut url = self.url("sessions/")?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RemoteError::InvalidEndpoint(self.base.to_string()))?;
            segments.pop_if_empty().push(session_id);
            if let Some(action) = action {
                segments.push(action);
            }
        }
        Ok(url)
    }
}

/// Turns non-success responses into [`RemoteError::Api`] (envelope) or [`RemoteError::Status`].
async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(env) => Err(RemoteError::Api {
            status: status.as_u16(),
            code: env.error_code,
            detail: env.detail,
        }),
        Err(_) => Err(RemoteError::Status {
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY).collect(),
        }),
    }
}

#[async_trait]
impl RemoteNode for HttpRemote {
    async fn snapshot(&self, session_id: &str, since_index: u64) -> Result<Snapshot, RemoteError> {
        let url = self.url("snapshots")?;
        self.get_json(
            url,
            &[
                ("session_id", session_id.to_string()),
                ("since_index", since_index.to_string()),
            ],
        )
        .await
    }

    async fn fetch_file(&self, session_id: &str, name: &str) -> Result<ByteStream, RemoteError> {
        let mut url = self.url("files/")?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidEndpoint(self.base.to_string()))?
            .pop_if_empty()
            .push(session_id)
            .push(name);
        let response = self.client.get(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.bytes_stream().map_err(RemoteError::from).boxed())
    }

    async fn session_status(&self, session_id: &str) -> Result<SessionStatus, RemoteError> {
        let url = self.session_url(session_id, None)?;
        self.get_json(url, &[]).await
    }

    async fn start_session(&self, config: &SessionConfig) -> Result<Session, RemoteError> {
        let url = self.url("sessions")?;
        self.post_json(url, Some(config)).await
    }

    async fn stop_session(&self, session_id: &str) -> Result<FinalSummary, RemoteError> {
        let url = self.session_url(session_id, Some("stop"))?;
        self.post_json::<_, ()>(url, None).await
    }

    async fn server_time(&self) -> Result<TimeResponse, RemoteError> {
        let url = self.url("time")?;
        self.get_json(url, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn base_url_gains_trailing_slash() {
        let remote = HttpRemote::new("http://10.0.0.2:8080/node", DEFAULT_TIMEOUT).unwrap();
        assert_eq!(remote.base_url().as_str(), "http://10.0.0.2:8080/node/");
        assert_eq!(
            remote.url("snapshots").unwrap().as_str(),
            "http://10.0.0.2:8080/node/snapshots"
        );
        assert_eq!(
            remote.session_url("abc", Some("stop")).unwrap().as_str(),
            "http://10.0.0.2:8080/node/sessions/abc/stop"
        );
    }

    #[test]
    fn rejects_non_http_endpoints() {
        assert!(matches!(
            HttpRemote::new("ftp://example.org", DEFAULT_TIMEOUT),
            Err(RemoteError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            HttpRemote::new("not a url", DEFAULT_TIMEOUT),
            Err(RemoteError::InvalidEndpoint(_))
        ));
    }

    #[test]
    #[serial]
    fn from_env_requires_endpoint() {
        unsafe { std::env::remove_var(ENDPOINT_ENV) };
        assert!(matches!(HttpRemote::from_env(), Err(Error::Config(_))));

        unsafe { std::env::set_var(ENDPOINT_ENV, "http://127.0.0.1:9") };
        let remote = HttpRemote::from_env().unwrap();
        assert_eq!(remote.base_url().as_str(), "http://127.0.0.1:9/");
        unsafe { std::env::remove_var(ENDPOINT_ENV) };
    }
}
