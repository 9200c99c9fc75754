use std::time::Duration;

use super::RemoteError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// Blocking HTTP seam. Non-2xx statuses are replies, not errors; only a
/// failure to get any reply at all is an `Err`.
pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &str, timeout: Duration) -> Result<HttpReply, RemoteError>;

    fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<HttpReply, RemoteError>;
}

#[derive(Debug, Default)]
pub struct UreqTransport;

impl UreqTransport {
    fn agent(timeout: Duration) -> ureq::Agent {
        ureq::AgentBuilder::new().timeout(timeout).build()
    }

    fn into_reply(result: Result<ureq::Response, ureq::Error>) -> Result<HttpReply, RemoteError> {
        match result {
            Ok(response) => {
                let status = response.status();
                let body = response
                    .into_string()
                    .map_err(|e| RemoteError::Transport(format!("failed to read body: {}", e)))?;
                Ok(HttpReply { status, body })
            }
            Err(ureq::Error::Status(status, response)) => Ok(HttpReply {
                status,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(t)) => Err(RemoteError::Transport(t.to_string())),
        }
    }
}

impl HttpTransport for UreqTransport {
    fn get(&self, url: &str, timeout: Duration) -> Result<HttpReply, RemoteError> {
        Self::into_reply(Self::agent(timeout).get(url).call())
    }

    fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<HttpReply, RemoteError> {
        Self::into_reply(
            Self::agent(timeout)
                .post(url)
                .set("Content-Type", "application/json")
                .send_json(body),
        )
    }
}
