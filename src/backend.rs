//! HTTP client for the maush execution backend.

use reqwest::StatusCode;

use crate::protocol::{ExecRequest, ExecResult};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The request never got a response.
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    /// 502 from the proxy in front of the backend.
    #[error("backend unavailable")]
    Unavailable,

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid backend response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Posts execution requests. No retries: every failure ends the execution.
#[derive(Clone, Debug)]
pub struct BackendClient {
    http: reqwest::Client,
    url: String,
}

impl BackendClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn execute(&self, request: &ExecRequest) -> Result<ExecResult, BackendError> {
        let res = self.http.post(&self.url).json(request).send().await?;

        let status = res.status();
        if status == StatusCode::BAD_GATEWAY {
            return Err(BackendError::Unavailable);
        }
        let body = res.text().await?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use httpmock::Method::POST;
    use httpmock::MockServer;

    use super::{BackendClient, BackendError};
    use crate::protocol::{ExecMode, ExecRequest, Sender};

    fn request() -> ExecRequest {
        let sender = Sender::parse("@alice:example.org").unwrap();
        ExecRequest::builder(ExecMode::Language("sh".into()), "echo hi").build(&sender)
    }

    #[tokio::test]
    async fn posts_json_and_parses_result() {
        let server = MockServer::start();
        let exec = server.mock(|when, then| {
            when.method(POST)
                .path("/exec")
                .json_body_partial(r#"{"language":"sh","script":"echo hi","home":"/example.org/alice"}"#);
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true,"duration":2000000,"return":0,"timeout":false,"stdout":"hi\n","stderr":"","devices":{}}"#);
        });

        let client = BackendClient::new(server.url("/exec"));
        let result = client.execute(&request()).await.unwrap();
        assert!(result.ok);
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.duration, 2_000_000);
        exec.assert_hits(1);
    }

    #[tokio::test]
    async fn bad_gateway_is_unavailable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/exec");
            then.status(502).body("<html>bad gateway</html>");
        });

        let client = BackendClient::new(server.url("/exec"));
        let err = client.execute(&request()).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable));
    }

    #[tokio::test]
    async fn other_error_statuses_are_reported() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/exec");
            then.status(500).body("boom");
        });

        let client = BackendClient::new(server.url("/exec"));
        match client.execute(&request()).await.unwrap_err() {
            BackendError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/exec");
            then.status(200).body("not json");
        });

        let client = BackendClient::new(server.url("/exec"));
        let err = client.execute(&request()).await.unwrap_err();
        assert!(matches!(err, BackendError::Decode(_)));
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_transport_error() {
        let client = BackendClient::new("http://127.0.0.1:1/exec");
        let err = client.execute(&request()).await.unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)));
    }
}
