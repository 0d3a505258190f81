//! Remote worker reached through an HTTP API.
//!
//! Request: `POST <endpoint>` with `{prompt, cwd, resume_id, timeout_ms}`.
//! Response: `{stdout, stderr?, exit_code?}`; a body that is not shaped like
//! that is taken verbatim as stdout of a successful run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{AgentError, AgentHandle, ExecOptions, ExecOutput};

#[derive(Serialize)]
struct ExecRequest<'a> {
    prompt: &'a str,
    cwd: Option<String>,
    resume_id: Option<&'a str>,
    timeout_ms: u64,
}

#[derive(Deserialize)]
struct ExecReply {
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default = "default_exit_code")]
    exit_code: Option<i32>,
}

fn default_exit_code() -> Option<i32> {
    Some(0)
}

pub struct HttpAgent {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    client: ureq::Agent,
    released: AtomicBool,
}

impl HttpAgent {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        let client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .build();
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            api_key,
            client,
            released: AtomicBool::new(false),
        }
    }

    fn map_error(&self, err: ureq::Error, timeout: Duration) -> AgentError {
        let worker = self.name.clone();
        match err {
            ureq::Error::Status(status, resp) => {
                let body = resp.into_string().unwrap_or_default();
                match status {
                    401 | 403 => AgentError::Auth {
                        worker,
                        message: format!("HTTP {status}"),
                    },
                    429 => AgentError::RateLimited {
                        worker,
                        message: format!("HTTP 429: {}", body.trim()),
                    },
                    _ => AgentError::Http {
                        worker,
                        status,
                        body: body.trim().to_string(),
                    },
                }
            }
            ureq::Error::Transport(transport) => {
                let message = transport.to_string();
                if message.contains("timed out") {
                    AgentError::Timeout { worker, timeout }
                } else {
                    AgentError::Failed { worker, message }
                }
            }
        }
    }
}

impl AgentHandle for HttpAgent {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(worker = %self.name, endpoint = %self.endpoint))]
    fn execute(&self, prompt: &str, options: &ExecOptions) -> Result<ExecOutput, AgentError> {
        if !self.is_alive() {
            return Err(AgentError::Released {
                worker: self.name.clone(),
            });
        }
        info!("invoking http worker");
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(options.timeout)
            .set("Content-Type", "application/json");
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }
        let payload = ExecRequest {
            prompt,
            cwd: options.cwd.as_ref().map(|dir| dir.display().to_string()),
            resume_id: options.resume_id.as_deref(),
            timeout_ms: u64::try_from(options.timeout.as_millis()).unwrap_or(u64::MAX),
        };
        let response = request
            .send_json(&payload)
            .map_err(|err| self.map_error(err, options.timeout))?;
        let body = response.into_string().map_err(|err| AgentError::Failed {
            worker: self.name.clone(),
            message: format!("read response body: {err}"),
        })?;

        let output = match serde_json::from_str::<ExecReply>(&body) {
            Ok(reply) => ExecOutput {
                exit_code: reply.exit_code,
                stdout: reply.stdout,
                stderr: reply.stderr,
            },
            Err(_) => {
                debug!("response is not an exec reply, using body as stdout");
                ExecOutput {
                    exit_code: Some(0),
                    stdout: body,
                    stderr: String::new(),
                }
            }
        };
        if !output.success() {
            warn!(exit_code = ?output.exit_code, "http worker reported failure");
        }
        Ok(output)
    }

    fn kill(&self) -> anyhow::Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::ErrorKind;
    use mockito::Matcher;
    use serde_json::json;

    fn options() -> ExecOptions {
        let mut options = ExecOptions::new(Duration::from_secs(5));
        options.resume_id = Some("sess-1".to_string());
        options.cwd = Some("/work/repo".into());
        options
    }

    #[test]
    fn posts_prompt_and_parses_reply() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/exec")
            .match_header("authorization", "Bearer k")
            .match_body(Matcher::Json(json!({
                "prompt": "do it",
                "cwd": "/work/repo",
                "resume_id": "sess-1",
                "timeout_ms": 5_000,
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"stdout":"{\"done\":true}","exit_code":0}"#)
            .create();

        let agent = HttpAgent::new("api", format!("{}/exec", server.url()), Some("k".to_string()));
        let value = agent.execute_structured("do it", &options()).expect("structured");
        assert_eq!(value["done"], true);
        mock.assert();
    }

    #[test]
    fn unshaped_body_is_taken_as_stdout() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/exec")
            .with_status(200)
            .with_body(r#"{"pr_url":"https://example.test/pr/1"}"#)
            .create();

        let agent = HttpAgent::new("api", format!("{}/exec", server.url()), None);
        let output = agent.execute("x", &options()).expect("execute");
        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.contains("pr_url"));
        mock.assert();
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        for (status, kind) in [
            (401, ErrorKind::Auth),
            (403, ErrorKind::Auth),
            (429, ErrorKind::RateLimit),
            (500, ErrorKind::Execution),
        ] {
            let mut server = mockito::Server::new();
            let mock = server
                .mock("POST", "/exec")
                .with_status(status)
                .with_body("{}")
                .create();
            let agent = HttpAgent::new("api", format!("{}/exec", server.url()), None);
            let err = agent.execute("x", &options()).unwrap_err();
            assert_eq!(err.kind(), kind, "{status}");
            mock.assert();
        }
    }

    #[test]
    fn released_agent_refuses_calls() {
        let agent = HttpAgent::new("api", "http://127.0.0.1:9/", None);
        agent.kill().expect("kill");
        let err = agent.execute("x", &options()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Released);
    }
}
