use std::io::Write;

use clap::Parser;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::error::{CliError, CliResult};
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct AskCommand {
    #[clap(help = "Question to send")]
    pub query: String,

    #[clap(long, short, default_value = "/", help = "Route path on the relay")]
    pub route: String,

    #[clap(long, short, help = "Stream the answer as it arrives")]
    pub stream: bool,

    #[clap(long, help = "Override the route's model")]
    pub model: Option<String>,

    #[clap(long, help = "Override the route's system prompt")]
    pub prompt: Option<String>,

    #[clap(long, help = "Named profile of the route")]
    pub profile: Option<String>,

    #[clap(
        long,
        env = "CHATRELAY_URL",
        default_value = "http://127.0.0.1:9000",
        help = "Relay base URL"
    )]
    pub url: String,

    #[clap(long, env = "CHATRELAY_KEY", help = "Bearer token for the relay")]
    pub key: Option<String>,

    #[clap(long, default_value = "auth-key", help = "Header carrying the token")]
    pub header: String,
}

impl AskCommand {
    pub async fn execute(&self, format: OutputFormat) -> CliResult<()> {
        let client = reqwest::Client::new();

        if self.stream {
            let mut stdout = std::io::stdout();
            let mut body = self.send(&client).await?.bytes_stream();
            while let Some(chunk) = body.next().await {
                stdout.write_all(&chunk?)?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
            return Ok(());
        }

        let answer = self.fetch_answer(&client).await?;
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&json!(answer))?),
            OutputFormat::Table => println!("{answer}"),
        }

        Ok(())
    }

    /// Non-streaming answer text
    pub async fn fetch_answer(&self, client: &reqwest::Client) -> CliResult<String> {
        let answer: Value = self.send(client).await?.json().await?;
        answer
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CliError(format!("Unexpected answer: {answer}")))
    }

    async fn send(&self, client: &reqwest::Client) -> CliResult<reqwest::Response> {
        let mut request = client.post(self.endpoint()).json(&self.body());
        if let Some(key) = &self.key {
            request = request.header(self.header.as_str(), format!("Bearer {key}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(CliError(describe_error(status.as_u16(), &body)))
    }

    fn endpoint(&self) -> String {
        let route = if self.route.starts_with('/') {
            self.route.clone()
        } else {
            format!("/{}", self.route)
        };
        format!("{}{}", self.url.trim_end_matches('/'), route)
    }

    fn body(&self) -> Value {
        let mut body = json!({
            "query": self.query,
            "stream": self.stream,
        });
        for (field, value) in [
            ("model", &self.model),
            ("prompt", &self.prompt),
            ("profile", &self.profile),
        ] {
            if let Some(value) = value {
                body[field] = json!(value);
            }
        }
        body
    }
}

/// Render a relay error body as one line
fn describe_error(status: u16, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));

    match error {
        Some(error) => format!(
            "{}: {} (HTTP {status})",
            error["kind"].as_str().unwrap_or("Error"),
            error["message"].as_str().unwrap_or_default()
        ),
        None => format!("Relay returned HTTP {status}: {body}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    fn command(url: &str) -> AskCommand {
        AskCommand {
            query: "门票多少钱".to_string(),
            route: "fast".to_string(),
            stream: false,
            model: None,
            prompt: None,
            profile: Some("night".to_string()),
            url: url.to_string(),
            key: Some("k1".to_string()),
            header: "auth-key".to_string(),
        }
    }

    #[test]
    fn test_endpoint_and_body() {
        let cmd = command("http://localhost:9000/");
        assert_eq!(cmd.endpoint(), "http://localhost:9000/fast");
        assert_eq!(
            cmd.body(),
            json!({"query": "门票多少钱", "stream": false, "profile": "night"})
        );
    }

    #[test]
    fn test_describe_error() {
        assert_eq!(
            describe_error(401, r#"{"error":{"kind":"AuthError","message":"Invalid key"}}"#),
            "AuthError: Invalid key (HTTP 401)"
        );
        assert_eq!(
            describe_error(502, "Bad Gateway"),
            "Relay returned HTTP 502: Bad Gateway"
        );
    }

    #[tokio::test]
    async fn test_fetch_answer() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/fast"))
            .and(matchers::header("auth-key", "Bearer k1"))
            .and(matchers::body_partial_json(json!({"query": "门票多少钱"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!("成人票60元。")))
            .expect(1)
            .mount(&server)
            .await;

        let answer = command(&server.uri())
            .fetch_answer(&reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(answer, "成人票60元。");
    }

    #[tokio::test]
    async fn test_fetch_answer_error() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(
                json!({"error": {"kind": "AuthError", "message": "Invalid key"}}),
            ))
            .mount(&server)
            .await;

        let err = command(&server.uri())
            .fetch_answer(&reqwest::Client::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "AuthError: Invalid key (HTTP 401)");
    }
}
