use super::sse::{parse_line, LineDecoder};
use super::{
    BackendError, ChatBackend, EventStream, PromptReply, PromptRequest, StreamEvent,
    WebSearchResults,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    /// Upper bound for every non-streaming call.
    pub request_timeout: Duration,
}

impl HttpConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Serialize)]
struct WebSearchRequest<'a> {
    query: &'a str,
}

/// `ChatBackend` over the backend's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    config: HttpConfig,
}

impl HttpBackend {
    pub fn new(config: HttpConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

async fn check_status(resp: Response) -> Result<Response, BackendError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let message = resp.text().await.unwrap_or_default();
    Err(BackendError::Api { status, message })
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn send_prompt(&self, request: &PromptRequest) -> Result<PromptReply, BackendError> {
        let mut body = request.clone();
        body.stream = false;

        let resp = self
            .client
            .post(self.url("chat"))
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn stream_prompt(&self, request: &PromptRequest) -> Result<EventStream, BackendError> {
        let mut body = request.clone();
        body.stream = true;

        let resp = self
            .client
            .post(self.url("chat"))
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let mut bytes = resp.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = LineDecoder::new();
            loop {
                let (lines, exhausted) = match bytes.next().await {
                    Some(Ok(chunk)) => (decoder.push(&chunk), false),
                    Some(Err(e)) => {
                        yield Err(BackendError::from(e));
                        return;
                    }
                    None => (decoder.finish().into_iter().collect::<Vec<_>>(), true),
                };

                for line in lines {
                    match parse_line(&line) {
                        Ok(Some(event)) => {
                            let terminal = !matches!(event, StreamEvent::Chunk(_));
                            yield Ok(event);
                            if terminal {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "skipping unparseable stream line"),
                    }
                }

                if exhausted {
                    debug!("stream ended without a terminal event");
                    yield Ok(StreamEvent::Done);
                    return;
                }
            }
        };
        Ok(stream.boxed())
    }

    async fn upload_files(
        &self,
        conversation_id: &str,
        files: &[PathBuf],
    ) -> Result<(), BackendError> {
        let mut form = Form::new().text("chat_id", conversation_id.to_string());
        for path in files {
            let bytes = tokio::fs::read(path).await?;
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("file.pdf")
                .to_string();
            let part = Part::bytes(bytes)
                .file_name(filename)
                .mime_str("application/pdf")?;
            form = form.part("files", part);
        }

        let resp = self
            .client
            .post(self.url("upload_pdf"))
            .timeout(self.config.request_timeout)
            .multipart(form)
            .send()
            .await?;
        check_status(resp).await?;
        debug!(conversation_id, count = files.len(), "uploaded files");
        Ok(())
    }

    async fn delete_files_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<(), BackendError> {
        let resp = self
            .client
            .post(self.url("delete_files_for_conversation"))
            .timeout(self.config.request_timeout)
            .query(&[("conversation_id", conversation_id)])
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn web_search(&self, query: &str) -> Result<WebSearchResults, BackendError> {
        let resp = self
            .client
            .post(self.url("websearch"))
            .timeout(self.config.request_timeout)
            .json(&WebSearchRequest { query })
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await?)
    }
}
