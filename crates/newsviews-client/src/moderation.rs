use std::path::{Path, PathBuf};

use async_trait::async_trait;
use newsviews_core::capabilities::{ModerationService, ModerationVerdict};
use newsviews_core::config::{HttpConfig, ModerationConfig};
use newsviews_core::error::AppError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::images::{confined, locate, ImageLocation};

const SYSTEM_PROMPT: &str = "You are an image moderator for a public news website. \
You will be given an uploaded image or a description of one. Respond with APPROPRIATE \
or INAPPROPRIATE, followed by a short reason when the image is inappropriate.";

/// HTTP client for an OpenAI-compatible chat completions endpoint, used as
/// the image moderation service.
///
/// Local files are checked before any remote call. A reference outside the
/// image root, a missing file or one above the configured size limit is
/// inappropriate without asking the service. Remote images are sent by URL;
/// local images are described by name and size.
///
/// Service failures never surface as errors. They come back as
/// [`ModerationVerdict::Unavailable`], which the content gate treats as a
/// soft pass.
#[derive(Clone)]
pub struct ChatModerationClient {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: String,
    max_file_size_bytes: u64,
    timeout_secs: u64,
    image_root: Option<PathBuf>,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

/// Result of the checks on a local image file.
#[derive(Debug, PartialEq)]
enum LocalCheck {
    Verdict(ModerationVerdict),
    NeedsReview { size: u64 },
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl ChatModerationClient {
    /// Creates a moderation client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidUrl` if the endpoint cannot be parsed.
    /// Returns `AppError::ClientError` if the HTTP client cannot be built.
    pub fn new(
        config: &ModerationConfig,
        http: &HttpConfig,
        api_key: &str,
    ) -> Result<Self, AppError> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|_| AppError::InvalidUrl(config.endpoint.clone()))?;

        let client = Client::builder()
            .timeout(http.timeout())
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            model: config.model.clone(),
            api_key: api_key.to_string(),
            max_file_size_bytes: config.max_file_size_bytes(),
            timeout_secs: http.timeout_secs,
            image_root: None,
        })
    }

    /// Directory that relative image references resolve against.
    pub fn with_image_root(mut self, root: Option<PathBuf>) -> Self {
        self.image_root = root;
        self
    }

    async fn check_local_file(&self, path: &Path, root: &Path) -> LocalCheck {
        let resolved = match confined(path, root).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => {
                return LocalCheck::Verdict(ModerationVerdict::Inappropriate {
                    reason: "Image path escapes the upload directory".to_string(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return LocalCheck::Verdict(ModerationVerdict::Inappropriate {
                    reason: "Image file not found".to_string(),
                });
            }
            Err(e) => {
                return LocalCheck::Verdict(ModerationVerdict::Unavailable {
                    reason: format!("cannot read image file: {}", e),
                });
            }
        };

        let size = match tokio::fs::metadata(&resolved).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                return LocalCheck::Verdict(ModerationVerdict::Unavailable {
                    reason: format!("cannot read image file: {}", e),
                });
            }
        };

        if size > self.max_file_size_bytes {
            return LocalCheck::Verdict(ModerationVerdict::Inappropriate {
                reason: format!(
                    "Image file is too large ({:.1}MB)",
                    size as f64 / (1024.0 * 1024.0)
                ),
            });
        }

        LocalCheck::NeedsReview { size }
    }

    fn build_request(&self, image_reference: &str, local: Option<(&Path, u64)>) -> ChatRequest {
        let user_content = match local {
            Some((path, size)) => MessageContent::Text(describe_local_image(path, size)),
            None => MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "Is this image appropriate for a public news website?".to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_reference.to_string(),
                    },
                },
            ]),
        };

        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(SYSTEM_PROMPT.to_string()),
                },
                ChatMessage {
                    role: "user",
                    content: user_content,
                },
            ],
            max_tokens: 100,
        }
    }

    async fn ask(&self, request: &ChatRequest) -> Result<String, AppError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {}", e))
                } else {
                    AppError::ClientError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                return Err(AppError::RateLimitExceeded);
            }
            if let Ok(api_error) = serde_json::from_str::<ApiError>(&error_text) {
                return Err(AppError::ClientError(format!(
                    "Moderation API error: {}",
                    api_error.error.message
                )));
            }
            return Err(AppError::ClientError(format!(
                "Moderation API error: HTTP {}",
                status
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::ClientError(format!("Failed to parse response: {}", e)))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(AppError::EmptyResponse)
    }
}

#[async_trait]
impl ModerationService for ChatModerationClient {
    async fn moderate(&self, image_reference: &str) -> ModerationVerdict {
        let local = match locate(image_reference, self.image_root.as_deref()) {
            ImageLocation::Remote => None,
            ImageLocation::Refused(reason) => {
                info!(image = %image_reference, %reason, "Local image refused");
                return ModerationVerdict::Inappropriate { reason };
            }
            ImageLocation::Local { root, path } => {
                let check = self.check_local_file(&path, &root).await;
                match check {
                    LocalCheck::Verdict(verdict) => {
                        info!(image = %image_reference, ?verdict, "Local image check decided");
                        return verdict;
                    }
                    LocalCheck::NeedsReview { size } => Some((path, size)),
                }
            }
        };

        let request = self.build_request(
            image_reference,
            local.as_ref().map(|(path, size)| (path.as_path(), *size)),
        );
        match self.ask(&request).await {
            Ok(answer) => {
                debug!(image = %image_reference, answer = %answer, "Moderation answer");
                parse_verdict(&answer)
            }
            Err(e) => ModerationVerdict::Unavailable {
                reason: e.to_string(),
            },
        }
    }
}

fn describe_local_image(path: &Path, size: u64) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());

    format!(
        "Based on this information about an uploaded image, is it likely appropriate for a \
         public news website? File name: {}. Format: {}. Size: {:.2}MB.",
        name,
        extension,
        size as f64 / (1024.0 * 1024.0)
    )
}

/// Maps a free-text chat answer onto a verdict.
///
/// `INAPPROPRIATE` wins over `APPROPRIATE` (which it contains); an answer
/// with neither word is treated as the service being unavailable.
fn parse_verdict(answer: &str) -> ModerationVerdict {
    let answer = answer.trim();
    let upper = answer.to_uppercase();

    if upper.contains("INAPPROPRIATE") {
        let rest = if upper.starts_with("INAPPROPRIATE") {
            answer.get("INAPPROPRIATE".len()..).unwrap_or("")
        } else {
            answer
        };
        let reason = rest.trim_start_matches([':', '-', '.', ' ']).trim();
        let reason = if reason.is_empty() {
            "flagged by moderation service".to_string()
        } else {
            reason.to_string()
        };
        return ModerationVerdict::Inappropriate { reason };
    }

    if upper.contains("APPROPRIATE") {
        return ModerationVerdict::Appropriate;
    }

    ModerationVerdict::Unavailable {
        reason: format!("unrecognised moderation answer: {}", answer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn client(max_file_size_mb: u64) -> ChatModerationClient {
        let config = ModerationConfig {
            max_file_size_mb,
            ..ModerationConfig::default()
        };
        ChatModerationClient::new(&config, &HttpConfig::default(), "test-key").unwrap()
    }

    fn rooted_client(max_file_size_mb: u64, root: &Path) -> ChatModerationClient {
        client(max_file_size_mb).with_image_root(Some(root.to_path_buf()))
    }

    fn inappropriate_reason(verdict: ModerationVerdict) -> String {
        match verdict {
            ModerationVerdict::Inappropriate { reason } => reason,
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_parse_verdict() {
        assert_eq!(parse_verdict("APPROPRIATE"), ModerationVerdict::Appropriate);
        assert_eq!(parse_verdict(" appropriate.\n"), ModerationVerdict::Appropriate);
        assert_eq!(
            parse_verdict("INAPPROPRIATE: graphic violence"),
            ModerationVerdict::Inappropriate {
                reason: "graphic violence".to_string()
            }
        );
        assert_eq!(
            parse_verdict("Inappropriate"),
            ModerationVerdict::Inappropriate {
                reason: "flagged by moderation service".to_string()
            }
        );
        assert!(matches!(
            parse_verdict("I cannot tell"),
            ModerationVerdict::Unavailable { .. }
        ));
    }

    #[test]
    fn test_new_rejects_bad_endpoint() {
        let config = ModerationConfig {
            endpoint: "not a url".to_string(),
            ..ModerationConfig::default()
        };
        let result = ChatModerationClient::new(&config, &HttpConfig::default(), "k");
        assert!(matches!(result, Err(AppError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_missing_local_file_is_inappropriate() {
        let dir = tempfile::tempdir().unwrap();

        let verdict = rooted_client(20, dir.path()).moderate("gone.jpg").await;
        assert_eq!(
            verdict,
            ModerationVerdict::Inappropriate {
                reason: "Image file not found".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_oversized_local_file_is_inappropriate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.jpg"), vec![0u8; 1024 * 1024 + 1]).unwrap();

        let verdict = rooted_client(1, dir.path()).moderate("big.jpg").await;
        assert!(inappropriate_reason(verdict).contains("too large"));
    }

    #[tokio::test]
    async fn test_small_local_file_needs_remote_check() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("photo.jpg"), b"jpeg bytes").unwrap();

        let check = client(1)
            .check_local_file(&dir.path().join("photo.jpg"), dir.path())
            .await;
        assert_eq!(check, LocalCheck::NeedsReview { size: 10 });
    }

    #[tokio::test]
    async fn test_references_outside_root_are_inappropriate() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        std::fs::create_dir(&uploads).unwrap();
        let outside = dir.path().join("secret.jpg");
        std::fs::write(&outside, b"jpeg bytes").unwrap();

        let client = rooted_client(20, &uploads);
        let relative = inappropriate_reason(client.moderate("../secret.jpg").await);
        assert!(relative.contains("escapes the upload directory"));
        let absolute = inappropriate_reason(client.moderate(outside.to_str().unwrap()).await);
        assert!(absolute.contains("escapes the upload directory"));
    }

    #[tokio::test]
    async fn test_local_reference_without_root_is_inappropriate() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"jpeg bytes").unwrap();

        let verdict = client(20).moderate(file.path().to_str().unwrap()).await;
        assert_eq!(
            inappropriate_reason(verdict),
            "no image directory configured"
        );
    }

    #[test]
    fn test_remote_image_request_carries_url() {
        let request = client(20).build_request("https://cdn.example.com/a.jpg", None);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["messages"][0]["role"], "system");
        let parts = &json["messages"][1]["content"];
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "https://cdn.example.com/a.jpg");
    }

    #[test]
    fn test_local_image_request_is_described() {
        let request = client(20).build_request(
            "uploads/photo.PNG",
            Some((Path::new("/srv/uploads/photo.PNG"), 2 * 1024 * 1024)),
        );
        let json = serde_json::to_value(&request).unwrap();
        let text = json["messages"][1]["content"].as_str().unwrap();
        assert!(text.contains("photo.PNG"));
        assert!(text.contains("Format: png"));
        assert!(text.contains("Size: 2.00MB"));
    }

    #[tokio::test]
    async fn test_remote_answer_is_parsed() {
        use httpmock::prelude::*;
        use serde_json::json;

        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer test-key");
                then.status(200).json_body(json!({
                    "choices": [{"message": {"role": "assistant", "content": "INAPPROPRIATE: gore"}}]
                }));
            })
            .await;

        let config = ModerationConfig {
            endpoint: server.url("/v1/chat/completions"),
            ..ModerationConfig::default()
        };
        let client = ChatModerationClient::new(&config, &HttpConfig::default(), "test-key").unwrap();

        let verdict = client.moderate("https://cdn.example.com/a.jpg").await;
        mock.assert_async().await;
        assert_eq!(
            verdict,
            ModerationVerdict::Inappropriate {
                reason: "gore".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        let config = ModerationConfig {
            endpoint: "http://127.0.0.1:9/v1/chat/completions".to_string(),
            ..ModerationConfig::default()
        };
        let client = ChatModerationClient::new(&config, &HttpConfig::default(), "k").unwrap();

        let verdict = client.moderate("https://cdn.example.com/a.jpg").await;
        assert!(matches!(verdict, ModerationVerdict::Unavailable { .. }));
    }
}
