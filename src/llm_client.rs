//! Chat-completion clients for the supported LLM providers.
//!
//! Ollama speaks its native `/api/chat` shape; LM Studio and
//! OpenAI-compatible services share the `/chat/completions` shape with
//! Bearer auth. Two call sites exist: transcript review (low
//! temperature, terse system prompt) and summary generation (higher
//! temperature, long structured prompt).

use crate::settings::{AiProvider, AppSettings};
use anyhow::{anyhow, Context, Result};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const REVIEW_SYSTEM_PROMPT: &str = "Respond concisely with only the answer to my question. \
Do not add any extra text, disclaimers, or commentary";

pub const DEFAULT_REVIEW_PROMPT: &str = "Please carefully review this meeting transcript and perform light editing to improve readability while maintaining the original speaker's voice and meaning. Focus on:
- Contextual Correction - Fix obvious transcription errors (e.g., repeated phrases, stray audio artifacts) while keeping industry terms and natural speech patterns
- Grammar Flow - Make minimal grammatical adjustments only when necessary for comprehension
- Duplicate Handling - Remove duplicate lines that appear to be transcription errors (keep intentional repetitions like emphasis)
- Format Retention - Maintain the original timestamp format: [HH:MM:SS][Speaker]Text

Example conversion:
Original: [00:01:07] [speaker] I think this will be our next big hit. [audio artifact]
Edited: [00:01:07] [speaker] I think this will be our next big hit.

Now process this full transcript with light-touch edits: \n\n";

pub const DEFAULT_SUMMARY_PROMPT: &str = "Generate a formal business meeting minutes document. Follow this structure:
- Header: Include meeting title, date, time, location (physical/virtual).
- Attendees: List names and titles/departments (mark absentees if any).
- Meeting Summary:
  - Organize by agenda items, with key discussion points and decisions.
  - Use bullet points for clarity.
- Action Items: Present in a table with columns: Task, Owner, Deadline, Notes.
- Other Notes: Any additional items or follow-ups.
- Footer: Recorder's name and next meeting date (if confirmed).

Requirements:
- Maintain a professional tone.
- Highlight decisions and deadlines in bold.

Transcription format:
[time1] [speaker1] content1
[time2] [] content2
sample:
[00:00:00] [Amy] Hello everyone! Thank you guys for coming to our weekly Student Success Meeting. Let's just get started.
[00:00:00] [] I think that's a great idea. Let's try that next week.

Please create a meeting summary from the following transcription:\n\n";

const MAX_TOKENS: u32 = 4000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60 * 60);

static THINK_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));
static NOTE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<note>.*?</note>").expect("valid regex"));

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// OpenAI-compatible request body, used for LM Studio and OpenAI.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    options: OllamaOptions,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaMessage>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: Option<String>,
}

/// Run the review pass over a transcript and strip any reasoning tags
/// the model leaked into its answer.
pub async fn review_transcript(settings: &AppSettings, transcript: &str) -> Result<String> {
    let prompt = format!("{}{}", DEFAULT_REVIEW_PROMPT, transcript);
    let raw = chat(settings, REVIEW_SYSTEM_PROMPT, &prompt, 0.1).await?;
    Ok(strip_reasoning_tags(&raw))
}

/// Generate a meeting-minutes summary. `prompt_override` (request body)
/// wins over the stored summary prompt, which wins over the default.
pub async fn generate_summary(
    settings: &AppSettings,
    transcript: &str,
    prompt_override: Option<&str>,
) -> Result<String> {
    let prompt = format!(
        "{} {}",
        summary_prompt_prefix(settings, prompt_override),
        transcript
    );
    chat(settings, "", &prompt, 0.5).await
}

fn summary_prompt_prefix<'a>(settings: &'a AppSettings, prompt_override: Option<&'a str>) -> &'a str {
    match prompt_override {
        Some(prompt) if !prompt.trim().is_empty() => prompt,
        _ if !settings.summary_prompt.trim().is_empty() => settings.summary_prompt.as_str(),
        _ => DEFAULT_SUMMARY_PROMPT,
    }
}

pub fn strip_reasoning_tags(text: &str) -> String {
    let without_think = THINK_TAG.replace_all(text, "");
    NOTE_TAG.replace_all(&without_think, "").trim().to_string()
}

async fn chat(
    settings: &AppSettings,
    system_prompt: &str,
    user_prompt: &str,
    temperature: f32,
) -> Result<String> {
    match settings.ai_provider {
        AiProvider::Ollama => ollama_chat(settings, system_prompt, user_prompt, temperature).await,
        AiProvider::Lmstudio => {
            let base = settings.lmstudio_path.trim_end_matches('/');
            let url = format!("{}/v1/chat/completions", base);
            openai_chat(
                &url,
                &settings.lmstudio_api_key,
                &settings.lmstudio_model,
                system_prompt,
                user_prompt,
                temperature,
            )
            .await
        }
        AiProvider::Openai => {
            let base = settings.openai_base_url.trim_end_matches('/');
            let url = format!("{}/chat/completions", base);
            openai_chat(
                &url,
                &settings.openai_api_key,
                &settings.openai_model,
                system_prompt,
                user_prompt,
                temperature,
            )
            .await
        }
    }
}

fn build_client(api_key: &str) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if !api_key.is_empty() {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .context("invalid authorization header value")?,
        );
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client")
}

fn messages(system_prompt: &str, user_prompt: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage {
            role: "system".to_string(),
            content: system_prompt.to_string(),
        },
        ChatMessage {
            role: "user".to_string(),
            content: user_prompt.to_string(),
        },
    ]
}

async fn ollama_chat(
    settings: &AppSettings,
    system_prompt: &str,
    user_prompt: &str,
    temperature: f32,
) -> Result<String> {
    let base = settings.ollama_path.trim_end_matches('/');
    let url = format!("{}/api/chat", base);
    debug!("Sending Ollama chat request to {}", url);

    let request = OllamaChatRequest {
        model: settings.ollama_model.clone(),
        messages: messages(system_prompt, user_prompt),
        options: OllamaOptions { temperature },
        stream: false,
    };

    let client = build_client("")?;
    let response = client
        .post(&url)
        .json(&request)
        .send()
        .await
        .context("Ollama request failed")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        return Err(anyhow!(
            "Ollama request failed with status {}: {}",
            status,
            error_text
        ));
    }

    let completion: OllamaChatResponse = response
        .json()
        .await
        .context("failed to parse Ollama response")?;

    completion
        .message
        .and_then(|message| message.content)
        .ok_or_else(|| anyhow!("invalid response format from Ollama"))
}

async fn openai_chat(
    url: &str,
    api_key: &str,
    model: &str,
    system_prompt: &str,
    user_prompt: &str,
    temperature: f32,
) -> Result<String> {
    debug!("Sending chat completion request to {}", url);

    let request = ChatCompletionRequest {
        model: model.to_string(),
        messages: messages(system_prompt, user_prompt),
        temperature,
        max_tokens: MAX_TOKENS,
    };

    let client = build_client(api_key)?;
    let response = client
        .post(url)
        .json(&request)
        .send()
        .await
        .context("chat completion request failed")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        return Err(anyhow!(
            "chat completion failed with status {}: {}",
            status,
            error_text
        ));
    }

    let completion: ChatCompletionResponse = response
        .json()
        .await
        .context("failed to parse chat completion response")?;

    completion
        .choices
        .first()
        .and_then(|choice| choice.message.content.clone())
        .ok_or_else(|| anyhow!("chat completion response had no content"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::get_default_settings;

    #[test]
    fn test_strip_reasoning_tags() {
        assert_eq!(
            strip_reasoning_tags("<think>hmm\nmultiline</think>final answer"),
            "final answer"
        );
        assert_eq!(
            strip_reasoning_tags("before <note>aside</note> after"),
            "before  after"
        );
        assert_eq!(strip_reasoning_tags("  untouched  "), "untouched");
    }

    #[test]
    fn test_strip_reasoning_tags_is_non_greedy() {
        let text = "<think>a</think>keep<think>b</think>";
        assert_eq!(strip_reasoning_tags(text), "keep");
    }

    #[test]
    fn test_ollama_request_shape() {
        let request = OllamaChatRequest {
            model: "qwen3:8b".to_string(),
            messages: messages("sys", "user"),
            options: OllamaOptions { temperature: 0.5 },
            stream: false,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "qwen3:8b");
        assert_eq!(value["stream"], false);
        assert_eq!(value["options"]["temperature"], 0.5);
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "user");
    }

    #[test]
    fn test_openai_request_shape() {
        let request = ChatCompletionRequest {
            model: "gpt-3.5-turbo".to_string(),
            messages: messages("", "prompt"),
            temperature: 0.5,
            max_tokens: MAX_TOKENS,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["max_tokens"], 4000);
        assert_eq!(value["temperature"], 0.5);
    }

    #[test]
    fn test_summary_prompt_precedence() {
        let mut settings = get_default_settings();
        assert_eq!(
            summary_prompt_prefix(&settings, None),
            DEFAULT_SUMMARY_PROMPT
        );

        settings.summary_prompt = "stored prompt".to_string();
        assert_eq!(summary_prompt_prefix(&settings, None), "stored prompt");
        assert_eq!(summary_prompt_prefix(&settings, Some("  ")), "stored prompt");
        assert_eq!(
            summary_prompt_prefix(&settings, Some("request prompt")),
            "request prompt"
        );
    }
}
