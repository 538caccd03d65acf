//! Typed application settings backed by the key-value `settings` table.
//!
//! Each field is stored as its own row under its snake_case name, which
//! is also the shape the settings API exposes. Missing rows fall back to
//! serde defaults, so a fresh database and a partial settings POST both
//! produce a fully-populated struct.

use crate::db::Database;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which LLM backend handles review and summary requests.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    Ollama,
    Lmstudio,
    Openai,
}

impl Default for AiProvider {
    fn default() -> Self {
        AiProvider::Ollama
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppSettings {
    #[serde(default)]
    pub ai_provider: AiProvider,
    #[serde(default = "default_whisper_base_path")]
    pub whisper_base_path: String,
    #[serde(default)]
    pub initial_prompt: String,
    #[serde(default = "default_ollama_path")]
    pub ollama_path: String,
    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,
    #[serde(default = "default_lmstudio_path")]
    pub lmstudio_path: String,
    #[serde(default)]
    pub lmstudio_api_key: String,
    #[serde(default = "default_lmstudio_model")]
    pub lmstudio_model: String,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default)]
    pub summary_prompt: String,
}

fn default_whisper_base_path() -> String {
    "http://localhost:9000".to_string()
}

fn default_ollama_path() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "qwen3:8b".to_string()
}

fn default_lmstudio_path() -> String {
    "http://localhost:1234".to_string()
}

fn default_lmstudio_model() -> String {
    "local-model".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-3.5-turbo".to_string()
}

pub fn get_default_settings() -> AppSettings {
    serde_json::from_value(Value::Object(serde_json::Map::new()))
        .expect("default settings must deserialize from an empty object")
}

impl AppSettings {
    /// The settings UI saves whatever is in its text fields, so cleared
    /// endpoint/model fields come back as empty strings. Fold those back
    /// to their defaults; API keys and prompts may legitimately be empty.
    pub fn normalize(&mut self) {
        let defaults = get_default_settings();
        let fields = [
            (&mut self.whisper_base_path, defaults.whisper_base_path),
            (&mut self.ollama_path, defaults.ollama_path),
            (&mut self.ollama_model, defaults.ollama_model),
            (&mut self.lmstudio_path, defaults.lmstudio_path),
            (&mut self.lmstudio_model, defaults.lmstudio_model),
            (&mut self.openai_base_url, defaults.openai_base_url),
            (&mut self.openai_model, defaults.openai_model),
        ];
        for (field, default) in fields {
            if field.trim().is_empty() {
                *field = default;
            }
        }
    }
}

/// Load settings from the database, falling back to defaults when rows
/// are missing or unparseable.
pub fn get_settings(db: &Database) -> AppSettings {
    let mut map = serde_json::Map::new();
    match db.settings_rows() {
        Ok(rows) => {
            for (key, value) in rows {
                map.insert(key, Value::String(value));
            }
        }
        Err(err) => {
            log::warn!("Failed to read settings rows: {}", err);
        }
    }

    let mut settings: AppSettings =
        serde_json::from_value(Value::Object(map)).unwrap_or_else(|err| {
            log::warn!("Failed to parse stored settings, using defaults: {}", err);
            get_default_settings()
        });
    settings.normalize();
    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let settings = get_default_settings();
        assert_eq!(settings.ai_provider, AiProvider::Ollama);
        assert_eq!(settings.whisper_base_path, "http://localhost:9000");
        assert_eq!(settings.ollama_model, "qwen3:8b");
        assert_eq!(settings.openai_model, "gpt-3.5-turbo");
        assert_eq!(settings.lmstudio_api_key, "");
        assert_eq!(settings.summary_prompt, "");
    }

    #[test]
    fn test_load_from_rows_with_unknown_and_missing_keys() {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("meetings.db")).unwrap();
        db.upsert_setting("ai_provider", "openai").unwrap();
        db.upsert_setting("openai_api_key", "sk-test").unwrap();
        db.upsert_setting("some_future_key", "ignored").unwrap();

        let settings = get_settings(&db);
        assert_eq!(settings.ai_provider, AiProvider::Openai);
        assert_eq!(settings.openai_api_key, "sk-test");
        // Missing keys keep their defaults.
        assert_eq!(settings.ollama_path, "http://localhost:11434");
    }

    #[test]
    fn test_invalid_provider_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("meetings.db")).unwrap();
        db.upsert_setting("ai_provider", "clippy").unwrap();

        let settings = get_settings(&db);
        assert_eq!(settings.ai_provider, AiProvider::Ollama);
    }

    #[test]
    fn test_normalize_restores_cleared_endpoints() {
        let mut settings = get_default_settings();
        settings.whisper_base_path = "  ".to_string();
        settings.ollama_model = String::new();
        settings.lmstudio_api_key = String::new();
        settings.normalize();

        assert_eq!(settings.whisper_base_path, "http://localhost:9000");
        assert_eq!(settings.ollama_model, "qwen3:8b");
        // Keys stay empty; an empty key is meaningful.
        assert_eq!(settings.lmstudio_api_key, "");
    }
}
