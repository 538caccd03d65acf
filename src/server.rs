//! Local HTTP API server for the web UI.
//!
//! A threaded `tiny_http` server exposes the REST surface the UI talks
//! to: audio upload, meeting CRUD, transcription / review / summary
//! orchestration, structured transcript rows backed by the codec,
//! settings and CSV export. The worker loop polls a shutdown flag so
//! tests can spawn and stop instances on free ports.

use crate::cloud_transcription;
use crate::db::{Database, Meeting, VALID_LANGUAGES};
use crate::export;
use crate::llm_client;
use crate::settings::{self, AiProvider, AppSettings};
use crate::transcript::Transcript;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use uuid::Uuid;

const MAX_UPLOAD_BYTES: usize = 500 * 1024 * 1024;

/// Everything a request handler needs: storage, the uploads directory
/// and a runtime to drive the async HTTP clients from handler threads.
pub struct AppState {
    pub db: Database,
    pub uploads_dir: PathBuf,
    runtime: tokio::runtime::Runtime,
}

impl AppState {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let uploads_dir = data_dir.join("uploads");
        let database_dir = data_dir.join("database");
        fs::create_dir_all(&uploads_dir)
            .with_context(|| format!("failed to create {}", uploads_dir.display()))?;
        fs::create_dir_all(&database_dir)
            .with_context(|| format!("failed to create {}", database_dir.display()))?;

        let db = Database::open(&database_dir.join("meetings.db"))?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context("failed to build async runtime")?;

        Ok(Self {
            db,
            uploads_dir,
            runtime,
        })
    }
}

pub struct ServerWorker {
    shutdown: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl ServerWorker {
    /// Signal the worker loop and wait for it to exit.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Err(err) = self.handle.join() {
            warn!("Failed to join API server thread: {:?}", err);
        }
    }

    /// Block on the server thread; it only returns on bind failure.
    pub fn join(self) {
        if let Err(err) = self.handle.join() {
            warn!("API server thread panicked: {:?}", err);
        }
    }
}

pub fn spawn(addr: String, state: Arc<AppState>) -> ServerWorker {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let handle = thread::spawn(move || run_server(&addr, state, shutdown_clone));
    ServerWorker {
        shutdown,
        handle,
    }
}

fn run_server(addr: &str, state: Arc<AppState>, shutdown: Arc<AtomicBool>) {
    let server = match Server::http(addr) {
        Ok(server) => {
            info!("Minute API listening on http://{}/api", addr);
            server
        }
        Err(err) => {
            error!("Failed to start API server on {}: {}", addr, err);
            return;
        }
    };

    while !shutdown.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(250)) {
            Ok(Some(request)) => handle_request(request, &state),
            Ok(None) => continue,
            Err(err) => {
                warn!("API server receive error: {}", err);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

struct HttpError {
    status: u16,
    message: String,
}

impl HttpError {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(502, message)
    }
}

impl From<anyhow::Error> for HttpError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(500, format!("{:#}", err))
    }
}

impl From<serde_json::Error> for HttpError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(500, format!("serialization failed: {}", err))
    }
}

enum Reply {
    Json { status: u16, body: Value },
    Raw {
        status: u16,
        content_type: String,
        body: Vec<u8>,
        file_name: Option<String>,
    },
    Preflight,
}

fn json_reply(body: Value) -> Reply {
    Reply::Json { status: 200, body }
}

fn handle_request(mut request: Request, state: &AppState) {
    let method = request.method().clone();
    let url = request.url().to_string();
    let path = url.split('?').next().unwrap_or("").to_string();

    let mut body = Vec::new();
    if let Err(err) = request.as_reader().read_to_end(&mut body) {
        respond_error(request, 400, &format!("failed to read body: {}", err));
        return;
    }
    let content_type = header_value(&request, "Content-Type").unwrap_or_default();

    match route(&method, &path, &body, &content_type, state) {
        Ok(reply) => respond(request, reply),
        Err(err) => respond_error(request, err.status, &err.message),
    }
}

fn route(
    method: &Method,
    path: &str,
    body: &[u8],
    content_type: &str,
    state: &AppState,
) -> std::result::Result<Reply, HttpError> {
    if *method == Method::Options {
        return Ok(Reply::Preflight);
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        (&Method::Get, ["api", "health"]) => Ok(json_reply(json!({
            "status": "OK",
            "message": "Minute API is running"
        }))),

        (&Method::Post, ["api", "upload"]) => handle_upload(state, body, content_type),

        (&Method::Get, ["api", "meetings"]) => {
            let meetings = state.db.list_meetings()?;
            Ok(json_reply(serde_json::to_value(meetings)?))
        }

        (&Method::Get, ["api", "meeting", id]) => handle_get_meeting(state, id),
        (&Method::Delete, ["api", "meeting", id]) => handle_delete_meeting(state, id),
        (&Method::Patch, ["api", "meeting", id]) => handle_update_language(state, id, body),

        (&Method::Get, ["api", "meeting", id, "transcription"]) => {
            let meeting = meeting_or_404(state, id)?;
            Ok(json_reply(json!({
                "transcription": meeting.transcription.unwrap_or_default()
            })))
        }
        (&Method::Post, ["api", "meeting", id, "transcription"]) => {
            handle_run_transcription(state, id)
        }
        (&Method::Post, ["api", "meeting", id, "transcription", "update"]) => {
            handle_update_transcription(state, id, body)
        }

        (&Method::Get, ["api", "meeting", id, "transcription-with-speaker"]) => {
            let meeting = meeting_or_404(state, id)?;
            Ok(json_reply(json!({
                "transcription_with_speaker":
                    meeting.transcription_with_speaker.unwrap_or_default()
            })))
        }
        (&Method::Post, ["api", "meeting", id, "transcription-with-speaker"])
        | (&Method::Post, ["api", "meeting", id, "transcription-with-speaker", "update"]) => {
            handle_update_speaker_transcription(state, id, body)
        }

        (&Method::Post, ["api", "meeting", id, "transcription", "review"]) => {
            handle_review(state, id)
        }

        (&Method::Post, ["api", "summary", id]) => handle_generate_summary(state, id, body),
        (&Method::Get, ["api", "meeting", id, "summary"]) => {
            meeting_or_404(state, id)?;
            let summary = state.db.latest_summary(id)?;
            Ok(json_reply(json!({
                "summary": summary.map(Value::String).unwrap_or(Value::Null)
            })))
        }

        (&Method::Get, ["api", "meeting", id, "transcript", "rows"]) => {
            handle_get_rows(state, id)
        }
        (&Method::Post, ["api", "meeting", id, "transcript", "rows", index]) => {
            handle_update_row(state, id, index, body)
        }

        (&Method::Get, ["api", "meeting", id, "export", "csv"]) => handle_export_csv(state, id),

        (&Method::Get, ["api", "settings"]) => {
            let settings = settings::get_settings(&state.db);
            Ok(json_reply(serde_json::to_value(settings)?))
        }
        (&Method::Post, ["api", "settings"]) => handle_save_settings(state, body),

        (&Method::Get, ["uploads", file]) => handle_serve_upload(state, file),

        _ => Err(HttpError::not_found("not found")),
    }
}

fn meeting_or_404(state: &AppState, id: &str) -> std::result::Result<Meeting, HttpError> {
    state
        .db
        .get_meeting(id)?
        .ok_or_else(|| HttpError::not_found("Meeting not found"))
}

fn parse_json_body<T: for<'de> Deserialize<'de>>(
    body: &[u8],
) -> std::result::Result<T, HttpError> {
    serde_json::from_slice(body).map_err(|err| {
        HttpError::bad_request(format!("invalid JSON body: {}", err))
    })
}

fn handle_upload(
    state: &AppState,
    body: &[u8],
    content_type: &str,
) -> std::result::Result<Reply, HttpError> {
    let boundary = parse_multipart_boundary(content_type)
        .ok_or_else(|| HttpError::bad_request("expected multipart/form-data"))?;
    let form = parse_multipart_form_data(body, &boundary)
        .map_err(|err| HttpError::bad_request(err.to_string()))?;

    let file = form
        .file
        .as_ref()
        .ok_or_else(|| HttpError::bad_request("No audio file uploaded"))?;

    let is_audio = file
        .content_type
        .as_deref()
        .map(|mime| mime.trim().to_ascii_lowercase().starts_with("audio/"))
        .unwrap_or(false);
    if !is_audio {
        return Err(HttpError::bad_request("Only audio files are allowed"));
    }
    if file.data.len() > MAX_UPLOAD_BYTES {
        return Err(HttpError::new(413, "audio file exceeds the upload limit"));
    }

    let extension = file
        .file_name
        .as_deref()
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default();

    let stored_name = format!("{}{}", Uuid::new_v4(), extension);
    let stored_path = state.uploads_dir.join(&stored_name);
    fs::write(&stored_path, &file.data)
        .with_context(|| format!("failed to store {}", stored_path.display()))?;

    let title = form
        .first_value("title")
        .filter(|title| !title.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Meeting {}", Utc::now().format("%Y-%m-%d")));
    let language = form
        .first_value("language")
        .filter(|language| !language.is_empty())
        .unwrap_or("en")
        .to_string();

    let meeting_id = Uuid::new_v4().to_string();
    let stored_path_str = stored_path.to_string_lossy().to_string();
    state
        .db
        .insert_meeting(&meeting_id, &title, Some(&stored_path_str), &language)?;

    info!("Stored meeting {} ({} bytes of audio)", meeting_id, file.data.len());

    Ok(json_reply(json!({
        "meetingId": meeting_id,
        "title": title,
        "audioPath": stored_path_str,
        "message": "Audio file uploaded successfully"
    })))
}

fn handle_get_meeting(state: &AppState, id: &str) -> std::result::Result<Reply, HttpError> {
    let meeting = meeting_or_404(state, id)?;
    let audio_url = meeting
        .audio_file_path
        .as_deref()
        .filter(|path| !path.is_empty())
        .and_then(|path| Path::new(path).file_name())
        .and_then(|name| name.to_str())
        .map(|name| format!("/uploads/{}", name));

    let mut value = serde_json::to_value(&meeting)?;
    value["audio_url"] = audio_url.map(Value::String).unwrap_or(Value::Null);
    Ok(json_reply(value))
}

fn handle_delete_meeting(state: &AppState, id: &str) -> std::result::Result<Reply, HttpError> {
    let meeting = meeting_or_404(state, id)?;

    if let Some(path) = meeting.audio_file_path.as_deref().filter(|p| !p.is_empty()) {
        if Path::new(path).exists() {
            if let Err(err) = fs::remove_file(path) {
                warn!("Failed to delete audio file {}: {}", path, err);
            }
        }
    }

    state.db.delete_meeting(&meeting.id)?;
    Ok(json_reply(json!({"message": "Meeting deleted successfully"})))
}

#[derive(Deserialize)]
struct LanguageUpdate {
    #[serde(default)]
    language: Option<String>,
}

fn handle_update_language(
    state: &AppState,
    id: &str,
    body: &[u8],
) -> std::result::Result<Reply, HttpError> {
    let update: LanguageUpdate = parse_json_body(body)?;
    let language = update.language.unwrap_or_default();

    if !VALID_LANGUAGES.contains(&language.as_str()) {
        return Err(HttpError::bad_request("Invalid language code"));
    }

    if !state.db.update_language(id, &language)? {
        return Err(HttpError::not_found("Meeting not found"));
    }

    Ok(json_reply(json!({
        "message": "Meeting language updated successfully",
        "language": language
    })))
}

fn handle_run_transcription(state: &AppState, id: &str) -> std::result::Result<Reply, HttpError> {
    let meeting = meeting_or_404(state, id)?;

    if let Some(existing) = meeting
        .transcription
        .as_deref()
        .filter(|text| !text.trim().is_empty())
    {
        return Ok(json_reply(json!({
            "message": "Using existing transcription",
            "transcription": existing
        })));
    }

    let audio_path = meeting
        .audio_file_path
        .as_deref()
        .filter(|path| !path.is_empty())
        .ok_or_else(|| HttpError::bad_request("No audio file for this meeting"))?;

    let app_settings = settings::get_settings(&state.db);
    let transcription = state
        .runtime
        .block_on(cloud_transcription::transcribe_file(
            &app_settings,
            Path::new(audio_path),
            &meeting.language,
        ))
        .map_err(|err| {
            error!("Transcription failed for meeting {}: {:#}", id, err);
            HttpError::bad_gateway(format!("Transcription failed: {:#}", err))
        })?;

    // A fresh whisper run seeds the speaker transcript too.
    state
        .db
        .set_transcriptions(&meeting.id, &transcription, &transcription)?;

    Ok(json_reply(json!({
        "message": "Transcription completed successfully",
        "transcription": transcription
    })))
}

#[derive(Deserialize)]
struct TranscriptionUpdate {
    transcription: String,
}

fn handle_update_transcription(
    state: &AppState,
    id: &str,
    body: &[u8],
) -> std::result::Result<Reply, HttpError> {
    let update: TranscriptionUpdate = parse_json_body(body)?;
    if !state.db.update_transcription(id, &update.transcription)? {
        return Err(HttpError::not_found("Meeting not found"));
    }
    Ok(json_reply(json!({"message": "Transcription updated successfully"})))
}

#[derive(Deserialize)]
struct SpeakerTranscriptionUpdate {
    transcription_with_speaker: String,
}

fn handle_update_speaker_transcription(
    state: &AppState,
    id: &str,
    body: &[u8],
) -> std::result::Result<Reply, HttpError> {
    let update: SpeakerTranscriptionUpdate = parse_json_body(body)?;
    if !state
        .db
        .update_speaker_transcription(id, &update.transcription_with_speaker)?
    {
        return Err(HttpError::not_found("Meeting not found"));
    }
    Ok(json_reply(json!({
        "message": "Transcription with speaker updated successfully"
    })))
}

/// Review requires a key for hosted providers; LM Studio keys are only
/// required on the review path, matching the original behavior.
fn require_api_key(
    app_settings: &AppSettings,
    review: bool,
) -> std::result::Result<(), HttpError> {
    match app_settings.ai_provider {
        AiProvider::Lmstudio if review && app_settings.lmstudio_api_key.trim().is_empty() => {
            Err(HttpError::bad_request("LM Studio API key is required"))
        }
        AiProvider::Openai if app_settings.openai_api_key.trim().is_empty() => {
            Err(HttpError::bad_request("OpenAI API key is required"))
        }
        _ => Ok(()),
    }
}

fn handle_review(state: &AppState, id: &str) -> std::result::Result<Reply, HttpError> {
    let meeting = meeting_or_404(state, id)?;
    let transcript = meeting
        .transcription_with_speaker
        .filter(|text| !text.trim().is_empty())
        .or(meeting.transcription.filter(|text| !text.trim().is_empty()))
        .ok_or_else(|| HttpError::bad_request("No transcription available for review"))?;

    let app_settings = settings::get_settings(&state.db);
    require_api_key(&app_settings, true)?;

    let reviewed = state
        .runtime
        .block_on(llm_client::review_transcript(&app_settings, &transcript))
        .map_err(|err| {
            error!("Review failed for meeting {}: {:#}", id, err);
            HttpError::bad_gateway(format!("Failed to review transcript: {:#}", err))
        })?;

    state.db.update_speaker_transcription(&meeting.id, &reviewed)?;

    Ok(json_reply(json!({
        "message": "Transcript reviewed successfully",
        "transcription": reviewed
    })))
}

#[derive(Deserialize, Default)]
struct SummaryRequest {
    #[serde(default)]
    prompt: Option<String>,
}

fn handle_generate_summary(
    state: &AppState,
    id: &str,
    body: &[u8],
) -> std::result::Result<Reply, HttpError> {
    let meeting = meeting_or_404(state, id)?;
    let transcript = meeting
        .transcription_with_speaker
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| {
            HttpError::bad_request("No transcription with speaker available for summary generation")
        })?;

    let request: SummaryRequest = if body.is_empty() {
        SummaryRequest::default()
    } else {
        parse_json_body(body)?
    };

    let app_settings = settings::get_settings(&state.db);
    require_api_key(&app_settings, false)?;

    let summary = state
        .runtime
        .block_on(llm_client::generate_summary(
            &app_settings,
            &transcript,
            request.prompt.as_deref(),
        ))
        .map_err(|err| {
            error!("Summary generation failed for meeting {}: {:#}", id, err);
            HttpError::bad_gateway(format!("Failed to generate summary: {:#}", err))
        })?;

    state
        .db
        .insert_summary(&Uuid::new_v4().to_string(), &meeting.id, &summary)?;

    Ok(json_reply(json!({"summary": summary})))
}

fn handle_get_rows(state: &AppState, id: &str) -> std::result::Result<Reply, HttpError> {
    let meeting = meeting_or_404(state, id)?;
    let text = meeting.transcription.unwrap_or_default();
    let transcript = Transcript::parse(&text);
    Ok(json_reply(json!({
        "rows": transcript.rows(),
        "speakers": transcript.distinct_speakers()
    })))
}

#[derive(Deserialize)]
struct RowUpdate {
    #[serde(default)]
    speaker: String,
    #[serde(default)]
    content: String,
}

fn handle_update_row(
    state: &AppState,
    id: &str,
    index: &str,
    body: &[u8],
) -> std::result::Result<Reply, HttpError> {
    let index: usize = index
        .parse()
        .map_err(|_| HttpError::bad_request("Invalid row index"))?;
    let update: RowUpdate = parse_json_body(body)?;

    let meeting = meeting_or_404(state, id)?;
    let text = meeting.transcription.unwrap_or_default();
    let mut transcript = Transcript::parse(&text);

    let full_text = transcript
        .update_row(index, &update.speaker, &update.content)
        .ok_or_else(|| HttpError::bad_request("Row index out of range"))?;

    state.db.update_transcription(&meeting.id, &full_text)?;

    Ok(json_reply(json!({
        "message": "Row updated successfully",
        "row": &transcript.rows()[index],
        "transcription": full_text
    })))
}

fn handle_export_csv(state: &AppState, id: &str) -> std::result::Result<Reply, HttpError> {
    let meeting = meeting_or_404(state, id)?;
    let text = meeting.transcription.unwrap_or_default();
    let transcript = Transcript::parse(&text);
    let csv = export::transcript_to_csv(transcript.rows());

    Ok(Reply::Raw {
        status: 200,
        content_type: "text/csv; charset=utf-8".to_string(),
        body: csv.into_bytes(),
        file_name: Some(export::export_file_name(&meeting.title)),
    })
}

fn handle_save_settings(state: &AppState, body: &[u8]) -> std::result::Result<Reply, HttpError> {
    let updates: HashMap<String, Value> = parse_json_body(body)?;
    for (key, value) in updates {
        let value = match value {
            Value::String(text) => text,
            other => other.to_string(),
        };
        state.db.upsert_setting(&key, &value)?;
    }
    Ok(json_reply(json!({"message": "Settings saved successfully"})))
}

fn handle_serve_upload(state: &AppState, file: &str) -> std::result::Result<Reply, HttpError> {
    if file.contains("..") {
        return Err(HttpError::not_found("not found"));
    }

    let path = state.uploads_dir.join(file);
    let data = fs::read(&path).map_err(|_| HttpError::not_found("File not found"))?;

    Ok(Reply::Raw {
        status: 200,
        content_type: audio_content_type(file).to_string(),
        body: data,
        file_name: None,
    })
}

fn audio_content_type(file_name: &str) -> &'static str {
    match Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("webm") => "audio/webm",
        Some("m4a") => "audio/mp4",
        Some("flac") => "audio/flac",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------
// Multipart form parsing
// ---------------------------------------------------------------------

#[derive(Default)]
struct MultipartFile {
    data: Vec<u8>,
    file_name: Option<String>,
    content_type: Option<String>,
}

#[derive(Default)]
struct MultipartFormData {
    file: Option<MultipartFile>,
    fields: HashMap<String, Vec<String>>,
}

impl MultipartFormData {
    fn push_field(&mut self, name: String, value: String) {
        self.fields.entry(name).or_default().push(value);
    }

    fn first_value(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(|values| values.first().map(String::as_str))
    }
}

fn parse_multipart_boundary(content_type: &str) -> Option<String> {
    let lowered = content_type.to_ascii_lowercase();
    if !lowered.starts_with("multipart/form-data") {
        return None;
    }

    for part in content_type.split(';').map(str::trim) {
        if let Some(value) = part.strip_prefix("boundary=") {
            let trimmed = value.trim_matches('"').trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    None
}

fn parse_multipart_form_data(body: &[u8], boundary: &str) -> Result<MultipartFormData> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut marker = Vec::with_capacity(4 + boundary.len());
    marker.extend_from_slice(b"\r\n--");
    marker.extend_from_slice(boundary.as_bytes());

    let mut position = find_subslice_from(body, &delimiter, 0)
        .ok_or_else(|| anyhow!("invalid multipart body: boundary not found"))?;
    let mut form = MultipartFormData::default();

    loop {
        position += delimiter.len();

        if body.get(position..position + 2) == Some(b"--") {
            break;
        }

        if body.get(position..position + 2) != Some(b"\r\n") {
            return Err(anyhow!("invalid multipart body framing"));
        }
        position += 2;

        let header_end = find_subslice_from(body, b"\r\n\r\n", position)
            .ok_or_else(|| anyhow!("invalid multipart part headers"))?;
        let header_bytes = &body[position..header_end];
        let headers = parse_part_headers(header_bytes)?;
        let part_start = header_end + 4;
        let part_end = find_subslice_from(body, &marker, part_start)
            .ok_or_else(|| anyhow!("multipart part missing trailing boundary"))?;
        let part_data = &body[part_start..part_end];

        let disposition = headers
            .get("content-disposition")
            .ok_or_else(|| anyhow!("multipart part missing Content-Disposition header"))?;
        let name = parse_disposition_param(disposition, "name")
            .ok_or_else(|| anyhow!("multipart part missing field name"))?;

        if name == "audio" {
            form.file = Some(MultipartFile {
                data: part_data.to_vec(),
                file_name: parse_disposition_param(disposition, "filename"),
                content_type: headers.get("content-type").cloned(),
            });
        } else {
            let value = String::from_utf8(part_data.to_vec())
                .context("multipart text fields must be valid UTF-8")?;
            form.push_field(name, value);
        }

        position = part_end + 2;
    }

    Ok(form)
}

fn parse_part_headers(header_bytes: &[u8]) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for line in header_bytes.split(|byte| *byte == b'\n') {
        let line = String::from_utf8(line.to_vec())?.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid multipart part header"))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Ok(headers)
}

fn parse_disposition_param(value: &str, param: &str) -> Option<String> {
    let prefix = format!("{}=", param);
    for part in value.split(';').map(str::trim) {
        if let Some(raw) = part.strip_prefix(prefix.as_str()) {
            return Some(raw.trim_matches('"').to_string());
        }
    }
    None
}

fn find_subslice_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }

    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

// ---------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|header| header.field.as_str().to_string().eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str().to_string())
}

fn add_header<R: Read>(response: &mut Response<R>, name: &str, value: &str) {
    if let Ok(header) = Header::from_bytes(name.as_bytes(), value.as_bytes()) {
        response.add_header(header);
    }
}

fn add_cors_headers<R: Read>(response: &mut Response<R>) {
    add_header(response, "Access-Control-Allow-Origin", "*");
    add_header(
        response,
        "Access-Control-Allow-Headers",
        "Content-Type, Authorization",
    );
    add_header(
        response,
        "Access-Control-Allow-Methods",
        "GET, POST, PATCH, DELETE, OPTIONS",
    );
}

fn respond(request: Request, reply: Reply) {
    match reply {
        Reply::Json { status, body } => {
            let mut response =
                Response::from_string(body.to_string()).with_status_code(StatusCode(status));
            add_header(&mut response, "Content-Type", "application/json");
            add_cors_headers(&mut response);
            if let Err(err) = request.respond(response) {
                warn!("Failed to send API response: {}", err);
            }
        }
        Reply::Raw {
            status,
            content_type,
            body,
            file_name,
        } => {
            let mut response = Response::from_data(body).with_status_code(StatusCode(status));
            add_header(&mut response, "Content-Type", &content_type);
            if let Some(name) = file_name {
                add_header(
                    &mut response,
                    "Content-Disposition",
                    &format!("attachment; filename=\"{}\"", name),
                );
            }
            add_cors_headers(&mut response);
            if let Err(err) = request.respond(response) {
                warn!("Failed to send API response: {}", err);
            }
        }
        Reply::Preflight => {
            let mut response = Response::from_string("").with_status_code(StatusCode(204));
            add_cors_headers(&mut response);
            add_header(&mut response, "Access-Control-Max-Age", "600");
            if let Err(err) = request.respond(response) {
                warn!("Failed to send preflight response: {}", err);
            }
        }
    }
}

fn respond_error(request: Request, status: u16, message: &str) {
    let body = json!({"error": message}).to_string();
    let mut response = Response::from_string(body).with_status_code(StatusCode(status));
    add_header(&mut response, "Content-Type", "application/json");
    add_cors_headers(&mut response);
    if let Err(err) = request.respond(response) {
        warn!("Failed to send API error response: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use tempfile::TempDir;

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn spawn_test_server() -> (TempDir, String, ServerWorker) {
        let dir = TempDir::new().unwrap();
        let state = Arc::new(AppState::new(dir.path()).unwrap());
        let port = free_port();
        let addr = format!("127.0.0.1:{}", port);
        let worker = spawn(addr.clone(), state);
        thread::sleep(Duration::from_millis(120));
        (dir, addr, worker)
    }

    fn send_http(addr: &str, raw_request: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(raw_request).unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    fn get(addr: &str, path: &str) -> String {
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, addr
        );
        send_http(addr, request.as_bytes())
    }

    fn request_with_body(addr: &str, method: &str, path: &str, body: &str) -> String {
        let request = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            method,
            path,
            addr,
            body.len(),
            body
        );
        send_http(addr, request.as_bytes())
    }

    fn response_body(response: &str) -> &str {
        response.split("\r\n\r\n").nth(1).unwrap_or("")
    }

    fn upload_meeting(addr: &str, title: &str) -> String {
        let boundary = "----minuteBoundary";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"audio\"; filename=\"sample.wav\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: audio/wav\r\n\r\n");
        body.extend_from_slice(&[0_u8; 64]);
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"title\"\r\n\r\n");
        body.extend_from_slice(title.as_bytes());
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"language\"\r\n\r\n");
        body.extend_from_slice(b"en\r\n");
        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

        let head = format!(
            "POST /api/upload HTTP/1.1\r\nHost: {}\r\nContent-Type: multipart/form-data; boundary={}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            addr,
            boundary,
            body.len()
        );

        let mut raw = head.into_bytes();
        raw.extend_from_slice(&body);

        let response = send_http(addr, &raw);
        assert!(response.starts_with("HTTP/1.1 200"), "upload failed: {}", response);

        let parsed: Value = serde_json::from_str(response_body(&response)).unwrap();
        parsed["meetingId"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_health_check() {
        let (_dir, addr, worker) = spawn_test_server();
        let response = get(&addr, "/api/health");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"status\":\"OK\""));
        worker.stop();
    }

    #[test]
    fn test_unknown_route_is_404() {
        let (_dir, addr, worker) = spawn_test_server();
        let response = get(&addr, "/api/nope");
        assert!(response.starts_with("HTTP/1.1 404"));
        worker.stop();
    }

    #[test]
    fn test_missing_meeting_is_404() {
        let (_dir, addr, worker) = spawn_test_server();
        let response = get(&addr, "/api/meeting/does-not-exist");
        assert!(response.starts_with("HTTP/1.1 404"));
        assert!(response.contains("Meeting not found"));
        worker.stop();
    }

    #[test]
    fn test_upload_and_fetch_flow() {
        let (_dir, addr, worker) = spawn_test_server();
        let meeting_id = upload_meeting(&addr, "Weekly sync");

        let list = get(&addr, "/api/meetings");
        assert!(list.starts_with("HTTP/1.1 200"));
        assert!(list.contains("Weekly sync"));

        let detail = get(&addr, &format!("/api/meeting/{}", meeting_id));
        assert!(detail.starts_with("HTTP/1.1 200"));
        let parsed: Value = serde_json::from_str(response_body(&detail)).unwrap();
        let audio_url = parsed["audio_url"].as_str().unwrap().to_string();
        assert!(audio_url.starts_with("/uploads/"));

        // The stored audio is served back for playback.
        let audio = get(&addr, &audio_url);
        assert!(audio.starts_with("HTTP/1.1 200"));
        assert!(audio.contains("audio/wav"));

        worker.stop();
    }

    #[test]
    fn test_upload_rejects_non_audio() {
        let (_dir, addr, worker) = spawn_test_server();

        let boundary = "----minuteBoundary";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"audio\"; filename=\"evil.txt\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: text/plain\r\n\r\n");
        body.extend_from_slice(b"not audio");
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

        let head = format!(
            "POST /api/upload HTTP/1.1\r\nHost: {}\r\nContent-Type: multipart/form-data; boundary={}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            addr,
            boundary,
            body.len()
        );
        let mut raw = head.into_bytes();
        raw.extend_from_slice(&body);

        let response = send_http(&addr, &raw);
        assert!(response.starts_with("HTTP/1.1 400"));
        assert!(response.contains("Only audio files are allowed"));

        worker.stop();
    }

    #[test]
    fn test_transcription_update_and_row_editing() {
        let (_dir, addr, worker) = spawn_test_server();
        let meeting_id = upload_meeting(&addr, "Editing session");

        let text = "[00:00:10] [Amy] one\\n[00:00:40] [Bob] two\\n[00:01:20] [Cal] three";
        let update = format!("{{\"transcription\":\"{}\"}}", text);
        let response = request_with_body(
            &addr,
            "POST",
            &format!("/api/meeting/{}/transcription/update", meeting_id),
            &update,
        );
        assert!(response.starts_with("HTTP/1.1 200"));

        let rows = get(&addr, &format!("/api/meeting/{}/transcript/rows", meeting_id));
        assert!(rows.starts_with("HTTP/1.1 200"));
        let parsed: Value = serde_json::from_str(response_body(&rows)).unwrap();
        assert_eq!(parsed["rows"].as_array().unwrap().len(), 3);
        assert_eq!(parsed["rows"][1]["speaker"], "Bob");
        assert_eq!(parsed["speakers"].as_array().unwrap().len(), 3);

        let edit = request_with_body(
            &addr,
            "POST",
            &format!("/api/meeting/{}/transcript/rows/1", meeting_id),
            "{\"speaker\":\"Beth\",\"content\":\"two, revised\"}",
        );
        assert!(edit.starts_with("HTTP/1.1 200"));
        let parsed: Value = serde_json::from_str(response_body(&edit)).unwrap();
        assert_eq!(parsed["row"]["timestamp"], "00:00:40");
        assert_eq!(parsed["row"]["speaker"], "Beth");

        let transcription = get(
            &addr,
            &format!("/api/meeting/{}/transcription", meeting_id),
        );
        let parsed: Value = serde_json::from_str(response_body(&transcription)).unwrap();
        let stored = parsed["transcription"].as_str().unwrap();
        assert!(stored.contains("[00:00:40] [Beth] two, revised"));
        assert!(stored.contains("[00:00:10] [Amy] one"));
        assert!(stored.contains("[00:01:20] [Cal] three"));

        let bad_edit = request_with_body(
            &addr,
            "POST",
            &format!("/api/meeting/{}/transcript/rows/99", meeting_id),
            "{\"speaker\":\"X\",\"content\":\"y\"}",
        );
        assert!(bad_edit.starts_with("HTTP/1.1 400"));

        worker.stop();
    }

    #[test]
    fn test_csv_export() {
        let (_dir, addr, worker) = spawn_test_server();
        let meeting_id = upload_meeting(&addr, "Export me");

        let update =
            "{\"transcription\":\"[00:00:10] [Amy] first, second\\n[00:00:40] [Bob] plain\"}";
        request_with_body(
            &addr,
            "POST",
            &format!("/api/meeting/{}/transcription/update", meeting_id),
            update,
        );

        let response = get(&addr, &format!("/api/meeting/{}/export/csv", meeting_id));
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("text/csv"));
        assert!(response.contains("Export me.csv"));
        assert!(response.contains("Timestamp,Speaker,Content"));
        assert!(response.contains("\"first, second\""));
        assert!(response.contains("00:00:40,Bob,plain"));

        worker.stop();
    }

    #[test]
    fn test_settings_round_trip() {
        let (_dir, addr, worker) = spawn_test_server();

        let defaults = get(&addr, "/api/settings");
        assert!(defaults.starts_with("HTTP/1.1 200"));
        assert!(defaults.contains("\"ai_provider\":\"ollama\""));

        let response = request_with_body(
            &addr,
            "POST",
            "/api/settings",
            "{\"ai_provider\":\"openai\",\"openai_api_key\":\"sk-test\"}",
        );
        assert!(response.starts_with("HTTP/1.1 200"));

        let updated = get(&addr, "/api/settings");
        assert!(updated.contains("\"ai_provider\":\"openai\""));
        assert!(updated.contains("\"openai_api_key\":\"sk-test\""));
        // Untouched keys keep their defaults.
        assert!(updated.contains("\"ollama_model\":\"qwen3:8b\""));

        worker.stop();
    }

    #[test]
    fn test_patch_language_validation() {
        let (_dir, addr, worker) = spawn_test_server();
        let meeting_id = upload_meeting(&addr, "Language test");

        let invalid = request_with_body(
            &addr,
            "PATCH",
            &format!("/api/meeting/{}", meeting_id),
            "{\"language\":\"xx\"}",
        );
        assert!(invalid.starts_with("HTTP/1.1 400"));

        let valid = request_with_body(
            &addr,
            "PATCH",
            &format!("/api/meeting/{}", meeting_id),
            "{\"language\":\"zh\"}",
        );
        assert!(valid.starts_with("HTTP/1.1 200"));

        let detail = get(&addr, &format!("/api/meeting/{}", meeting_id));
        assert!(detail.contains("\"language\":\"zh\""));

        worker.stop();
    }

    #[test]
    fn test_delete_meeting() {
        let (_dir, addr, worker) = spawn_test_server();
        let meeting_id = upload_meeting(&addr, "Doomed");

        let request = format!(
            "DELETE /api/meeting/{} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            meeting_id, addr
        );
        let response = send_http(&addr, request.as_bytes());
        assert!(response.starts_with("HTTP/1.1 200"));

        let gone = get(&addr, &format!("/api/meeting/{}", meeting_id));
        assert!(gone.starts_with("HTTP/1.1 404"));

        worker.stop();
    }

    #[test]
    fn test_summary_without_transcript_is_400() {
        let (_dir, addr, worker) = spawn_test_server();
        let meeting_id = upload_meeting(&addr, "No transcript yet");

        let response = request_with_body(&addr, "POST", &format!("/api/summary/{}", meeting_id), "{}");
        assert!(response.starts_with("HTTP/1.1 400"));

        worker.stop();
    }
}
