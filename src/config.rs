use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How microphone audio is put on the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioTransport {
    /// Raw PCM16 little-endian in binary WebSocket frames.
    Binary,
    /// `input_audio_buffer.append` JSON envelopes carrying base64 PCM16.
    Base64,
}

impl AudioTransport {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "binary" => Some(Self::Binary),
            "base64" | "json" => Some(Self::Base64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // 应用信息
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 网络配置（可在运行时通过环境变量覆盖）
    pub backend_url: String,
    pub ws_path: String,
    pub login_path: &'static str,
    pub refresh_path: &'static str,
    pub token_file: PathBuf,

    // 音频配置
    pub sample_rate: u32,
    pub capture_buffer_size: usize,
    pub audio_transport: AudioTransport,
    pub flush_on_stop: bool,

    // 会话参数，连接就绪后通过 session.update 下发
    pub voice: String,
    pub vad_threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,

    // 令牌保活
    pub token_check_interval: Duration,
    pub token_refresh_threshold: Duration,

    // 凭据只来自运行时环境，从不写进编译产物
    pub access_token: Option<String>,
    pub login_id: Option<String>,
    pub password: Option<String>,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有默认值都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            backend_url: env!("BACKEND_URL").to_string(),
            ws_path: env!("WS_PATH").to_string(),
            login_path: env!("LOGIN_PATH"),
            refresh_path: env!("REFRESH_PATH"),
            token_file: PathBuf::from(env!("TOKEN_FILE")),

            sample_rate: env!("AUDIO_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse AUDIO_SAMPLE_RATE")?,
            capture_buffer_size: env!("CAPTURE_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse CAPTURE_BUFFER_SIZE")?,
            audio_transport: AudioTransport::parse(env!("AUDIO_TRANSPORT"))
                .ok_or("Failed to parse AUDIO_TRANSPORT")?,
            flush_on_stop: env!("FLUSH_ON_STOP").parse()
                .map_err(|_| "Failed to parse FLUSH_ON_STOP")?,

            voice: env!("SESSION_VOICE").to_string(),
            vad_threshold: env!("VAD_THRESHOLD").parse()
                .map_err(|_| "Failed to parse VAD_THRESHOLD")?,
            prefix_padding_ms: env!("PREFIX_PADDING_MS").parse()
                .map_err(|_| "Failed to parse PREFIX_PADDING_MS")?,
            silence_duration_ms: env!("SILENCE_DURATION_MS").parse()
                .map_err(|_| "Failed to parse SILENCE_DURATION_MS")?,

            token_check_interval: Duration::from_secs(
                env!("TOKEN_CHECK_INTERVAL_SECS").parse()
                    .map_err(|_| "Failed to parse TOKEN_CHECK_INTERVAL_SECS")?,
            ),
            token_refresh_threshold: Duration::from_secs(
                env!("TOKEN_REFRESH_THRESHOLD_SECS").parse()
                    .map_err(|_| "Failed to parse TOKEN_REFRESH_THRESHOLD_SECS")?,
            ),

            access_token: None,
            login_id: None,
            password: None,
        })
    }

    /// Applies `MALANGEE_*` variables from the process environment on top of the
    /// build-time defaults.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("MALANGEE_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Some(path) = get("MALANGEE_WS_PATH") {
            self.ws_path = path;
        }
        if let Some(voice) = get("MALANGEE_VOICE") {
            self.voice = voice;
        }
        if let Some(path) = get("MALANGEE_TOKEN_FILE") {
            self.token_file = PathBuf::from(path);
        }
        if let Some(transport) = get("MALANGEE_AUDIO_TRANSPORT") {
            match AudioTransport::parse(&transport) {
                Some(t) => self.audio_transport = t,
                None => log::warn!("Ignoring unknown MALANGEE_AUDIO_TRANSPORT: {}", transport),
            }
        }
        self.access_token = get("MALANGEE_ACCESS_TOKEN");
        self.login_id = get("MALANGEE_LOGIN_ID");
        self.password = get("MALANGEE_PASSWORD");
        self
    }

    /// REST endpoint under the backend base URL.
    pub fn endpoint(&self, path: &str) -> String {
        let base = self.backend_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }
}
