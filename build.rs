use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    audio: Audio,
    session: Session,
    auth: Auth,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    backend_url: String,
    ws_path: String,
    login_path: String,
    refresh_path: String,
    token_file: String,
}

#[derive(Deserialize)]
struct Audio {
    sample_rate: u32,
    capture_buffer_size: usize,
    transport: String,
    flush_on_stop: bool,
}

#[derive(Deserialize)]
struct Session {
    voice: String,
    vad_threshold: f32,
    prefix_padding_ms: u32,
    silence_duration_ms: u32,
}

#[derive(Deserialize)]
struct Auth {
    check_interval_secs: u64,
    refresh_threshold_secs: u64,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=BACKEND_URL={}", config.network.backend_url);
    println!("cargo:rustc-env=WS_PATH={}", config.network.ws_path);
    println!("cargo:rustc-env=LOGIN_PATH={}", config.network.login_path);
    println!("cargo:rustc-env=REFRESH_PATH={}", config.network.refresh_path);
    println!("cargo:rustc-env=TOKEN_FILE={}", config.network.token_file);

    // 音频配置
    println!("cargo:rustc-env=AUDIO_SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=CAPTURE_BUFFER_SIZE={}", config.audio.capture_buffer_size);
    println!("cargo:rustc-env=AUDIO_TRANSPORT={}", config.audio.transport);
    println!("cargo:rustc-env=FLUSH_ON_STOP={}", config.audio.flush_on_stop);

    // 会话配置
    println!("cargo:rustc-env=SESSION_VOICE={}", config.session.voice);
    println!("cargo:rustc-env=VAD_THRESHOLD={}", config.session.vad_threshold);
    println!("cargo:rustc-env=PREFIX_PADDING_MS={}", config.session.prefix_padding_ms);
    println!("cargo:rustc-env=SILENCE_DURATION_MS={}", config.session.silence_duration_ms);

    // 令牌保活配置
    println!("cargo:rustc-env=TOKEN_CHECK_INTERVAL_SECS={}", config.auth.check_interval_secs);
    println!("cargo:rustc-env=TOKEN_REFRESH_THRESHOLD_SECS={}", config.auth.refresh_threshold_secs);
}
