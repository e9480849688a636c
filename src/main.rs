use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::signal;
use tokio::sync::mpsc;

use malangee_voice::audio::{pcm, CaptureConfig, CaptureSystem, WavSource};
use malangee_voice::auth::{
    AuthClient, AuthToken, FileTokenStore, KeepAliveConfig, SystemClock, TokenKeepAlive, TokenStore,
};
use malangee_voice::config::Config;
use malangee_voice::error::AuthError;
use malangee_voice::session::{
    ChunkEncoder, ConnectionState, SessionConfig, SessionEvent, VoiceSessionClient, WebSocketTransport,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置，运行时环境变量覆盖编译期默认值
    let config = Config::new().map_err(anyhow::Error::msg)?.with_env_overrides();
    log::info!("{} v{} starting, backend {}", config.app_name, config.app_version, config.backend_url);

    let wav_path = std::env::args().nth(1);

    // 获取访问令牌
    let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(&config.token_file));
    let auth = Arc::new(AuthClient::from_config(&config));
    let token = obtain_token(&config, store.as_ref(), &auth).await?;
    log::info!("Access token valid until {}", token.expires_at);

    // 令牌保活
    let (mut keep_alive, mut auth_events) = TokenKeepAlive::spawn(
        store.clone(),
        auth.clone(),
        Arc::new(SystemClock),
        KeepAliveConfig::from_config(&config),
    );

    // 建立实时会话
    let client = VoiceSessionClient::new(WebSocketTransport::new());
    let mut events = client.subscribe();
    client
        .connect(&SessionConfig::from_config(&config, Some(token.value.clone())))
        .await
        .context("connecting voice session")?;

    // 启动音频采集，WAV 文件按实时速度送入
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    let mut capture = match &wav_path {
        Some(path) => {
            let source = WavSource::open(path)?;
            let capture_config = CaptureConfig {
                buffer_size: config.capture_buffer_size,
                realtime: true,
                flush_on_stop: config.flush_on_stop,
                ..Default::default()
            };
            Some(CaptureSystem::start(capture_config, Box::new(source), frame_tx)?)
        }
        None => {
            log::info!("No WAV file given, listening only");
            drop(frame_tx);
            None
        }
    };
    let input_rate = capture.as_ref().map_or(config.sample_rate, |c| c.sample_rate());
    let mut encoder = ChunkEncoder::new(input_rate, config.sample_rate);
    let mut capturing = capture.is_some();

    println!("{} Started. Press Ctrl+C to quit.", config.app_name);

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            // 令牌过期，需要重新登录
            Some(err) = auth_events.recv() => {
                log::error!("{}; log in again with MALANGEE_LOGIN_ID / MALANGEE_PASSWORD", err);
                break;
            }

            // 麦克风帧 → PCM16 → 服务器
            frame = frame_rx.recv(), if capturing => {
                match frame {
                    Some(frame) => {
                        log::trace!("Mic level {:.3}", pcm::volume_level(&frame.audio_data));
                        let chunk = encoder.encode(&frame);
                        client.send_audio(&chunk);
                    }
                    None => {
                        capturing = false;
                        log::info!("Audio input finished, requesting response");
                        client.commit_audio();
                        client.request_response();
                    }
                }
            }

            // 会话事件
            Some(event) = events.recv() => {
                match event {
                    SessionEvent::Message(message) => {
                        println!("[{:?}] {}", message.role, message.content);
                    }
                    SessionEvent::Transcript { text, is_final: false, .. } => {
                        log::debug!("... {}", text);
                    }
                    SessionEvent::ConversationChanged(state) => {
                        log::info!("Conversation: {:?}", state);
                    }
                    SessionEvent::Audio { samples, sample_rate } => {
                        log::debug!(
                            "Received AI audio: {} samples ({:.2}s)",
                            samples.len(),
                            pcm::duration_secs(samples.len(), sample_rate)
                        );
                    }
                    // 场景结束
                    SessionEvent::SessionReport(report) => {
                        println!(
                            "Scenario complete: {} / {} / {}",
                            report.place.as_deref().unwrap_or("-"),
                            report.conversation_partner.as_deref().unwrap_or("-"),
                            report.conversation_goal.as_deref().unwrap_or("-")
                        );
                    }
                    SessionEvent::Error(reason) => {
                        eprintln!("Session error: {}", reason);
                    }
                    SessionEvent::StateChanged(state @ (ConnectionState::Closed | ConnectionState::Error)) => {
                        log::warn!("Session ended: {:?}", state);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(capture) = capture.as_mut() {
        capture.stop();
    }
    client.disconnect();
    keep_alive.stop();
    Ok(())
}

/// Environment token first, then the stored one, then a fresh login.
async fn obtain_token(config: &Config, store: &dyn TokenStore, auth: &AuthClient) -> anyhow::Result<AuthToken> {
    if let Some(raw) = &config.access_token {
        let token = AuthToken::from_jwt(raw)?;
        store.save(&token)?;
        return Ok(token);
    }

    if let Some(token) = store.load() {
        if !token.is_expired(Utc::now()) {
            return Ok(token);
        }
        log::info!("Stored token expired at {}", token.expires_at);
        store.clear();
    }

    match (&config.login_id, &config.password) {
        (Some(login_id), Some(password)) => {
            let token = auth.login(login_id, password).await?;
            store.save(&token)?;
            Ok(token)
        }
        _ => Err(AuthError::Missing).context("set MALANGEE_ACCESS_TOKEN or MALANGEE_LOGIN_ID and MALANGEE_PASSWORD"),
    }
}
