use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use url::Url;

use super::event::{EventDispatcher, EventKind, SessionEvent};
use super::message::{AudioChunk, ChatMessage, Role, TurnTracker};
use super::state::{ConnectionState, ConversationState};
use super::transport::{ChannelCommand, ChannelEvent, ChannelRequest, Transport};
use crate::audio::pcm;
use crate::config::{AudioTransport, Config};
use crate::error::{ConnectionError, ProtocolError};
use crate::protocol::{ClientMessage, ServerMessage, SessionSettings, DEFAULT_AI_SAMPLE_RATE};

/// Everything `connect` needs to open one conversation.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backend_url: String,
    pub ws_path: String,
    pub token: Option<String>,
    pub sample_rate: u32,
    pub audio_transport: AudioTransport,
    /// Sent as `session.update` once the server reports `ready`.
    pub session: Option<SessionSettings>,
}

impl SessionConfig {
    pub fn from_config(config: &Config, token: Option<String>) -> Self {
        Self {
            backend_url: config.backend_url.clone(),
            ws_path: config.ws_path.clone(),
            token,
            sample_rate: config.sample_rate,
            audio_transport: config.audio_transport,
            session: Some(SessionSettings::from_config(config)),
        }
    }

    /// `http(s)://host` becomes `ws(s)://host/<ws_path>?token=..&voice=..`.
    pub fn channel_request(&self) -> Result<ChannelRequest, ConnectionError> {
        let mut url = Url::parse(&self.backend_url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ConnectionError::InvalidUrl(format!("unsupported scheme: {}", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| ConnectionError::InvalidUrl(self.backend_url.clone()))?;
        url.set_path(&self.ws_path);
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
            if let Some(session) = &self.session {
                query.append_pair("voice", &session.voice);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }

        Ok(ChannelRequest {
            url,
            bearer: self.token.clone(),
        })
    }
}

struct Inner {
    state: ConnectionState,
    conversation: ConversationState,
    /// Bumped on every connect and disconnect; stale channels compare
    /// against it and stand down.
    epoch: u64,
    outbound: Option<mpsc::Sender<ChannelCommand>>,
    reader: Option<JoinHandle<()>>,
    audio_transport: AudioTransport,
    sample_rate: u32,
    session: Option<SessionSettings>,
    turn: TurnTracker,
}

impl Inner {
    fn transition(&mut self, next: ConnectionState, events: &mut Vec<SessionEvent>) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            log::warn!("Ignoring state transition {:?} -> {:?}", self.state, next);
            return;
        }
        log::debug!("Session state {:?} -> {:?}", self.state, next);
        self.state = next;
        events.push(SessionEvent::StateChanged(next));
    }

    fn set_conversation(&mut self, next: ConversationState, events: &mut Vec<SessionEvent>) {
        if self.conversation != next {
            self.conversation = next;
            events.push(SessionEvent::ConversationChanged(next));
        }
    }

    /// Hand a command to the channel writer without waiting. A full or
    /// closed writer drops it.
    fn try_send(&self, command: ChannelCommand) -> bool {
        let Some(outbound) = &self.outbound else {
            return false;
        };
        match outbound.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Channel writer full, dropping outbound message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn send_message(&self, message: &ClientMessage) -> bool {
        match message.to_json() {
            Ok(json) => self.try_send(ChannelCommand::SendText(json)),
            Err(e) => {
                log::error!("Failed to encode client message: {}", e);
                false
            }
        }
    }
}

/// Client side of one realtime voice conversation.
///
/// Holds at most one channel. Never retries on its own: after an `Error`
/// the caller decides whether to `connect` again.
pub struct VoiceSessionClient<T: Transport> {
    transport: T,
    inner: Arc<Mutex<Inner>>,
    events: Arc<EventDispatcher>,
}

impl<T: Transport> VoiceSessionClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Idle,
                conversation: ConversationState::Idle,
                epoch: 0,
                outbound: None,
                reader: None,
                audio_transport: AudioTransport::Base64,
                sample_rate: 24000,
                session: None,
                turn: TurnTracker::default(),
            })),
            events: Arc::new(EventDispatcher::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_inner(&self.inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn conversation_state(&self) -> ConversationState {
        self.lock().conversation
    }

    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, handler);
    }

    /// Typed stream of every event from this session.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Open the realtime channel. A no-op while already connecting or
    /// connected.
    pub async fn connect(&self, config: &SessionConfig) -> Result<(), ConnectionError> {
        let request = config.channel_request()?;

        let mut pending = Vec::new();
        let epoch = {
            let mut inner = self.lock();
            if inner.state.is_active() {
                log::debug!("connect ignored, session already {:?}", inner.state);
                return Ok(());
            }
            inner.epoch += 1;
            inner.audio_transport = config.audio_transport;
            inner.sample_rate = config.sample_rate;
            inner.session = config.session.clone();
            inner.turn = TurnTracker::default();
            inner.transition(ConnectionState::Connecting, &mut pending);
            inner.epoch
        };
        self.events.emit_all(pending.drain(..));

        let channel = match self.transport.open(request).await {
            Ok(channel) => channel,
            Err(e) => {
                log::error!("Realtime channel failed to open: {}", e);
                {
                    let mut inner = self.lock();
                    if inner.epoch == epoch {
                        inner.transition(ConnectionState::Error, &mut pending);
                        pending.push(SessionEvent::Error(e.to_string()));
                    }
                }
                self.events.emit_all(pending);
                return Err(e);
            }
        };

        {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                // disconnect() ran during the handshake; dropping the channel closes it.
                log::info!("Connection established after disconnect, discarding");
                return Err(ConnectionError::Aborted);
            }
            inner.outbound = Some(channel.commands);
            inner.transition(ConnectionState::Connected, &mut pending);
            inner.reader = Some(tokio::spawn(read_loop(
                channel.events,
                self.inner.clone(),
                self.events.clone(),
                epoch,
            )));
        }
        log::info!("Voice session connected");
        self.events.emit_all(pending);
        Ok(())
    }

    /// Send one chunk of microphone audio. Dropped unless connected.
    /// Returns whether the chunk reached the channel writer.
    pub fn send_audio(&self, chunk: &AudioChunk) -> bool {
        let mut pending = Vec::new();
        let sent = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Connected {
                log::trace!("Dropping audio chunk #{} in state {:?}", chunk.sequence, inner.state);
                return false;
            }

            let sent = match inner.audio_transport {
                AudioTransport::Binary => inner.try_send(ChannelCommand::SendBinary(chunk.bytes.clone())),
                AudioTransport::Base64 => inner.send_message(&ClientMessage::AppendAudio {
                    audio: pcm::bytes_to_base64(&chunk.bytes),
                    sample_rate: inner.sample_rate,
                }),
            };
            if sent {
                inner.turn.add_user_samples(chunk.sample_count());
                if inner.conversation == ConversationState::Idle {
                    inner.set_conversation(ConversationState::Listening, &mut pending);
                }
            }
            sent
        };
        self.events.emit_all(pending);
        sent
    }

    /// Send a typed user message instead of speech.
    pub fn send_text(&self, text: &str) -> bool {
        let mut pending = Vec::new();
        let sent = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Connected {
                return false;
            }
            let sent = inner.send_message(&ClientMessage::Text { text: text.to_string() });
            if sent {
                pending.push(SessionEvent::Message(ChatMessage::new(Role::User, text, None)));
                inner.set_conversation(ConversationState::Processing, &mut pending);
            }
            sent
        };
        self.events.emit_all(pending);
        sent
    }

    /// Mark the end of the user's audio for this turn.
    pub fn commit_audio(&self) -> bool {
        self.send_control(ClientMessage::CommitAudio)
    }

    /// Discard audio the server has buffered but not yet committed.
    pub fn clear_audio(&self) -> bool {
        self.send_control(ClientMessage::ClearAudio)
    }

    /// Ask the AI to respond now.
    pub fn request_response(&self) -> bool {
        self.send_control(ClientMessage::CreateResponse)
    }

    pub fn update_session(&self, settings: SessionSettings) -> bool {
        self.send_control(ClientMessage::UpdateSession { session: settings })
    }

    fn send_control(&self, message: ClientMessage) -> bool {
        let inner = self.lock();
        if inner.state != ConnectionState::Connected {
            return false;
        }
        inner.send_message(&message)
    }

    /// Tear the channel down. Safe from any state; later sends are dropped.
    pub fn disconnect(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.lock();
            inner.epoch += 1;
            if inner.state == ConnectionState::Connected {
                // 告知服务器主动断开，队列满就算了
                inner.send_message(&ClientMessage::Disconnect);
            }
            inner.outbound = None;
            if let Some(reader) = inner.reader.take() {
                reader.abort();
            }
            if inner.state.is_active() {
                inner.transition(ConnectionState::Closed, &mut pending);
            }
            inner.set_conversation(ConversationState::Idle, &mut pending);
        }
        if !pending.is_empty() {
            log::info!("Voice session disconnected");
        }
        self.events.emit_all(pending);
    }
}

impl<T: Transport> Drop for VoiceSessionClient<T> {
    fn drop(&mut self) {
        let mut inner = self.lock();
        inner.outbound = None;
        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
    }
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

async fn read_loop(
    mut channel: mpsc::Receiver<ChannelEvent>,
    inner: Arc<Mutex<Inner>>,
    events: Arc<EventDispatcher>,
    epoch: u64,
) {
    while let Some(event) = channel.recv().await {
        let mut pending = Vec::new();
        let finished = {
            let mut guard = lock_inner(&inner);
            if guard.epoch != epoch {
                return;
            }
            match event {
                ChannelEvent::Text(text) => {
                    handle_text(&mut guard, &text, &mut pending);
                    false
                }
                ChannelEvent::Binary(data) => {
                    // 二进制帧不带采样率，按会话采样率处理
                    let samples = pcm::pcm16_bytes_to_float32(&data);
                    let rate = guard.sample_rate;
                    receive_ai_audio(&mut guard, samples, rate, &mut pending);
                    false
                }
                ChannelEvent::Closed(reason) => {
                    log::info!("Realtime channel closed: {}", reason.as_deref().unwrap_or("no reason"));
                    finish(&mut guard, ConnectionState::Closed, &mut pending);
                    true
                }
                ChannelEvent::Failed(reason) => {
                    log::error!("Realtime channel failed: {}", reason);
                    finish(&mut guard, ConnectionState::Error, &mut pending);
                    pending.push(SessionEvent::Error(reason));
                    true
                }
            }
        };
        events.emit_all(pending);
        if finished {
            return;
        }
    }

    // Transport dropped its sender without a close notice.
    let mut pending = Vec::new();
    {
        let mut guard = lock_inner(&inner);
        if guard.epoch != epoch {
            return;
        }
        finish(&mut guard, ConnectionState::Closed, &mut pending);
    }
    events.emit_all(pending);
}

fn finish(inner: &mut Inner, state: ConnectionState, pending: &mut Vec<SessionEvent>) {
    inner.outbound = None;
    inner.reader = None;
    inner.transition(state, pending);
    inner.set_conversation(ConversationState::Idle, pending);
}

fn receive_ai_audio(inner: &mut Inner, samples: Vec<f32>, sample_rate: u32, pending: &mut Vec<SessionEvent>) {
    inner.turn.add_assistant_audio(samples.len(), sample_rate);
    inner.set_conversation(ConversationState::Speaking, pending);
    pending.push(SessionEvent::Audio { samples, sample_rate });
}

fn report_protocol_error(error: ProtocolError, pending: &mut Vec<SessionEvent>) {
    log::warn!("Protocol error: {}", error);
    pending.push(SessionEvent::ProtocolError(error));
}

fn handle_text(inner: &mut Inner, text: &str, pending: &mut Vec<SessionEvent>) {
    let message = match ServerMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            report_protocol_error(e, pending);
            return;
        }
    };

    match message {
        ServerMessage::Ready => {
            log::info!("Server ready");
            pending.push(SessionEvent::Ready);
            if let Some(settings) = inner.session.clone() {
                inner.send_message(&ClientMessage::UpdateSession { session: settings });
            }
        }
        ServerMessage::AudioDelta { delta, sample_rate } => match pcm::base64_pcm16_to_float32(&delta) {
            Ok(samples) => receive_ai_audio(inner, samples, sample_rate.unwrap_or(DEFAULT_AI_SAMPLE_RATE), pending),
            Err(e) => report_protocol_error(e.into(), pending),
        },
        ServerMessage::AudioDone => {
            inner.set_conversation(ConversationState::Idle, pending);
        }
        ServerMessage::TranscriptDelta { content } => {
            inner.turn.push_assistant_delta(&content);
            if inner.conversation != ConversationState::Speaking {
                inner.set_conversation(ConversationState::Processing, pending);
            }
            pending.push(SessionEvent::Transcript {
                role: Role::Assistant,
                text: content,
                is_final: false,
            });
        }
        ServerMessage::TranscriptDone { content } => {
            let message = inner.turn.finish_assistant(content);
            log::debug!("Assistant: {}", message.content);
            pending.push(SessionEvent::Transcript {
                role: Role::Assistant,
                text: message.content.clone(),
                is_final: true,
            });
            pending.push(SessionEvent::Message(message));
        }
        ServerMessage::UserTranscript { content } => {
            let message = inner.turn.finish_user(content, inner.sample_rate);
            log::debug!("User: {}", message.content);
            pending.push(SessionEvent::Transcript {
                role: Role::User,
                text: message.content.clone(),
                is_final: true,
            });
            pending.push(SessionEvent::Message(message));
        }
        ServerMessage::SpeechStarted => {
            inner.turn.user_speech_started();
            inner.set_conversation(ConversationState::Listening, pending);
            pending.push(SessionEvent::SpeechStarted);
        }
        ServerMessage::SpeechStopped => {
            inner.set_conversation(ConversationState::Processing, pending);
            pending.push(SessionEvent::SpeechStopped);
        }
        ServerMessage::SessionReport { report } => {
            let report = report.unwrap_or_default();
            log::info!(
                "Scenario complete: {} with {}",
                report.place.as_deref().unwrap_or("?"),
                report.conversation_partner.as_deref().unwrap_or("?")
            );
            inner.set_conversation(ConversationState::Idle, pending);
            pending.push(SessionEvent::SessionReport(report));
        }
        ServerMessage::Error { message } => {
            log::warn!("Server reported error: {}", message);
            pending.push(SessionEvent::Error(message));
        }
        ServerMessage::Unknown => {
            log::debug!("Ignoring unknown server message: {}", text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    use crate::audio::pcm::float32_to_base64_pcm16;
    use crate::session::transport::Channel;

    /// The far end of a mock channel, held by the test.
    struct Peer {
        commands: mpsc::Receiver<ChannelCommand>,
        events: mpsc::Sender<ChannelEvent>,
    }

    impl Peer {
        async fn say(&self, json: &str) {
            self.events.send(ChannelEvent::Text(json.to_string())).await.unwrap();
        }
    }

    struct MockTransport {
        opens: Arc<AtomicUsize>,
        gate: Option<Arc<Notify>>,
        fail: bool,
        peers: mpsc::UnboundedSender<Peer>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(&self, _request: ChannelRequest) -> Result<Channel, ConnectionError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(ConnectionError::Handshake("connection refused".into()));
            }
            let (cmd_tx, cmd_rx) = mpsc::channel(16);
            let (event_tx, event_rx) = mpsc::channel(16);
            let _ = self.peers.send(Peer { commands: cmd_rx, events: event_tx });
            Ok(Channel { commands: cmd_tx, events: event_rx })
        }
    }

    struct Harness {
        client: Arc<VoiceSessionClient<MockTransport>>,
        opens: Arc<AtomicUsize>,
        peers: mpsc::UnboundedReceiver<Peer>,
    }

    fn harness(gate: Option<Arc<Notify>>, fail: bool) -> Harness {
        let opens = Arc::new(AtomicUsize::new(0));
        let (peer_tx, peers) = mpsc::unbounded_channel();
        let transport = MockTransport {
            opens: opens.clone(),
            gate,
            fail,
            peers: peer_tx,
        };
        Harness {
            client: Arc::new(VoiceSessionClient::new(transport)),
            opens,
            peers,
        }
    }

    fn session_config(audio_transport: AudioTransport) -> SessionConfig {
        SessionConfig {
            backend_url: "http://localhost:8000".into(),
            ws_path: "/api/v1/ws/scenario".into(),
            token: Some("tok".into()),
            sample_rate: 24000,
            audio_transport,
            session: None,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(2), rx.recv()).await.expect("event").expect("open stream")
    }

    /// Wait for the first event matching `pred`, skipping others.
    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        pred: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        loop {
            let event = next_event(rx).await;
            if pred(&event) {
                return event;
            }
        }
    }

    async fn connected() -> (Harness, Peer) {
        let mut h = harness(None, false);
        h.client.connect(&session_config(AudioTransport::Binary)).await.unwrap();
        let peer = h.peers.recv().await.unwrap();
        (h, peer)
    }

    #[test]
    fn channel_url_swaps_scheme_and_adds_query() {
        let request = session_config(AudioTransport::Binary).channel_request().unwrap();
        assert_eq!(request.url.as_str(), "ws://localhost:8000/api/v1/ws/scenario?token=tok");
        assert_eq!(request.bearer.as_deref(), Some("tok"));

        let mut config = session_config(AudioTransport::Binary);
        config.backend_url = "https://api.example.com".into();
        config.token = None;
        let request = config.channel_request().unwrap();
        assert_eq!(request.url.as_str(), "wss://api.example.com/api/v1/ws/scenario");

        config.backend_url = "ftp://example.com".into();
        assert!(matches!(config.channel_request(), Err(ConnectionError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn double_connect_while_connecting_opens_one_channel() {
        let gate = Arc::new(Notify::new());
        let mut h = harness(Some(gate.clone()), false);
        let config = session_config(AudioTransport::Binary);

        let first = {
            let client = h.client.clone();
            let config = config.clone();
            tokio::spawn(async move { client.connect(&config).await })
        };
        while h.opens.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.client.state(), ConnectionState::Connecting);

        // Second call is a no-op, not an error.
        h.client.connect(&config).await.unwrap();
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);

        gate.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(h.client.state(), ConnectionState::Connected);
        assert!(h.peers.recv().await.is_some());

        // Also a no-op once connected.
        h.client.connect(&config).await.unwrap();
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handshake_failure_moves_to_error_without_retry() {
        let h = harness(None, true);
        let mut events = h.client.subscribe();

        let err = h.client.connect(&session_config(AudioTransport::Binary)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Handshake(_)));
        assert_eq!(h.client.state(), ConnectionState::Error);

        assert_eq!(next_event(&mut events).await, SessionEvent::StateChanged(ConnectionState::Connecting));
        assert_eq!(next_event(&mut events).await, SessionEvent::StateChanged(ConnectionState::Error));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Error(reason) if reason.contains("refused")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);

        // Caller-driven reconnect goes back through Connecting.
        let _ = h.client.connect(&session_config(AudioTransport::Binary)).await;
        assert_eq!(h.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn audio_is_dropped_unless_connected() {
        let h = harness(None, false);
        let chunk = AudioChunk::from_samples(&[0.1; 16], 0);
        assert!(!h.client.send_audio(&chunk));

        let (h, mut peer) = connected().await;
        assert!(h.client.send_audio(&chunk));
        match peer.commands.recv().await.unwrap() {
            ChannelCommand::SendBinary(bytes) => assert_eq!(bytes.len(), 32),
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(h.client.conversation_state(), ConversationState::Listening);

        h.client.disconnect();
        assert_eq!(h.client.state(), ConnectionState::Closed);
        assert!(!h.client.send_audio(&chunk));
        let ChannelCommand::SendText(notice) = peer.commands.recv().await.unwrap() else {
            panic!("expected disconnect notice");
        };
        assert_eq!(notice, r#"{"type":"disconnect"}"#);
        assert!(peer.commands.recv().await.is_none());
    }

    #[tokio::test]
    async fn disconnect_notice_goes_out_once() {
        let (h, mut peer) = connected().await;
        h.client.disconnect();
        h.client.disconnect();

        assert!(matches!(
            peer.commands.recv().await,
            Some(ChannelCommand::SendText(json)) if json.contains("\"disconnect\"")
        ));
        assert!(peer.commands.recv().await.is_none());
    }

    #[tokio::test]
    async fn base64_audio_uses_append_envelopes() {
        let mut h = harness(None, false);
        h.client.connect(&session_config(AudioTransport::Base64)).await.unwrap();
        let mut peer = h.peers.recv().await.unwrap();

        let chunk = AudioChunk::from_samples(&[0.0, 0.5], 3);
        assert!(h.client.send_audio(&chunk));
        let ChannelCommand::SendText(json) = peer.commands.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "input_audio_buffer.append");
        assert_eq!(value["audio"], pcm::bytes_to_base64(&chunk.bytes).as_str());
        assert_eq!(value["sample_rate"], 24000);
    }

    #[tokio::test]
    async fn inbound_messages_become_events() {
        let (h, peer) = connected().await;
        let mut events = h.client.subscribe();
        let transcripts = Arc::new(AtomicUsize::new(0));
        let counter = transcripts.clone();
        h.client.on(EventKind::Transcript, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        peer.say(r#"{"type":"speech-started"}"#).await;
        assert_eq!(wait_for(&mut events, |e| e.kind() == EventKind::SpeechStarted).await, SessionEvent::SpeechStarted);

        peer.say(r#"{"type":"user.transcript","content":"I'd like a latte"}"#).await;
        let SessionEvent::Message(user) = wait_for(&mut events, |e| e.kind() == EventKind::Message).await else {
            unreachable!()
        };
        assert_eq!(user.role, Role::User);
        assert_eq!(user.content, "I'd like a latte");

        let audio = float32_to_base64_pcm16(&[0.25; 2400]);
        peer.say(&format!(r#"{{"type":"audio.delta","delta":"{}"}}"#, audio)).await;
        let SessionEvent::Audio { samples, sample_rate } =
            wait_for(&mut events, |e| e.kind() == EventKind::Audio).await
        else {
            unreachable!()
        };
        assert_eq!(samples.len(), 2400);
        assert_eq!(sample_rate, 24000);
        assert_eq!(h.client.conversation_state(), ConversationState::Speaking);

        peer.say(r#"{"type":"transcript.delta","content":"Sure, "}"#).await;
        peer.say(r#"{"type":"transcript","content":"Sure, one latte."}"#).await;
        let SessionEvent::Message(reply) = wait_for(&mut events, |e| e.kind() == EventKind::Message).await else {
            unreachable!()
        };
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, "Sure, one latte.");
        assert_eq!(reply.duration_sec, Some(0.1));

        peer.say(r#"{"type":"audio.done"}"#).await;
        assert_eq!(
            wait_for(&mut events, |e| e.kind() == EventKind::ConversationChanged).await,
            SessionEvent::ConversationChanged(ConversationState::Idle)
        );
        // user final + assistant delta + assistant final
        assert_eq!(transcripts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn audio_field_and_rate_drive_assistant_duration() {
        let (h, peer) = connected().await;
        let mut events = h.client.subscribe();

        // 0.1s at 16 kHz, then 0.1s with no rate given
        let slow = float32_to_base64_pcm16(&[0.1; 1600]);
        peer.say(&format!(r#"{{"type":"audio.delta","audio":"{}","sample_rate":16000}}"#, slow)).await;
        let fast = float32_to_base64_pcm16(&[0.1; 2400]);
        peer.say(&format!(r#"{{"type":"audio.delta","data":"{}"}}"#, fast)).await;

        let SessionEvent::Audio { samples, sample_rate } =
            wait_for(&mut events, |e| e.kind() == EventKind::Audio).await
        else {
            unreachable!()
        };
        assert_eq!((samples.len(), sample_rate), (1600, 16000));
        let SessionEvent::Audio { sample_rate, .. } = wait_for(&mut events, |e| e.kind() == EventKind::Audio).await
        else {
            unreachable!()
        };
        assert_eq!(sample_rate, DEFAULT_AI_SAMPLE_RATE);

        peer.say(r#"{"type":"transcript.done","content":"Welcome in."}"#).await;
        let SessionEvent::Message(reply) = wait_for(&mut events, |e| e.kind() == EventKind::Message).await else {
            unreachable!()
        };
        assert_eq!(reply.duration_sec, Some(0.2));
    }

    #[tokio::test]
    async fn session_report_ends_the_scenario() {
        let (h, peer) = connected().await;
        let mut events = h.client.subscribe();
        let reports = Arc::new(AtomicUsize::new(0));
        let counter = reports.clone();
        h.client.on(EventKind::SessionReport, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        peer.say(&format!(r#"{{"type":"audio.delta","delta":"{}"}}"#, float32_to_base64_pcm16(&[0.0; 240])))
            .await;
        peer.say(
            r#"{"type":"session.report","report":{"place":"cafe","conversation_partner":"barista","conversation_goal":"order a latte","sessionId":"s-1"}}"#,
        )
        .await;
        let SessionEvent::SessionReport(report) = wait_for(&mut events, |e| e.kind() == EventKind::SessionReport).await
        else {
            unreachable!()
        };
        assert_eq!(report.place.as_deref(), Some("cafe"));
        assert_eq!(report.conversation_partner.as_deref(), Some("barista"));
        assert_eq!(report.conversation_goal.as_deref(), Some("order a latte"));
        assert_eq!(report.session_id.as_deref(), Some("s-1"));
        assert_eq!(h.client.conversation_state(), ConversationState::Idle);

        // Older backends send the same payload under `json`.
        peer.say(r#"{"type":"scenario.completed","json":{"place":"airport","sessionId":7}}"#).await;
        let SessionEvent::SessionReport(report) = wait_for(&mut events, |e| e.kind() == EventKind::SessionReport).await
        else {
            unreachable!()
        };
        assert_eq!(report.place.as_deref(), Some("airport"));
        assert_eq!(report.session_id.as_deref(), Some("7"));
        assert_eq!(reports.load(Ordering::SeqCst), 2);
        assert_eq!(h.client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn unknown_and_malformed_messages_are_not_fatal() {
        let (h, peer) = connected().await;
        let mut events = h.client.subscribe();

        peer.say(r#"{"type":"rate_limits.updated"}"#).await;
        peer.say("{not json").await;
        peer.say(r#"{"type":"audio.delta","delta":"%%%"}"#).await;
        peer.say(r#"{"type":"error","message":"upstream busy"}"#).await;

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::ProtocolError(ProtocolError::MalformedMessage(_))
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::ProtocolError(ProtocolError::InvalidAudio(_))
        ));
        assert_eq!(next_event(&mut events).await, SessionEvent::Error("upstream busy".into()));
        assert_eq!(h.client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn ready_triggers_session_update() {
        let mut h = harness(None, false);
        let mut config = session_config(AudioTransport::Binary);
        config.session = Some(SessionSettings::from_config(&Config::new().unwrap()));
        h.client.connect(&config).await.unwrap();
        let mut peer = h.peers.recv().await.unwrap();

        peer.say(r#"{"type":"ready"}"#).await;
        let ChannelCommand::SendText(json) = peer.commands.recv().await.unwrap() else {
            panic!("expected session.update");
        };
        assert!(json.contains("\"session.update\""));
    }

    #[tokio::test]
    async fn transport_failure_moves_to_error() {
        let (h, peer) = connected().await;
        let mut events = h.client.subscribe();

        peer.events.send(ChannelEvent::Failed("connection reset".into())).await.unwrap();
        assert_eq!(
            wait_for(&mut events, |e| e.kind() == EventKind::StateChanged).await,
            SessionEvent::StateChanged(ConnectionState::Error)
        );
        assert_eq!(next_event(&mut events).await, SessionEvent::Error("connection reset".into()));
        assert!(!h.client.send_audio(&AudioChunk::from_samples(&[0.0], 0)));
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_close_moves_to_closed() {
        let (h, peer) = connected().await;
        let mut events = h.client.subscribe();
        drop(peer);
        assert_eq!(
            wait_for(&mut events, |e| e.kind() == EventKind::StateChanged).await,
            SessionEvent::StateChanged(ConnectionState::Closed)
        );
    }

    #[tokio::test]
    async fn disconnect_during_handshake_discards_channel() {
        let gate = Arc::new(Notify::new());
        let mut h = harness(Some(gate.clone()), false);
        let pending = {
            let client = h.client.clone();
            tokio::spawn(async move { client.connect(&session_config(AudioTransport::Binary)).await })
        };
        while h.opens.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        h.client.disconnect();
        assert_eq!(h.client.state(), ConnectionState::Closed);
        gate.notify_one();

        assert_eq!(pending.await.unwrap(), Err(ConnectionError::Aborted));
        assert_eq!(h.client.state(), ConnectionState::Closed);
        let mut peer = h.peers.recv().await.unwrap();
        assert!(peer.commands.recv().await.is_none());
    }

    #[tokio::test]
    async fn disconnect_from_idle_is_harmless() {
        let h = harness(None, false);
        let mut events = h.client.subscribe();
        h.client.disconnect();
        h.client.disconnect();
        assert_eq!(h.client.state(), ConnectionState::Idle);
        assert!(events.try_recv().is_err());
    }
}
