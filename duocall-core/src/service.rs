//! Process-scoped call service
//!
//! One [`CallService`] owns the registry, the signaling queue and the
//! post-processing queue, plus the collaborator handles; the transport
//! host constructs it at startup, feeds every callback through it and
//! shuts it down explicitly. There are no process-wide statics.

use crate::call::{now_millis, Call};
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::gateway::{Authorizer, MediaGateway};
use crate::postproc::{self, PostProcessor, RecordingJob};
use crate::recording::{ActiveRecorder, RecorderFactory, RecorderKind};
use crate::registry::SessionRegistry;
use crate::session::UserSession;
use crate::signaling::{SignalingItem, SignalingProcessor};
use crate::types::HandleId;
use duocall_proto::{Event, EventResult, Jsep, RecordingInfo, SessionInfo};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct ServiceShared {
    pub(crate) config: CoreConfig,
    pub(crate) registry: SessionRegistry,
    pub(crate) gateway: Arc<dyn MediaGateway>,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) recorder_factory: Arc<dyn RecorderFactory>,
    pub(crate) signal_tx: mpsc::UnboundedSender<SignalingItem>,
    record_tx: Mutex<Option<mpsc::UnboundedSender<RecordingJob>>>,
}

/// The call-signaling and media-relay core.
pub struct CallService {
    shared: Arc<ServiceShared>,
    signal_worker: Mutex<Option<JoinHandle<()>>>,
    record_worker: Mutex<Option<JoinHandle<()>>>,
}

impl CallService {
    /// Build the service and spawn its two workers. Must run inside a
    /// Tokio runtime.
    pub fn new(
        config: CoreConfig,
        gateway: Arc<dyn MediaGateway>,
        authorizer: Arc<dyn Authorizer>,
        recorder_factory: Arc<dyn RecorderFactory>,
        post_processor: Arc<dyn PostProcessor>,
    ) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ServiceShared {
            config,
            registry: SessionRegistry::new(),
            gateway,
            authorizer,
            recorder_factory,
            signal_tx,
            record_tx: Mutex::new(Some(record_tx)),
        });
        let processor = SignalingProcessor::new(Arc::clone(&shared), signal_rx);
        let signal_worker = tokio::spawn(processor.run());
        let record_worker = postproc::spawn_worker(record_rx, post_processor);
        info!(
            record_dir = %shared.config.record_dir.display(),
            ring_timeout_secs = shared.config.ring_timeout_secs,
            "call service started"
        );
        Arc::new(Self {
            shared,
            signal_worker: Mutex::new(Some(signal_worker)),
            record_worker: Mutex::new(Some(record_worker)),
        })
    }

    /// Stop the signaling worker, then let the post-processing worker
    /// drain its queue and exit.
    pub async fn shutdown(&self) {
        let _ = self.shared.signal_tx.send(SignalingItem::Shutdown);
        let signal_worker = self.signal_worker.lock().take();
        if let Some(worker) = signal_worker {
            if let Err(error) = worker.await {
                warn!(%error, "signaling worker ended abnormally");
            }
        }
        // Dropping the sender closes the record queue once queued jobs are
        // handed over.
        self.shared.record_tx.lock().take();
        let record_worker = self.record_worker.lock().take();
        if let Some(worker) = record_worker {
            if let Err(error) = worker.await {
                warn!(%error, "record worker ended abnormally");
            }
        }
        info!("call service stopped");
    }

    /// A new transport connection: bind an anonymous session to it.
    pub fn create_session(&self, handle: HandleId) -> Result<()> {
        if self.shared.registry.session_for_handle(handle).is_some() {
            return Err(Error::Internal(format!("handle {handle} already bound")));
        }
        let session = Arc::new(UserSession::new());
        session.attach_handle(handle);
        self.shared.registry.bind_handle(handle, session);
        debug!(%handle, "session created");
        Ok(())
    }

    /// A transport connection went away for good. Tears down any call this
    /// handle carried, then drops the identity once its last handle is gone.
    pub fn destroy_session(&self, handle: HandleId) -> Result<()> {
        let Some(session) = self.shared.registry.session_for_handle(handle) else {
            return Err(Error::Internal(format!("no session for handle {handle}")));
        };
        self.shared.teardown_media(handle);
        session.detach_handle(handle);
        self.shared.registry.unbind_handle(handle);
        if session.handle_count() == 0 {
            if let Some(username) = session.username() {
                self.shared.registry.unregister(&username);
            }
            session.mark_destroyed();
            debug!(%handle, username = ?session.username(), "session destroyed");
        }
        Ok(())
    }

    /// Enqueue a signaling request; the reply arrives later as a pushed
    /// event carrying the transaction.
    pub fn handle_message(
        &self,
        handle: HandleId,
        transaction: Option<String>,
        payload: serde_json::Value,
        jsep: Option<Jsep>,
    ) -> Result<()> {
        self.shared
            .signal_tx
            .send(SignalingItem::Message {
                handle,
                transaction,
                payload,
                jsep,
            })
            .map_err(|_| Error::Internal("signaling queue is closed".to_string()))
    }

    /// Media started flowing on this handle.
    pub fn setup_media(&self, handle: HandleId) {
        self.shared.media_started(handle);
    }

    /// Media is gone on this handle: disconnect, transport error, or the
    /// close requested after an explicit hangup. Idempotent.
    pub fn hangup_media(&self, handle: HandleId) {
        self.shared.teardown_media(handle);
    }

    pub fn incoming_rtp(&self, handle: HandleId, packet: &crate::media::RtpPacket) {
        self.shared.relay_rtp(handle, packet);
    }

    pub fn incoming_rtcp(&self, handle: HandleId, packet: &crate::media::RtcpPacket) {
        self.shared.relay_rtcp(handle, packet);
    }

    pub fn incoming_data(&self, handle: HandleId, packet: &crate::media::DataPacket) {
        self.shared.relay_data(handle, packet);
    }

    /// The transport noticed sustained loss on one direction.
    pub fn slow_link(&self, handle: HandleId, uplink: bool, video: bool) {
        let Some(session) = self.shared.registry.session_for_handle(handle) else {
            return;
        };
        if session.is_destroyed() {
            return;
        }
        session.bump_slow_link();
        let (audio_active, video_active, bitrate_cap) = {
            let state = session.state();
            (state.audio_active, state.video_active, state.bitrate_cap)
        };
        if uplink && !video && !audio_active {
            // Audio forwarding is off; the peer's NACKs are expected.
            debug!(%handle, "slow uplink for muted audio, ignoring");
        } else if uplink && video && !video_active {
            debug!(%handle, "slow uplink for muted video, ignoring");
        } else {
            warn!(
                %handle,
                direction = if uplink { "uplink" } else { "downlink" },
                media = if video { "video" } else { "audio" },
                "lots of lost packets"
            );
            if !uplink {
                self.shared.push_result(
                    handle,
                    None,
                    EventResult::SlowLink {
                        media: if video { "video" } else { "audio" }.to_string(),
                        current_bitrate: video.then_some(bitrate_cap),
                    },
                    None,
                );
            }
        }
    }

    /// Diagnostic snapshot of the session behind a handle.
    #[must_use]
    pub fn query_session(&self, handle: HandleId) -> Option<SessionInfo> {
        let session = self.shared.registry.session_for_handle(handle)?;
        let state = session.state();
        let peer = state
            .peer
            .as_ref()
            .and_then(|name| self.shared.registry.lookup(name));
        let mut info = SessionInfo {
            state: if state.peer.is_some() { "incall" } else { "idle" }.to_string(),
            username: state.username.clone(),
            in_call: session.in_call(),
            hanging_up: session.is_hanging_up(),
            destroyed: session.is_destroyed(),
            ..Default::default()
        };
        if let Some(peer) = &peer {
            info.peer = peer.username();
            info.audio_active = Some(state.audio_active);
            info.video_active = Some(state.video_active);
            info.audio_codec = state.audio_codec.map(|codec| codec.name().to_string());
            info.video_codec = state.video_codec.map(|codec| codec.name().to_string());
            info.bitrate = Some(state.bitrate_cap);
            info.peer_bitrate = Some(state.peer_reported_bitrate);
            info.slow_link_count = Some(session.slow_link_count());
        }
        drop(state);
        {
            let relay = session.relay();
            if relay.layers.is_enabled() {
                info.simulcast = Some(true);
            }
        }
        if let Some(peer) = &peer {
            if peer.relay().layers.is_enabled() {
                let relay = session.relay();
                info.substream = Some(relay.sim.substream());
                info.substream_target = Some(relay.sim.substream_target());
                info.temporal_layer = Some(relay.sim.templayer());
                info.temporal_layer_target = Some(relay.sim.templayer_target());
            }
        }
        {
            let recorders = session.recorders();
            let audio = recorders
                .audio
                .as_ref()
                .map(|r| r.path.display().to_string());
            let video = recorders
                .video
                .as_ref()
                .map(|r| r.path.display().to_string());
            let data = recorders.data.as_ref().map(|r| r.path.display().to_string());
            if audio.is_some() || video.is_some() || data.is_some() {
                info.recording = Some(RecordingInfo { audio, video, data });
            }
        }
        Some(info)
    }

    /// Registered usernames, in no particular order.
    #[must_use]
    pub fn registered_users(&self) -> Vec<String> {
        self.shared.registry.usernames()
    }
}

impl ServiceShared {
    pub(crate) fn push_result(
        &self,
        handle: HandleId,
        transaction: Option<&str>,
        result: EventResult,
        jsep: Option<&Jsep>,
    ) {
        let event = Event::result(result);
        self.gateway.push_event(handle, transaction, &event, jsep);
    }

    pub(crate) fn push_error(&self, handle: HandleId, transaction: Option<&str>, error: &Error) {
        let event = Event::error(error.code(), error.to_string());
        self.gateway.push_event(handle, transaction, &event, None);
    }

    pub(crate) fn notify(&self, handle: HandleId, info: serde_json::Value) {
        if self.config.notify_events && self.gateway.events_enabled() {
            self.gateway.notify_event(handle, info);
        }
    }

    /// Media became available on a handle. The call goes to STARTED when
    /// the second side's media shows up; recording starts here if it was
    /// requested.
    pub(crate) fn media_started(&self, handle: HandleId) {
        let Some(session) = self.registry.session_for_handle(handle) else {
            warn!(%handle, "media setup for unknown handle");
            return;
        };
        if session.is_destroyed() {
            return;
        }
        info!(%handle, "media is flowing");
        let peer = session
            .peer_username()
            .and_then(|name| self.registry.lookup(&name));
        if let (Some(call), Some(peer)) = (session.current_call(), peer) {
            if peer.has_media_started() && call.begin_media(now_millis()) {
                if call.take_record_request() {
                    self.start_recording(&call, &session, &peer);
                }
                info!("call started");
            }
        }
        session.set_media_started(true);
        session.end_hangup();
    }

    fn start_recording(&self, call: &Call, session: &Arc<UserSession>, peer: &Arc<UserSession>) {
        let (start_time, _) = call.timestamps();
        info!(path = %self.config.record_dir.display(), "recording call");
        for side in [session, peer] {
            let (has_audio, has_video, audio_codec, video_codec, username) = {
                let state = side.state();
                (
                    state.has_audio,
                    state.has_video,
                    state.audio_codec,
                    state.video_codec,
                    state.username.clone(),
                )
            };
            let username = username.unwrap_or_else(|| "unknown".to_string());
            let mut kickstart_video = false;
            {
                let mut recorders = side.recorders();
                if has_audio {
                    let path: PathBuf = self
                        .config
                        .record_dir
                        .join(format!("{username}-{start_time}_audio"));
                    let codec = audio_codec.map_or("opus", |codec| codec.name());
                    match self
                        .recorder_factory
                        .open(RecorderKind::Audio, codec, &path)
                    {
                        Ok(recorder) => {
                            recorders.audio = Some(ActiveRecorder::new(path, recorder));
                        }
                        Err(error) => {
                            warn!(%username, %error, "couldn't open audio recording, continuing unrecorded");
                        }
                    }
                }
                if has_video && call.is_video() {
                    let path: PathBuf = self
                        .config
                        .record_dir
                        .join(format!("{username}-{start_time}_video"));
                    let codec = video_codec.map_or("vp8", |codec| codec.name());
                    match self
                        .recorder_factory
                        .open(RecorderKind::Video, codec, &path)
                    {
                        Ok(recorder) => {
                            recorders.video = Some(ActiveRecorder::new(path, recorder));
                            kickstart_video = true;
                        }
                        Err(error) => {
                            warn!(%username, %error, "couldn't open video recording, continuing unrecorded");
                        }
                    }
                }
            }
            if kickstart_video {
                // A keyframe makes the recording decodable from the start.
                if let Some(side_handle) = side.active_handle() {
                    self.gateway.request_keyframe(side_handle);
                }
            }
        }
    }

    /// The one teardown routine. Every way a call can end (hangup request,
    /// disconnect, reject/missed/timeout closes) funnels into it via the
    /// transport's hangup callback; it is idempotent and balances both
    /// sides of the pairing.
    pub(crate) fn teardown_media(&self, handle: HandleId) {
        let Some(session) = self.registry.session_for_handle(handle) else {
            return;
        };
        if session.is_destroyed() {
            return;
        }
        match session.active_handle() {
            None => return,
            Some(active) if active != handle => {
                debug!(%handle, %active, "ignoring teardown from a non-media handle");
                return;
            }
            Some(_) => {}
        }
        if !session.begin_hangup() {
            return;
        }
        info!(%handle, username = ?session.username(), "tearing down media");

        let peer = session
            .peer_username()
            .and_then(|name| self.registry.lookup(&name));
        if let Some(call) = session.current_call() {
            if let Some(stop) = call.finalize(now_millis()) {
                let record_path =
                    self.finish_recording(&call, &session, peer.as_ref(), stop.start_time);
                let result = EventResult::Stop {
                    call_state: stop.state.code(),
                    start_time: Some(stop.start_time),
                    stop_time: Some(stop.stop_time),
                    record_path,
                };
                self.push_result(handle, None, result.clone(), None);
                if let Some(peer_handle) = peer.as_ref().and_then(|p| p.active_handle()) {
                    self.push_result(peer_handle, None, result, None);
                }
                info!(state = ?stop.state, "call stopped");
            }
        }

        session.state().peer = None;
        if let Some(peer) = &peer {
            match peer.active_handle() {
                Some(peer_handle) => self.gateway.close_connection(peer_handle),
                None => {
                    // The peer never reached media, so no close will come
                    // back for it; release its side of the pairing here.
                    peer.leave_call();
                    let mut state = peer.state();
                    state.peer = None;
                    state.call = None;
                }
            }
        }

        session.reset_media_state();
        session.leave_call();
        {
            let mut state = session.state();
            state.call = None;
            state.active_handle = None;
        }
        session.set_media_started(false);
        session.end_hangup();
    }

    /// Close both sides' recorders and queue the muxing job. Returns the
    /// announced artifact path when anything was recorded.
    fn finish_recording(
        &self,
        call: &Call,
        session: &Arc<UserSession>,
        peer: Option<&Arc<UserSession>>,
        start_time: i64,
    ) -> Option<String> {
        let mine = session.recorders().close_all();
        let theirs = peer
            .map(|peer| peer.recorders().close_all())
            .unwrap_or_default();
        if mine.is_empty() && theirs.is_empty() {
            return None;
        }
        let is_video = call.is_video();
        let output = format!(
            "{}_{}-{}-{}",
            if is_video { "videocall" } else { "audiocall" },
            session.username().unwrap_or_else(|| "unknown".to_string()),
            peer.and_then(|p| p.username())
                .unwrap_or_else(|| "unknown".to_string()),
            start_time,
        );
        let job = RecordingJob {
            dir: self.config.record_dir.clone(),
            is_video,
            audio_1: mine.audio,
            video_1: mine.video.filter(|_| is_video),
            audio_2: theirs.audio,
            video_2: theirs.video.filter(|_| is_video),
            output,
        };
        let artifact = job.artifact_path().display().to_string();
        match &*self.record_tx.lock() {
            Some(tx) => {
                if tx.send(job).is_err() {
                    warn!("record queue is closed, dropping job");
                }
            }
            None => warn!("record queue already shut down, dropping job"),
        }
        Some(artifact)
    }
}
