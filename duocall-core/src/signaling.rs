//! Serialized signaling worker
//!
//! One task consumes the signaling FIFO and is the only writer of session
//! linkage (`peer`, `call`) anywhere in the process. That serialization is
//! what makes cross-session pairing safe without a global lock on the
//! packet path: relay threads only ever read linkage the worker installed
//! earlier. Lock order within a message is fixed: registry, then caller
//! session, then callee session, then the call.

use crate::call::{now_millis, Call, CallState};
use crate::error::{Error, Result};
use crate::service::ServiceShared;
use crate::session::UserSession;
use crate::simulcast::{SimulcastLayers, MAX_LAYER};
use crate::types::{AudioCodec, HandleId, VideoCodec};
use duocall_proto::{EventResult, Jsep, Request, SetUpdate};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Items travelling on the signaling FIFO.
pub(crate) enum SignalingItem {
    /// A request from a transport handle.
    Message {
        handle: HandleId,
        transaction: Option<String>,
        payload: serde_json::Value,
        jsep: Option<Jsep>,
    },
    /// Ring timer fired for the call originated by `caller`.
    RingDeadline { caller: String },
    Shutdown,
}

pub(crate) struct SignalingProcessor {
    shared: Arc<ServiceShared>,
    rx: mpsc::UnboundedReceiver<SignalingItem>,
}

impl SignalingProcessor {
    pub(crate) fn new(
        shared: Arc<ServiceShared>,
        rx: mpsc::UnboundedReceiver<SignalingItem>,
    ) -> Self {
        Self { shared, rx }
    }

    pub(crate) async fn run(mut self) {
        debug!("signaling worker started");
        while let Some(item) = self.rx.recv().await {
            match item {
                SignalingItem::Shutdown => break,
                SignalingItem::Message {
                    handle,
                    transaction,
                    payload,
                    jsep,
                } => self.process_message(handle, transaction.as_deref(), &payload, jsep.as_ref()),
                SignalingItem::RingDeadline { caller } => self.check_ring_deadline(&caller),
            }
        }
        debug!("signaling worker stopped");
    }

    fn process_message(
        &self,
        handle: HandleId,
        transaction: Option<&str>,
        payload: &serde_json::Value,
        jsep: Option<&Jsep>,
    ) {
        let Some(session) = self.shared.registry.session_for_handle(handle) else {
            warn!(%handle, "message for unknown handle");
            return;
        };
        if session.is_destroyed() {
            return;
        }
        match self.dispatch(handle, &session, payload, jsep) {
            Ok(Some(result)) => self.shared.push_result(handle, transaction, result, None),
            Ok(None) => {}
            Err(error) => {
                warn!(%handle, code = error.code(), %error, "request rejected");
                self.shared.push_error(handle, transaction, &error);
            }
        }
    }

    fn dispatch(
        &self,
        handle: HandleId,
        session: &Arc<UserSession>,
        payload: &serde_json::Value,
        jsep: Option<&Jsep>,
    ) -> Result<Option<EventResult>> {
        if payload.is_null() {
            return Err(Error::NoMessage);
        }
        let request = Request::from_value(payload)?;
        match request {
            Request::List => Ok(Some(EventResult::List {
                list: self.shared.registry.usernames(),
            })),
            Request::Login { username } => self.handle_login(handle, session, username),
            Request::Call {
                username,
                videocall,
                record,
                duration,
            } => self.handle_call(handle, session, username, videocall, record, duration, jsep),
            Request::Accept => self.handle_accept(handle, session, jsep),
            Request::Reject => self.handle_reject(handle, session),
            Request::Ringing => self.handle_ringing(session),
            Request::Set(update) => self.handle_set(handle, session, &update, jsep),
            Request::Hangup => self.handle_hangup(handle, session),
        }
    }

    fn handle_login(
        &self,
        handle: HandleId,
        session: &Arc<UserSession>,
        username: String,
    ) -> Result<Option<EventResult>> {
        if let Some(current) = session.username() {
            return Err(Error::AlreadyRegistered(current));
        }
        if !self.shared.authorizer.is_username_authorized(&username) {
            return Err(Error::Unauthorized(username));
        }
        if let Some(existing) = self.shared.registry.lookup(&username) {
            // Second device logging in as an existing identity: attach the
            // handle there and retire the anonymous placeholder session.
            existing.attach_handle(handle);
            self.shared
                .registry
                .rebind_handle(handle, Arc::clone(&existing));
            session.detach_handle(handle);
            session.mark_destroyed();
            info!(%username, %handle, "additional handle attached to identity");
        } else {
            self.shared.registry.register(&username, session)?;
            session.state().username = Some(username.clone());
            info!(%username, %handle, "user logged in");
        }
        self.shared
            .notify(handle, json!({"event": "connected", "username": username}));
        Ok(Some(EventResult::Connected { username }))
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_call(
        &self,
        handle: HandleId,
        session: &Arc<UserSession>,
        callee_name: String,
        videocall: Option<bool>,
        record: Option<bool>,
        duration: Option<u32>,
        jsep: Option<&Jsep>,
    ) -> Result<Option<EventResult>> {
        let gateway = &self.shared.gateway;
        let Some(caller_name) = session.username() else {
            gateway.close_connection(handle);
            return Err(Error::RegisterFirst);
        };
        if session.peer_username().is_some() {
            gateway.close_connection(handle);
            return Err(Error::AlreadyInCall);
        }
        if !session.try_enter_call() {
            gateway.close_connection(handle);
            return Err(Error::AlreadyInCall);
        }
        // The caller's call slot is held from here on; every exit below
        // must release it.
        if callee_name == caller_name {
            session.leave_call();
            gateway.close_connection(handle);
            return Err(Error::SelfCall);
        }
        let callee = match self.shared.registry.lookup(&callee_name) {
            Some(callee) if !callee.is_destroyed() => callee,
            _ => {
                session.leave_call();
                gateway.close_connection(handle);
                return Err(Error::NoSuchUsername(callee_name));
            }
        };
        if callee.in_call() || callee.peer_username().is_some() {
            session.leave_call();
            info!(caller = %caller_name, callee = %callee_name, "callee is busy");
            gateway.close_connection(handle);
            return Ok(Some(stop_result(CallState::Busy)));
        }
        let Some(jsep) = jsep else {
            session.leave_call();
            return Err(Error::MissingSdp);
        };
        if !jsep.sdp.contains("m=") {
            session.leave_call();
            return Err(Error::InvalidSdp("no media sections".to_string()));
        }
        if videocall.is_none() && record.is_none() {
            session.leave_call();
            return Err(Error::MissingCallMetadata);
        }
        if !callee.try_enter_call() {
            session.leave_call();
            gateway.close_connection(handle);
            return Ok(Some(stop_result(CallState::Busy)));
        }

        // Pairing proper: caller first, then callee, then the new call.
        let now = now_millis();
        let is_video = videocall.unwrap_or(false);
        let call = Arc::new(Call::new(
            is_video,
            record.unwrap_or(false),
            duration.unwrap_or(0),
            now,
        ));
        {
            let mut state = session.state();
            state.peer = Some(callee_name.clone());
            state.active_handle = Some(handle);
            state.has_audio = jsep.sdp.contains("m=audio");
            state.has_video = jsep.sdp.contains("m=video");
            state.has_data = jsep.sdp.contains("DTLS/SCTP");
            state.call = Some(Arc::clone(&call));
        }
        if let Some(params) = &jsep.simulcast {
            session.relay().layers = SimulcastLayers::from_params(params);
            info!(caller = %caller_name, "caller is simulcasting");
        }
        {
            let mut state = callee.state();
            state.peer = Some(caller_name.clone());
            state.call = Some(Arc::clone(&call));
        }
        session.end_hangup();

        let ring_timeout = Duration::from_secs(self.shared.config.ring_timeout_secs);
        let deadline_tx = self.shared.signal_tx.clone();
        let deadline_caller = caller_name.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ring_timeout).await;
            let _ = deadline_tx.send(SignalingItem::RingDeadline {
                caller: deadline_caller,
            });
        });

        let offer = Jsep {
            kind: jsep.kind.clone(),
            sdp: jsep.sdp.clone(),
            update: None,
            simulcast: None,
        };
        for callee_handle in callee.handles() {
            self.shared.push_result(
                callee_handle,
                None,
                EventResult::IncomingCall {
                    username: caller_name.clone(),
                },
                Some(&offer),
            );
        }
        info!(caller = %caller_name, callee = %callee_name, %is_video, "call attempt started");
        self.shared.notify(handle, json!({"event": "calling"}));
        Ok(Some(EventResult::Calling))
    }

    fn handle_accept(
        &self,
        handle: HandleId,
        session: &Arc<UserSession>,
        jsep: Option<&Jsep>,
    ) -> Result<Option<EventResult>> {
        let peer = self
            .resolve_peer(session)
            .ok_or(Error::NoCall("No incoming call to accept"))?;
        if !session.in_call() || !peer.in_call() {
            return Err(Error::NoCall("No incoming call to accept"));
        }
        let call = session
            .current_call()
            .ok_or(Error::NoCall("The call does not exist"))?;
        if call.state() == CallState::Accepted {
            return Err(Error::NoCall("The call has already been accepted"));
        }
        let jsep = jsep.ok_or(Error::MissingSdp)?;
        if !jsep.sdp.contains("m=") {
            return Err(Error::InvalidSdp("no media sections".to_string()));
        }
        let sdp = jsep.sdp.as_str();
        {
            let mut state = session.state();
            state.has_audio = sdp.contains("m=audio");
            state.has_video = sdp.contains("m=video");
            state.has_data = sdp.contains("DTLS/SCTP");
            state.active_handle = Some(handle);
        }
        {
            // Layered answers are only meaningful for VP8 here; anything
            // else clears the callee's layer table.
            let mut relay = session.relay();
            match &jsep.simulcast {
                Some(params) if sdp.to_ascii_lowercase().contains("vp8") => {
                    relay.layers = SimulcastLayers::from_params(params);
                }
                _ => relay.layers.clear(),
            }
        }

        // Which codecs did the negotiation land on? The answer decides for
        // both parties, and a media section without a usable codec turns
        // that capability off on both sides.
        let audio_codec = AudioCodec::from_sdp(sdp);
        let video_codec = VideoCodec::from_sdp(sdp);
        {
            let mut state = session.state();
            state.audio_codec = audio_codec;
            state.video_codec = video_codec;
            if audio_codec.is_none() {
                state.has_audio = false;
            }
            if video_codec.is_none() {
                state.has_video = false;
            }
        }
        {
            let mut state = peer.state();
            match audio_codec {
                Some(codec) => state.audio_codec = Some(codec),
                None => state.has_audio = false,
            }
            match video_codec {
                Some(codec) => state.video_codec = Some(codec),
                None => state.has_video = false,
            }
        }

        call.accept()
            .map_err(|_| Error::NoCall("The call has already been accepted"))?;
        let callee_name = session.username().unwrap_or_default();
        info!(callee = %callee_name, caller = ?peer.username(), "call accepted");

        if let Some(peer_handle) = peer.active_handle() {
            let answer = Jsep {
                kind: jsep.kind.clone(),
                sdp: jsep.sdp.clone(),
                update: None,
                simulcast: None,
            };
            self.shared.push_result(
                peer_handle,
                None,
                EventResult::Accepted {
                    username: Some(callee_name),
                },
                Some(&answer),
            );
        }
        // The callee's other devices learn the call was picked up elsewhere.
        for other in session.handles() {
            if other != handle {
                self.shared
                    .push_result(other, None, stop_result(CallState::Accepted), None);
            }
        }
        session.end_hangup();

        // Aim for the top layer of whichever side simulcasts.
        let session_simulcasts = session.relay().layers.is_enabled();
        let peer_simulcasts = peer.relay().layers.is_enabled();
        if session_simulcasts {
            let mut relay = peer.relay();
            relay.sim.set_substream_target(MAX_LAYER as u8);
            relay.sim.set_templayer_target(MAX_LAYER as u8);
        }
        if peer_simulcasts {
            let mut relay = session.relay();
            relay.sim.set_substream_target(MAX_LAYER as u8);
            relay.sim.set_templayer_target(MAX_LAYER as u8);
        }
        self.shared.notify(handle, json!({"event": "accepted"}));
        Ok(Some(EventResult::Accepted { username: None }))
    }

    fn handle_reject(
        &self,
        handle: HandleId,
        session: &Arc<UserSession>,
    ) -> Result<Option<EventResult>> {
        let peer = self
            .resolve_peer(session)
            .ok_or(Error::NoCall("No incoming call to reject"))?;
        if !session.in_call() || !peer.in_call() {
            return Err(Error::NoCall("No incoming call to reject"));
        }
        let call = session
            .current_call()
            .ok_or(Error::NoCall("The call does not exist"))?;
        call.reject()
            .map_err(|_| Error::NoCall("The call has already been accepted"))?;
        info!(callee = ?session.username(), caller = ?peer.username(), "call rejected");

        release_pairing(session, &peer);
        session.state().active_handle = Some(handle);
        // The call never started; both sides drop their reference now.
        session.state().call = None;
        peer.state().call = None;

        let stop = stop_result(CallState::Reject);
        if let Some(peer_handle) = peer.active_handle() {
            self.shared.push_result(peer_handle, None, stop.clone(), None);
        }
        for other in session.handles() {
            if other != handle {
                self.shared.push_result(other, None, stop.clone(), None);
            }
        }
        self.shared.gateway.close_connection(handle);
        Ok(None)
    }

    fn handle_ringing(&self, session: &Arc<UserSession>) -> Result<Option<EventResult>> {
        let Some(call) = session.current_call() else {
            return Ok(None);
        };
        call.mark_ringing();
        let timeout_ms = self.shared.config.ring_timeout_secs as i64 * 1000;
        if call.ring_expired(now_millis(), timeout_ms) {
            // The ringing request comes from the callee; its peer placed
            // the call.
            let caller = self.resolve_peer(session);
            self.finish_missed(caller.as_ref(), Some(session));
        }
        Ok(None)
    }

    fn check_ring_deadline(&self, caller_name: &str) {
        let Some(caller) = self.shared.registry.lookup(caller_name) else {
            return;
        };
        let Some(call) = caller.current_call() else {
            return;
        };
        let timeout_ms = self.shared.config.ring_timeout_secs as i64 * 1000;
        if call.ring_expired(now_millis(), timeout_ms) {
            let callee = self.resolve_peer(&caller);
            self.finish_missed(Some(&caller), callee.as_ref());
        }
    }

    /// The ring deadline passed without an accept: notify both parties,
    /// release the pairing on both sides, close the caller's connection.
    fn finish_missed(
        &self,
        caller: Option<&Arc<UserSession>>,
        callee: Option<&Arc<UserSession>>,
    ) {
        info!(
            caller = ?caller.and_then(|s| s.username()),
            callee = ?callee.and_then(|s| s.username()),
            "call missed"
        );
        let stop = stop_result(CallState::Missed);
        let caller_handle = caller.and_then(|session| session.active_handle());
        if let Some(handle) = caller_handle {
            self.shared.push_result(handle, None, stop.clone(), None);
        }
        if let Some(callee) = callee {
            for handle in callee.handles() {
                self.shared.push_result(handle, None, stop.clone(), None);
            }
        }
        for side in [caller, callee].into_iter().flatten() {
            side.leave_call();
            let mut state = side.state();
            state.peer = None;
            state.call = None;
        }
        if let Some(handle) = caller_handle {
            self.shared.gateway.close_connection(handle);
        }
    }

    fn handle_set(
        &self,
        handle: HandleId,
        session: &Arc<UserSession>,
        update: &SetUpdate,
        jsep: Option<&Jsep>,
    ) -> Result<Option<EventResult>> {
        for (field, value) in [("substream", update.substream), ("temporal", update.temporal)] {
            if let Some(value) = value {
                if !(0..=MAX_LAYER).contains(&value) {
                    return Err(Error::InvalidElement(format!(
                        "{field} should be 0, 1 or 2"
                    )));
                }
            }
        }
        if let Some(audio) = update.audio {
            session.state().audio_active = audio;
            debug!(%handle, audio, "audio forwarding set");
        }
        if let Some(video) = update.video {
            if video && !session.video_active() {
                // Resuming video mid-stream needs a fresh keyframe.
                self.shared.gateway.request_keyframe(handle);
            }
            session.state().video_active = video;
            debug!(%handle, video, "video forwarding set");
        }
        if let Some(bitrate) = update.bitrate {
            session.state().bitrate_cap = bitrate;
            let announced = if bitrate > 0 {
                bitrate
            } else {
                self.shared.config.default_feedback_bitrate
            };
            self.shared.gateway.send_bitrate_feedback(handle, announced);
            debug!(%handle, bitrate, "bitrate cap set");
        }

        let peer = self.resolve_peer(session);
        let videocodec = session
            .state()
            .video_codec
            .map_or("none", |codec| codec.name())
            .to_string();
        if let Some(target) = update.substream {
            let reached = {
                let mut relay = session.relay();
                relay.sim.set_substream_target(target as u8);
                relay.sim.substream() == target as i8
            };
            if reached {
                // Already receiving the requested substream; tell the
                // requester instead of waiting for the next packet.
                self.shared.push_result(
                    handle,
                    None,
                    EventResult::Simulcast {
                        videocodec: videocodec.clone(),
                        substream: Some(target as u8),
                        temporal: None,
                    },
                    None,
                );
            } else if let Some(peer_handle) = peer.as_ref().and_then(|p| p.active_handle()) {
                self.shared.gateway.request_keyframe(peer_handle);
            }
        }
        if let Some(target) = update.temporal {
            let reached = {
                let mut relay = session.relay();
                relay.sim.set_templayer_target(target as u8);
                relay.sim.templayer() == target as i8
            };
            if reached {
                self.shared.push_result(
                    handle,
                    None,
                    EventResult::Simulcast {
                        videocodec: videocodec.clone(),
                        substream: None,
                        temporal: Some(target as u8),
                    },
                    None,
                );
            } else if let Some(peer_handle) = peer.as_ref().and_then(|p| p.active_handle()) {
                self.shared.gateway.request_keyframe(peer_handle);
            }
        }
        if let Some(seconds) = update.time {
            if let Some(call) = session.current_call() {
                if call.set_duration_once(seconds) {
                    info!(%handle, seconds, "call duration limit set");
                }
            }
        }

        let sdp_update = jsep.is_some_and(|j| j.update == Some(true));
        if update.restart.unwrap_or(false) && !sdp_update {
            warn!(%handle, "restart requested without an SDP update, ignoring");
        }
        if sdp_update {
            if let Some(peer_handle) = peer.as_ref().and_then(|p| p.active_handle()) {
                if let Some(jsep) = jsep {
                    self.shared.push_result(
                        peer_handle,
                        None,
                        EventResult::Update,
                        Some(jsep),
                    );
                }
            }
        }

        let recording = {
            let recorders = session.recorders();
            let audio = recorders.audio.as_ref().map(|r| r.path.display().to_string());
            let video = recorders.video.as_ref().map(|r| r.path.display().to_string());
            (audio, video)
        };
        self.shared.notify(
            handle,
            json!({
                "event": "configured",
                "audio_active": session.audio_active(),
                "video_active": session.video_active(),
                "bitrate": session.state().bitrate_cap,
                "recording": {"audio": recording.0, "video": recording.1},
            }),
        );
        Ok(Some(EventResult::Set))
    }

    fn handle_hangup(
        &self,
        handle: HandleId,
        session: &Arc<UserSession>,
    ) -> Result<Option<EventResult>> {
        let peer = self
            .resolve_peer(session)
            .ok_or(Error::NoCall("No call to hangup"))?;
        let call = session
            .current_call()
            .ok_or(Error::NoCall("No call to hangup"))?;
        if !session.in_call() || !peer.in_call() {
            return Err(Error::NoCall("No call to hangup"));
        }
        if call.state() != CallState::Started {
            return Err(Error::NoCall("The call hasn't started"));
        }
        info!(who = ?session.username(), peer = ?peer.username(), "hangup requested");
        release_pairing(session, &peer);
        // Closing the media connection triggers the teardown path, which
        // emits the stop events and finishes the call.
        let media_handle = session.active_handle().unwrap_or(handle);
        self.shared.gateway.close_connection(media_handle);
        Ok(None)
    }

    fn resolve_peer(&self, session: &Arc<UserSession>) -> Option<Arc<UserSession>> {
        let name = session.peer_username()?;
        self.shared
            .registry
            .lookup(&name)
            .filter(|peer| !peer.is_destroyed())
    }
}

/// Release the at-most-one-call slots of both parties. Every abort path
/// funnels through here so no exit can double-release or leak a pairing.
pub(crate) fn release_pairing(a: &Arc<UserSession>, b: &Arc<UserSession>) {
    let released_a = a.leave_call();
    let released_b = b.leave_call();
    debug!(released_a, released_b, "pairing released");
}

/// A bare `stop` event carrying only the call state; the teardown path
/// builds the timestamped variant itself.
pub(crate) fn stop_result(state: CallState) -> EventResult {
    EventResult::Stop {
        call_state: state.code(),
        start_time: None,
        stop_time: None,
        record_path: None,
    }
}
