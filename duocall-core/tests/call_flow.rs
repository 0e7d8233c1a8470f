//! End-to-end signaling and relay flows against fake collaborators.

use async_trait::async_trait;
use bytes::Bytes;
use duocall_core::{
    Authorizer, CallService, CoreConfig, DataPacket, FileRecorderFactory, HandleId, MediaGateway,
    MediaKind, PostProcessor, RecordingJob, RtcpPacket, RtpPacket, StaticAuthorizer,
};
use duocall_proto::{Event, EventBody, EventResult, Jsep, SimulcastParams};
use parking_lot::Mutex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const OFFER_AV: &str = "v=0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n";
const ANSWER_AV: &str = "v=0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n";

struct Pushed {
    handle: HandleId,
    transaction: Option<String>,
    event: Event,
    jsep: Option<Jsep>,
}

#[derive(Default)]
struct TestGateway {
    pushed: Mutex<Vec<Pushed>>,
    closed: Mutex<Vec<HandleId>>,
    keyframes: Mutex<Vec<HandleId>>,
    feedback: Mutex<Vec<(HandleId, u32)>>,
    rtp: Mutex<Vec<(HandleId, RtpPacket)>>,
    rtcp: Mutex<Vec<(HandleId, RtcpPacket)>>,
    data: Mutex<Vec<(HandleId, DataPacket)>>,
}

impl TestGateway {
    fn results_for(&self, handle: HandleId) -> Vec<EventResult> {
        self.pushed
            .lock()
            .iter()
            .filter(|p| p.handle == handle)
            .filter_map(|p| match &p.event.body {
                EventBody::Result { result } => Some(result.clone()),
                EventBody::Error { .. } => None,
            })
            .collect()
    }

    fn error_codes_for(&self, handle: HandleId) -> Vec<u16> {
        self.pushed
            .lock()
            .iter()
            .filter(|p| p.handle == handle)
            .filter_map(|p| match &p.event.body {
                EventBody::Error { error_code, .. } => Some(*error_code),
                EventBody::Result { .. } => None,
            })
            .collect()
    }

    fn has_result(&self, handle: HandleId, pred: impl Fn(&EventResult) -> bool) -> bool {
        self.results_for(handle).iter().any(|r| pred(r))
    }

    fn jsep_with_result(
        &self,
        handle: HandleId,
        pred: impl Fn(&EventResult) -> bool,
    ) -> Option<Jsep> {
        self.pushed
            .lock()
            .iter()
            .filter(|p| p.handle == handle)
            .find(|p| match &p.event.body {
                EventBody::Result { result } => pred(result),
                EventBody::Error { .. } => false,
            })
            .and_then(|p| p.jsep.clone())
    }

    fn transaction_of(&self, handle: HandleId, pred: impl Fn(&EventResult) -> bool) -> Option<String> {
        self.pushed
            .lock()
            .iter()
            .filter(|p| p.handle == handle)
            .find(|p| match &p.event.body {
                EventBody::Result { result } => pred(result),
                EventBody::Error { .. } => false,
            })
            .and_then(|p| p.transaction.clone())
    }

    fn stop_states_for(&self, handle: HandleId) -> Vec<u8> {
        self.results_for(handle)
            .into_iter()
            .filter_map(|result| match result {
                EventResult::Stop { call_state, .. } => Some(call_state),
                _ => None,
            })
            .collect()
    }

    fn was_closed(&self, handle: HandleId) -> bool {
        self.closed.lock().contains(&handle)
    }

    fn keyframes_for(&self, handle: HandleId) -> usize {
        self.keyframes.lock().iter().filter(|h| **h == handle).count()
    }

    fn feedback_for(&self, handle: HandleId) -> Vec<u32> {
        self.feedback
            .lock()
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, bitrate)| *bitrate)
            .collect()
    }

    fn rtp_for(&self, handle: HandleId) -> Vec<RtpPacket> {
        self.rtp
            .lock()
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

impl MediaGateway for TestGateway {
    fn push_event(
        &self,
        handle: HandleId,
        transaction: Option<&str>,
        event: &Event,
        jsep: Option<&Jsep>,
    ) {
        self.pushed.lock().push(Pushed {
            handle,
            transaction: transaction.map(str::to_string),
            event: event.clone(),
            jsep: jsep.cloned(),
        });
    }

    fn close_connection(&self, handle: HandleId) {
        self.closed.lock().push(handle);
    }

    fn request_keyframe(&self, handle: HandleId) {
        self.keyframes.lock().push(handle);
    }

    fn send_bitrate_feedback(&self, handle: HandleId, bitrate: u32) {
        self.feedback.lock().push((handle, bitrate));
    }

    fn relay_rtp(&self, handle: HandleId, packet: &RtpPacket) {
        self.rtp.lock().push((handle, packet.clone()));
    }

    fn relay_rtcp(&self, handle: HandleId, packet: &RtcpPacket) {
        self.rtcp.lock().push((handle, packet.clone()));
    }

    fn relay_data(&self, handle: HandleId, packet: &DataPacket) {
        self.data.lock().push((handle, packet.clone()));
    }
}

struct CollectingPostProcessor {
    jobs: Arc<Mutex<Vec<RecordingJob>>>,
}

#[async_trait]
impl PostProcessor for CollectingPostProcessor {
    async fn process(&self, job: RecordingJob) -> anyhow::Result<()> {
        self.jobs.lock().push(job);
        Ok(())
    }
}

struct TestHost {
    service: Arc<CallService>,
    gateway: Arc<TestGateway>,
    jobs: Arc<Mutex<Vec<RecordingJob>>>,
    record_dir: PathBuf,
    _tmp: tempfile::TempDir,
}

impl TestHost {
    fn new() -> Self {
        Self::build(|_| {}, Arc::new(StaticAuthorizer::permissive()))
    }

    fn build(tweak: impl FnOnce(&mut CoreConfig), authorizer: Arc<dyn Authorizer>) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = CoreConfig {
            record_dir: tmp.path().to_path_buf(),
            ..CoreConfig::default()
        };
        tweak(&mut config);
        let record_dir = config.record_dir.clone();
        let gateway = Arc::new(TestGateway::default());
        let jobs = Arc::new(Mutex::new(Vec::new()));
        let service = CallService::new(
            config,
            gateway.clone(),
            authorizer,
            Arc::new(FileRecorderFactory),
            Arc::new(CollectingPostProcessor { jobs: jobs.clone() }),
        );
        Self {
            service,
            gateway,
            jobs,
            record_dir,
            _tmp: tmp,
        }
    }

    fn send(&self, handle: HandleId, payload: serde_json::Value, jsep: Option<Jsep>) {
        self.service
            .handle_message(handle, Some(format!("txn-{handle}")), payload, jsep)
            .expect("signaling queue open");
    }

    async fn login(&self, handle: HandleId, username: &str) {
        // The handle may already be bound from an earlier step.
        let _ = self.service.create_session(handle);
        self.send(handle, json!({"request": "login", "username": username}), None);
        let gateway = self.gateway.clone();
        let expected = username.to_string();
        wait_until("login confirmation", move || {
            gateway.has_result(handle, |r| {
                matches!(r, EventResult::Connected { username } if *username == expected)
            })
        })
        .await;
    }

    /// alice on h1 calls bob on h2 and bob accepts; returns once the caller
    /// holds the acceptance.
    async fn establish_call(
        &self,
        caller: HandleId,
        callee: HandleId,
        callee_name: &str,
        call_fields: serde_json::Value,
        offer_jsep: Option<Jsep>,
    ) {
        let mut payload = json!({"request": "call", "username": callee_name});
        if let Some(fields) = call_fields.as_object() {
            for (key, value) in fields {
                payload[key] = value.clone();
            }
        }
        self.send(caller, payload, offer_jsep.or_else(|| Some(offer(OFFER_AV))));
        let gateway = self.gateway.clone();
        wait_until("incoming call at callee", move || {
            gateway.has_result(callee, |r| matches!(r, EventResult::IncomingCall { .. }))
        })
        .await;

        self.send(callee, json!({"request": "accept"}), Some(answer(ANSWER_AV)));
        let gateway = self.gateway.clone();
        wait_until("acceptance at caller", move || {
            gateway.has_result(caller, |r| {
                matches!(r, EventResult::Accepted { username: Some(_) })
            })
        })
        .await;
    }
}

fn offer(sdp: &str) -> Jsep {
    Jsep {
        kind: "offer".to_string(),
        sdp: sdp.to_string(),
        update: None,
        simulcast: None,
    }
}

fn answer(sdp: &str) -> Jsep {
    Jsep {
        kind: "answer".to_string(),
        sdp: sdp.to_string(),
        update: None,
        simulcast: None,
    }
}

fn audio_packet(seq: u16) -> RtpPacket {
    RtpPacket {
        kind: MediaKind::Audio,
        data: Bytes::from(vec![0xAA; 50]),
        ssrc: 5555,
        sequence_number: seq,
        timestamp: u32::from(seq) * 960,
        rid: None,
        temporal_layer: None,
        keyframe: false,
    }
}

fn video_packet(ssrc: u32, seq: u16, timestamp: u32, keyframe: bool) -> RtpPacket {
    RtpPacket {
        kind: MediaKind::Video,
        data: Bytes::from(vec![0xBB; 120]),
        ssrc,
        sequence_number: seq,
        timestamp,
        rid: None,
        temporal_layer: Some(0),
        keyframe,
    }
}

fn remb_packet(bitrate: u32) -> Vec<u8> {
    let mut exp = 0u8;
    let mut mantissa = bitrate;
    while mantissa > 0x3FFFF {
        mantissa >>= 1;
        exp += 1;
    }
    let mut buf = vec![0x8F, 206, 0x00, 0x04];
    buf.extend_from_slice(&[0, 0, 0, 1]);
    buf.extend_from_slice(&[0, 0, 0, 0]);
    buf.extend_from_slice(b"REMB");
    buf.push(1);
    buf.push((exp << 2) | ((mantissa >> 16) & 0x03) as u8);
    buf.push(((mantissa >> 8) & 0xff) as u8);
    buf.push((mantissa & 0xff) as u8);
    buf
}

async fn wait_until(what: &str, mut ready: impl FnMut() -> bool) {
    for _ in 0..300 {
        if ready() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

const H1: HandleId = HandleId::new(1);
const H2: HandleId = HandleId::new(2);
const H3: HandleId = HandleId::new(3);

#[tokio::test]
async fn test_login_and_list() {
    let host = TestHost::new();
    host.login(H1, "alice").await;

    assert_eq!(
        host.gateway
            .transaction_of(H1, |r| matches!(r, EventResult::Connected { .. })),
        Some("txn-1".to_string())
    );

    host.send(H1, json!({"request": "list"}), None);
    let gateway = host.gateway.clone();
    wait_until("list result", move || {
        gateway.has_result(H1, |r| {
            matches!(r, EventResult::List { list } if list == &vec!["alice".to_string()])
        })
    })
    .await;
    host.service.shutdown().await;
}

#[tokio::test]
async fn test_full_call_flow() {
    let host = TestHost::new();
    host.login(H1, "alice").await;
    host.login(H2, "bob").await;

    host.establish_call(H1, H2, "bob", json!({"videocall": true}), None)
        .await;

    // The callee saw the original offer; the caller got the answer back.
    let incoming = host
        .gateway
        .jsep_with_result(H2, |r| matches!(r, EventResult::IncomingCall { .. }))
        .expect("offer forwarded");
    assert_eq!(incoming.kind, "offer");
    assert!(incoming.sdp.contains("m=video"));
    let answer = host
        .gateway
        .jsep_with_result(H1, |r| matches!(r, EventResult::Accepted { .. }))
        .expect("answer forwarded");
    assert_eq!(answer.kind, "answer");

    // Media comes up on both sides; the call is now running.
    host.service.setup_media(H1);
    host.service.setup_media(H2);

    let info = host.service.query_session(H1).expect("session info");
    assert_eq!(info.state, "incall");
    assert_eq!(info.peer.as_deref(), Some("bob"));
    assert_eq!(info.audio_codec.as_deref(), Some("opus"));
    assert_eq!(info.video_codec.as_deref(), Some("vp8"));
    assert!(info.in_call);

    // Packets flow caller -> callee and data channels relay too.
    host.service.incoming_rtp(H1, &audio_packet(1));
    let relayed = host.gateway.rtp_for(H2);
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].sequence_number, 1);

    host.service.incoming_data(
        H1,
        &DataPacket {
            label: Some("chat".to_string()),
            binary: false,
            data: Bytes::from_static(b"hi"),
        },
    );
    assert_eq!(host.gateway.data.lock().len(), 1);

    // Hangup: the requester's connection is closed, teardown emits one
    // stop event per side.
    host.send(H1, json!({"request": "hangup"}), None);
    let gateway = host.gateway.clone();
    wait_until("caller close", move || gateway.was_closed(H1)).await;
    host.service.hangup_media(H1);
    host.service.hangup_media(H2);

    assert_eq!(host.gateway.stop_states_for(H1), vec![8]); // ENDED
    assert_eq!(host.gateway.stop_states_for(H2), vec![8]);
    assert!(host.gateway.was_closed(H2));

    let info = host.service.query_session(H1).expect("session info");
    assert_eq!(info.state, "idle");
    assert!(!info.in_call);
    host.service.shutdown().await;
}

#[tokio::test]
async fn test_busy_callee_leaves_existing_call_untouched() {
    let host = TestHost::new();
    host.login(H1, "alice").await;
    host.login(H2, "bob").await;
    host.login(H3, "carol").await;

    host.establish_call(H1, H2, "bob", json!({"videocall": true}), None)
        .await;

    host.send(H3, json!({"request": "call", "username": "bob"}), Some(offer(OFFER_AV)));
    let gateway = host.gateway.clone();
    wait_until("busy stop at carol", move || {
        gateway.stop_states_for(H3) == vec![1] // BUSY
    })
    .await;
    assert!(host.gateway.was_closed(H3));

    // bob's call with alice is untouched.
    let info = host.service.query_session(H2).expect("session info");
    assert_eq!(info.state, "incall");
    assert_eq!(info.peer.as_deref(), Some("alice"));
    assert!(!host.gateway.was_closed(H1));
    assert!(!host.gateway.was_closed(H2));
    host.service.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_call_is_missed() {
    let host = TestHost::build(
        |config| config.ring_timeout_secs = 0,
        Arc::new(StaticAuthorizer::permissive()),
    );
    host.login(H1, "alice").await;
    host.login(H2, "bob").await;

    host.send(H1, json!({"request": "call", "username": "bob"}), Some(offer(OFFER_AV)));
    let gateway = host.gateway.clone();
    wait_until("incoming call at bob", move || {
        gateway.has_result(H2, |r| matches!(r, EventResult::IncomingCall { .. }))
    })
    .await;

    // The callee reports ringing; the ring window is already over.
    host.send(H2, json!({"request": "ringing"}), None);
    let gateway = host.gateway.clone();
    wait_until("missed stop at both", move || {
        gateway.stop_states_for(H1).contains(&5) && gateway.stop_states_for(H2).contains(&5)
    })
    .await;
    assert!(host.gateway.was_closed(H1));
    host.service.hangup_media(H1);

    let info = host.service.query_session(H2).expect("session info");
    assert_eq!(info.state, "idle");
    assert!(!info.in_call);
    host.service.shutdown().await;
}

#[tokio::test]
async fn test_reject_then_call_again() {
    let host = TestHost::new();
    host.login(H1, "alice").await;
    host.login(H2, "bob").await;

    host.send(H1, json!({"request": "call", "username": "bob"}), Some(offer(OFFER_AV)));
    let gateway = host.gateway.clone();
    wait_until("incoming call at bob", move || {
        gateway.has_result(H2, |r| matches!(r, EventResult::IncomingCall { .. }))
    })
    .await;

    host.send(H2, json!({"request": "reject"}), None);
    let gateway = host.gateway.clone();
    wait_until("reject stop at alice", move || {
        gateway.stop_states_for(H1).contains(&4) // REJECT
    })
    .await;
    assert!(host.gateway.was_closed(H2));
    host.service.hangup_media(H2);
    host.service.hangup_media(H1);

    // Both sides are free again: the same call attempt works now.
    host.send(H1, json!({"request": "call", "username": "bob"}), Some(offer(OFFER_AV)));
    let gateway = host.gateway.clone();
    wait_until("second incoming call at bob", move || {
        gateway
            .results_for(H2)
            .iter()
            .filter(|r| matches!(r, EventResult::IncomingCall { .. }))
            .count()
            == 2
    })
    .await;
    host.service.shutdown().await;
}

#[tokio::test]
async fn test_multi_device_fanout_and_pickup() {
    let host = TestHost::new();
    host.login(H1, "alice").await;
    host.login(H2, "bob").await;
    host.login(H3, "bob").await; // second device, same identity

    assert_eq!(host.service.registered_users().len(), 2);

    host.send(H1, json!({"request": "call", "username": "bob"}), Some(offer(OFFER_AV)));
    let gateway = host.gateway.clone();
    wait_until("incoming call on both devices", move || {
        gateway.has_result(H2, |r| matches!(r, EventResult::IncomingCall { .. }))
            && gateway.has_result(H3, |r| matches!(r, EventResult::IncomingCall { .. }))
    })
    .await;

    host.send(H2, json!({"request": "accept"}), Some(answer(ANSWER_AV)));
    let gateway = host.gateway.clone();
    wait_until("other device told the call went elsewhere", move || {
        gateway.stop_states_for(H3).contains(&3) // ACCEPTED
    })
    .await;
    host.service.shutdown().await;
}

#[tokio::test]
async fn test_congestion_feedback_is_capped_not_relayed() {
    let host = TestHost::new();
    host.login(H1, "alice").await;
    host.login(H2, "bob").await;
    host.establish_call(H1, H2, "bob", json!({"videocall": true}), None)
        .await;

    // No cap configured: feedback answers with the unlimited default.
    host.service.incoming_rtcp(
        H1,
        &RtcpPacket {
            video: true,
            data: Bytes::from(remb_packet(1_000_000)),
        },
    );
    assert_eq!(host.gateway.feedback_for(H1), vec![10_000_000]);
    assert_eq!(host.gateway.rtcp.lock().len(), 0);

    let info = host.service.query_session(H1).expect("session info");
    assert_eq!(info.peer_bitrate, Some(1_000_000));

    // Configure a cap; it is announced immediately and used for later
    // feedback.
    host.send(H1, json!({"request": "set", "bitrate": 512_000}), None);
    let gateway = host.gateway.clone();
    wait_until("cap announced", move || {
        gateway.feedback_for(H1).contains(&512_000)
    })
    .await;
    host.service.incoming_rtcp(
        H1,
        &RtcpPacket {
            video: true,
            data: Bytes::from(remb_packet(2_000_000)),
        },
    );
    assert_eq!(host.gateway.feedback_for(H1), vec![10_000_000, 512_000, 512_000]);

    // Anything that is not congestion feedback is relayed verbatim.
    host.service.incoming_rtcp(
        H1,
        &RtcpPacket {
            video: true,
            data: Bytes::from(vec![0x81, 206, 0x00, 0x02, 0, 0, 0, 1, 0, 0, 0, 2]),
        },
    );
    assert_eq!(host.gateway.rtcp.lock().len(), 1);
    host.service.shutdown().await;
}

#[tokio::test]
async fn test_simulcast_selection_and_switching() {
    let host = TestHost::new();
    host.login(H1, "alice").await;
    host.login(H2, "bob").await;

    let simulcast_offer = Jsep {
        simulcast: Some(SimulcastParams {
            ssrc_0: Some(100),
            ssrc_1: Some(200),
            ssrc_2: Some(300),
            rids: None,
        }),
        ..offer(OFFER_AV)
    };
    host.establish_call(H1, H2, "bob", json!({"videocall": true}), Some(simulcast_offer))
        .await;
    host.service.setup_media(H1);
    host.service.setup_media(H2);

    // The top substream flows and is locked onto.
    host.service
        .incoming_rtp(H1, &video_packet(300, 1000, 90_000, true));
    let forwarded = host.gateway.rtp_for(H2);
    assert_eq!(forwarded.len(), 1);
    assert!(host.gateway.has_result(H2, |r| matches!(
        r,
        EventResult::Simulcast { substream: Some(2), .. }
    )));

    // Other substreams are dropped.
    host.service
        .incoming_rtp(H1, &video_packet(100, 5, 90_000, false));
    assert_eq!(host.gateway.rtp_for(H2).len(), 1);

    // The receiver asks for the low substream; the sender is asked for a
    // keyframe to switch cleanly.
    host.send(H2, json!({"request": "set", "substream": 0}), None);
    let gateway = host.gateway.clone();
    wait_until("set acknowledged", move || {
        gateway.has_result(H2, |r| matches!(r, EventResult::Set))
    })
    .await;
    assert_eq!(host.gateway.keyframes_for(H1), 1);

    // The keyframe on the low substream completes the switch, with
    // sequence continuity and a stable output SSRC.
    host.service
        .incoming_rtp(H1, &video_packet(100, 7, 180_000, true));
    let forwarded = host.gateway.rtp_for(H2);
    assert_eq!(forwarded.len(), 2);
    assert_eq!(forwarded[1].sequence_number, 1001);
    assert_eq!(forwarded[1].ssrc, forwarded[0].ssrc);
    assert!(host.gateway.has_result(H2, |r| matches!(
        r,
        EventResult::Simulcast { substream: Some(0), .. }
    )));

    // Asking for the substream that already flows acknowledges right away
    // without another keyframe request.
    host.send(H2, json!({"request": "set", "substream": 0}), None);
    let gateway = host.gateway.clone();
    wait_until("no-op substream acknowledged", move || {
        gateway
            .results_for(H2)
            .iter()
            .filter(|r| matches!(r, EventResult::Simulcast { substream: Some(0), .. }))
            .count()
            >= 2
    })
    .await;
    assert_eq!(host.gateway.keyframes_for(H1), 1);
    host.service.shutdown().await;
}

#[tokio::test]
async fn test_recorded_call_produces_postprocessing_job() {
    let host = TestHost::new();
    host.login(H1, "alice").await;
    host.login(H2, "bob").await;
    host.establish_call(H1, H2, "bob", json!({"videocall": true, "record": true}), None)
        .await;

    host.service.setup_media(H1);
    host.service.setup_media(H2);

    // Recorders were opened for both parties and announced in the
    // session snapshot.
    let info = host.service.query_session(H1).expect("session info");
    let recording = info.recording.expect("recording paths");
    assert!(recording.audio.is_some());
    assert!(recording.video.is_some());

    host.service.incoming_rtp(H1, &audio_packet(1));
    host.service.incoming_rtp(H2, &audio_packet(1));

    host.send(H1, json!({"request": "hangup"}), None);
    let gateway = host.gateway.clone();
    wait_until("caller close", move || gateway.was_closed(H1)).await;
    host.service.hangup_media(H1);
    host.service.hangup_media(H2);

    let jobs = host.jobs.clone();
    wait_until("post-processing job", move || jobs.lock().len() == 1).await;
    let job = host.jobs.lock()[0].clone();
    assert!(job.is_video);
    assert!(job.output.starts_with("videocall_alice-bob-"));
    assert_eq!(job.dir, host.record_dir);
    let audio_1 = job.audio_1.as_ref().expect("caller audio recorded");
    assert!(audio_1.exists());
    assert!(job.audio_2.is_some());
    assert!(job.video_1.is_some());

    // The stop event announced the artifact the muxer will produce.
    let stop_with_path = host.gateway.results_for(H1).into_iter().any(|r| {
        matches!(r, EventResult::Stop { record_path: Some(path), .. } if path.ends_with(".webm"))
    });
    assert!(stop_with_path);
    host.service.shutdown().await;
}

#[tokio::test]
async fn test_duration_limit_times_the_call_out() {
    let host = TestHost::new();
    host.login(H1, "alice").await;
    host.login(H2, "bob").await;
    host.establish_call(
        H1,
        H2,
        "bob",
        json!({"videocall": true, "duration": 1}),
        None,
    )
    .await;
    host.service.setup_media(H1);
    host.service.setup_media(H2);

    host.service.incoming_rtp(H1, &audio_packet(1));
    assert_eq!(host.gateway.rtp_for(H2).len(), 1);

    tokio::time::sleep(Duration::from_millis(1_200)).await;

    // The packet that observes the expiry is dropped and the sender's
    // connection is closed.
    host.service.incoming_rtp(H1, &audio_packet(2));
    assert_eq!(host.gateway.rtp_for(H2).len(), 1);
    assert!(host.gateway.was_closed(H1));

    host.service.hangup_media(H1);
    host.service.hangup_media(H2);
    assert!(host.gateway.stop_states_for(H2).contains(&7)); // TIMEOUT
    host.service.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_teardown_is_idempotent() {
    let host = TestHost::new();
    host.login(H1, "alice").await;
    host.login(H2, "bob").await;
    host.establish_call(H1, H2, "bob", json!({"videocall": true}), None)
        .await;
    host.service.setup_media(H1);
    host.service.setup_media(H2);

    // Abrupt disconnect, reported twice by a confused transport.
    host.service.hangup_media(H1);
    host.service.hangup_media(H1);
    host.service.hangup_media(H2);
    host.service.hangup_media(H2);

    assert_eq!(host.gateway.stop_states_for(H1), vec![8]);
    assert_eq!(host.gateway.stop_states_for(H2), vec![8]);

    let info = host.service.query_session(H1).expect("session info");
    assert!(!info.in_call);
    assert_eq!(info.state, "idle");
    host.service.shutdown().await;
}

#[tokio::test]
async fn test_request_errors() {
    let host = TestHost::build(
        |_| {},
        Arc::new(StaticAuthorizer::with_allowed(["alice", "bob"])),
    );
    host.service.create_session(H1).expect("session created");

    // Calling before logging in closes the attempt.
    host.send(H1, json!({"request": "call", "username": "bob"}), Some(offer(OFFER_AV)));
    let gateway = host.gateway.clone();
    wait_until("register-first error", move || {
        gateway.error_codes_for(H1).contains(&473)
    })
    .await;
    assert!(host.gateway.was_closed(H1));

    // Unauthorized username.
    host.send(H1, json!({"request": "login", "username": "mallory"}), None);
    let gateway = host.gateway.clone();
    wait_until("unauthorized error", move || {
        gateway.error_codes_for(H1).contains(&484)
    })
    .await;

    host.login(H1, "alice").await;

    // Logging in twice on the same session.
    host.send(H1, json!({"request": "login", "username": "alice"}), None);
    let gateway = host.gateway.clone();
    wait_until("already-registered error", move || {
        gateway.error_codes_for(H1).contains(&477)
    })
    .await;

    // Calling yourself.
    host.send(H1, json!({"request": "call", "username": "alice"}), Some(offer(OFFER_AV)));
    let gateway = host.gateway.clone();
    wait_until("self-call error", move || {
        gateway.error_codes_for(H1).contains(&479)
    })
    .await;

    // Calling someone who does not exist.
    host.send(H1, json!({"request": "call", "username": "bob"}), Some(offer(OFFER_AV)));
    let gateway = host.gateway.clone();
    wait_until("no-such-username error", move || {
        gateway.error_codes_for(H1).contains(&478)
    })
    .await;

    // Accepting with no call pending, and an unknown request.
    host.send(H1, json!({"request": "accept"}), Some(answer(ANSWER_AV)));
    host.send(H1, json!({"request": "teleport"}), None);
    let gateway = host.gateway.clone();
    wait_until("no-call and unknown-request errors", move || {
        let codes = gateway.error_codes_for(H1);
        codes.contains(&481) && codes.contains(&472)
    })
    .await;

    // A call without an attached offer.
    host.login(H2, "bob").await;
    host.send(H1, json!({"request": "call", "username": "bob"}), None);
    let gateway = host.gateway.clone();
    wait_until("missing-sdp error", move || {
        gateway.error_codes_for(H1).contains(&482)
    })
    .await;
    host.service.shutdown().await;
}

#[tokio::test]
async fn test_mute_gates_forwarding() {
    let host = TestHost::new();
    host.login(H1, "alice").await;
    host.login(H2, "bob").await;
    host.establish_call(H1, H2, "bob", json!({"videocall": true}), None)
        .await;
    host.service.setup_media(H1);
    host.service.setup_media(H2);

    host.send(H1, json!({"request": "set", "audio": false}), None);
    let gateway = host.gateway.clone();
    wait_until("mute acknowledged", move || {
        gateway.has_result(H1, |r| matches!(r, EventResult::Set))
    })
    .await;

    host.service.incoming_rtp(H1, &audio_packet(10));
    assert_eq!(host.gateway.rtp_for(H2).len(), 0);

    // Unmuting resumes forwarding; re-enabling video asks the client for
    // a keyframe.
    host.send(
        H1,
        json!({"request": "set", "audio": true, "video": false}),
        None,
    );
    let gateway = host.gateway.clone();
    wait_until("unmute acknowledged", move || {
        gateway
            .results_for(H1)
            .iter()
            .filter(|r| matches!(r, EventResult::Set))
            .count()
            == 2
    })
    .await;
    host.service.incoming_rtp(H1, &audio_packet(11));
    assert_eq!(host.gateway.rtp_for(H2).len(), 1);

    host.service
        .incoming_rtp(H1, &video_packet(7777, 1, 1000, true));
    assert_eq!(host.gateway.rtp_for(H2).len(), 1); // video muted, dropped

    let keyframes_before = host.gateway.keyframes_for(H1);
    host.send(H1, json!({"request": "set", "video": true}), None);
    let gateway = host.gateway.clone();
    wait_until("video re-enabled", move || {
        gateway.keyframes_for(H1) == keyframes_before + 1
    })
    .await;
    host.service.shutdown().await;
}
