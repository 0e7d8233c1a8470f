//! DuoCall core
//!
//! The call-signaling and media-relay engine of a two-party video/audio
//! calling service built atop a real-time media gateway. It keeps track of
//! who is registered, pairs two registered endpoints into a call, drives
//! the call through its negotiation state machine, and relays media
//! packets between the paired endpoints, including simulcast layer
//! selection and congestion feedback capping.
//!
//! ## Architecture
//!
//! - **[`CallService`]**: process-scoped entry point the transport host
//!   drives; owns the registry and both worker queues
//! - **[`SessionRegistry`]**: username → session map plus handle bindings
//! - **[`UserSession`]**: one identity's state, spanning its handles
//! - **[`Call`]**: the per-call state machine
//! - **[`SimulcastContext`]**: per-receiver simulcast layer selection
//!
//! Signaling requests are serialized through one worker task, the only
//! writer of session linkage; packet relay runs on the caller's threads
//! and only reads the linkage that worker installed. The host plugs in
//! four collaborators: the [`MediaGateway`] it implements itself, an
//! [`Authorizer`], a [`RecorderFactory`] and a [`PostProcessor`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use duocall_core::{CallService, CoreConfig, FileRecorderFactory, NoopPostProcessor};
//! use duocall_core::registry::StaticAuthorizer;
//!
//! let service = CallService::new(
//!     CoreConfig::default(),
//!     my_gateway,
//!     std::sync::Arc::new(StaticAuthorizer::permissive()),
//!     std::sync::Arc::new(FileRecorderFactory),
//!     std::sync::Arc::new(NoopPostProcessor),
//! );
//! service.create_session(handle)?;
//! service.handle_message(handle, Some("txn-1".into()), payload, jsep)?;
//! ```

mod call;
mod config;
mod error;
mod gateway;
mod media;
mod postproc;
mod recording;
pub mod registry;
mod relay;
mod service;
mod session;
mod signaling;
mod simulcast;
mod types;

pub use call::{Call, CallState, CallStop};
pub use config::CoreConfig;
pub use error::{Error, Result};
pub use gateway::{Authorizer, MediaGateway};
pub use media::{remb_bitrate, DataPacket, RtcpPacket, RtpPacket};
pub use postproc::{NoopPostProcessor, PostProcessor, RecordingJob};
pub use recording::{FileRecorder, FileRecorderFactory, Recorder, RecorderFactory, RecorderKind};
pub use registry::{SessionRegistry, StaticAuthorizer};
pub use service::CallService;
pub use session::UserSession;
pub use simulcast::{RtpForwardContext, SimulcastContext, SimulcastLayers};
pub use types::{AudioCodec, HandleId, MediaKind, VideoCodec};
