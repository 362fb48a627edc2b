//! Field agent - network adapters and composition root for the sync layer.
//!
//! `fieldlink` owns the resilience and sync logic behind two seams,
//! [`ServiceCall`](fieldlink::ServiceCall) and
//! [`PushChannel`](fieldlink::PushChannel). This crate provides the real
//! transports for them and wires every component into one [`FieldAgent`].
//!
//! # Architecture
//!
//! ```text
//!  HTTP API  ←─ HttpServiceCall ←─ ResilientClient ←─ OfflineQueue ←─ SyncCoordinator
//!                                                                         ↑
//!  WebSocket ←─ WsPushChannel  ←─ ConnectionManager ──(state changes)─────┘
//!                                        │
//!                                        └─("hotspots" topic)─→ HotspotManager
//! ```

pub mod agent;
pub mod http;
pub mod ws;

pub use agent::{AgentStatus, FieldAgent};
pub use http::HttpServiceCall;
pub use ws::WsPushChannel;
