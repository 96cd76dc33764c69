//! GridLink core: correlation-based RPC engine for charging networks
//!
//! Every participant in the network is a [`Node`]: a charging station, a
//! central system, or a relay in between. Nodes exchange tagged JSON or
//! binary frames over WebSockets, correlate requests with responses by
//! message id, route frames across intermediate hops, and sign/verify
//! payloads according to per-action policy rules.
//!
//! ```text
//!   caller ──call()──► Exchange ──► Router ──► Connection ──► WebSocket
//!                         ▲                                      │
//!                         └── resolve(id) ◄── Node::ingest ◄─────┘
//! ```
//!
//! The engine makes no assumptions about which side listens and which side
//! dials: any node may call any reachable node, directly or through relays.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod exchange;
pub mod frame;
pub mod node;
pub mod registry;
pub mod router;
pub mod signing;
pub mod types;
pub mod ws;

pub use config::NodeConfig;
pub use connection::{Connection, ConnectionError, WirePayload};
pub use dispatch::{
    handler_fn, ActionHandler, ActionObserver, DispatchRegistry, HandlerFault, InboundContext,
};
pub use exchange::{CallOutcome, Exchange, Response, ResultCode};
pub use frame::{
    DecodeError, EncodeError, ErrorCode, ErrorDetail, Frame, FrameExtras, MessageType, Payload,
};
pub use node::Node;
pub use registry::ConnectionRegistry;
pub use router::{RouteError, Router};
pub use signing::{
    FailurePolicy, KeyPair, RuleContext, SignaturePolicy, SignatureRecord, SigningRule,
    VerificationOutcome, VerificationRule, VerificationStatus, VerifyAction,
    SIGNING_METHOD_ED25519,
};
pub use types::{NodeId, SourceRouting, WireFormat};
pub use ws::{ConnectOptions, WsError, SUBPROTOCOL_BINARY, SUBPROTOCOL_JSON};
