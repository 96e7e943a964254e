//! Connection lifecycle of a single watch.
//!
//! This module contains:
//! - Connection scopes grouping the tasks of one attempt
//! - The service seams and bundles handed out on success
//! - The post-link handshake
//! - The per-transport state machine

pub mod handshake;
pub mod machine;
pub mod scope;
pub mod services;
pub mod state;

pub use handshake::{HandshakeNegotiator, NEGOTIATION_TIMEOUT};
pub use machine::ConnectionStateMachine;
pub use scope::{ConnectionScope, ScopeFailure};
pub use services::{
    ConnectedServices, CoreDumpService, CoreServices, DataLoggingService, FirmwareService,
    LogService, MessageService, ProtocolService, RecoveryServices, RunStateService,
    ServiceProvider, SystemService,
};
pub use state::{ConnectedState, ConnectingState};
