// =============================================================================
// External interface: command dispatch, echo-bridge HTTP server, SSE
// events, stdio transport
// =============================================================================

pub mod auth;
pub mod commands;
pub mod events;
pub mod rest;
pub mod stdio;
