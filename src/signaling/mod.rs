/// Websocket client that relays descriptions and candidates.
pub mod gateway;
/// JSON messages exchanged with the signaling server.
pub mod message;
pub mod sdp;
