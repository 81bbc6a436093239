// Shared types for the beacon realtime layer.
//
// Everything that crosses the wire between the relay and its clients
// lives here so the server and future Rust clients agree on one
// definition: the server event envelope, the client control messages,
// and the room naming convention.

pub mod protocol;
pub mod room;
