// collab-common: wire protocol and shared types for the collaboration relay

pub mod protocol;
pub mod token;
