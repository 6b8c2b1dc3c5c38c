//! The publish/subscribe bus: channels addressable as
//! `<process-prefix><channel-name>`, served over TCP by [`server::TransportServer`]
//! and consumed through [`client::ChannelClient`].
pub mod client;
pub mod protocol;
pub mod server;
