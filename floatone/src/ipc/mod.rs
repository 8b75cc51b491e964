mod client;
mod hub;

pub use client::SocketBus;
pub use hub::BusServer;
#[cfg(test)]
pub use hub::FrameBroadcaster;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/floatone-bus.sock";
