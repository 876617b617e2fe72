pub mod capture;
pub mod config;
pub mod decoder;
pub mod observer;
pub mod relay;
pub mod target;

pub use capture::{CaptureError, PnetCapture};
pub use config::Config;
pub use decoder::{DecodeError, DecodedPacket, Ipv4Header, PacketDecoder, TcpHeader};
pub use observer::{Capture, CaptureEvent, Flow, ObserverSummary, PacketObserver};
pub use relay::{Dialer, Proxy, RelayError, TcpDialer};
pub use target::{ResolveError, TargetInfo};
