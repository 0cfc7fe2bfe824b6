//! The data plane: packets from the virtual interface, DNS filtering, and
//! either direct forwarding or the encrypted gateway.

pub mod buffer;
#[cfg(target_os = "linux")]
pub mod device;
pub mod dns;
pub mod forwarder;
pub mod layout;
pub mod packet;
pub mod proxy;
pub mod runner;
pub mod supervisor;
pub mod sys;
pub mod wireguard;

pub use buffer::{BufferId, BufferPool, Loopback};
pub use dns::{deny_response, DnsAddressing, Interceptor, Verdict};
pub use forwarder::{Clock, ForwardRule, Forwarder, ManualClock, SystemClock};
pub use layout::{Cidr, LayoutKind, VpnLayout};
pub use packet::{build_udp, parse_udp, to_device, Envelope, UdpPacket};
pub use proxy::{DnsProxy, ProtectFn, ProtectedSockets, Proxy, SocketFactory};
pub use runner::{RunnerSettings, TunnelRunner};
pub use supervisor::TunnelHandle;
pub use wireguard::{ErrorBudget, Outcome, WgProxy};
