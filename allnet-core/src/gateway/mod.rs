pub mod ip;
pub mod local;

pub use ip::{IpGateway, IpGatewayConfig, KnownPeers};
pub use local::{register_app, run_downlink, run_uplink, AppFanout};
