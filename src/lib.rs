pub mod config;
pub mod coord;
pub mod error;
pub mod http;
pub mod leader;
pub mod model;
pub mod node;
pub mod rpc;
pub mod schedule;
pub mod settings;
pub mod shutdown;
pub mod store;
pub mod tls;
pub mod worker;

// Generated control-plane protobuf types
pub mod proto {
    tonic::include_proto!("taskherd");
}
