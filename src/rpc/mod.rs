pub mod client;
pub mod resolver;
pub mod server;

pub use client::{RpcClient, RpcClientFactory, TargetUrl};
pub use resolver::EtcdResolver;
pub use server::{RpcServer, RpcServiceRegistry};
