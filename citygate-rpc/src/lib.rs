mod message;
pub use message::*;
mod frame;
pub use frame::*;
mod rpc;
pub use rpc::*;
mod client;
pub use client::*;
mod server;
pub use server::*;
pub mod device;

pub use tokio_util::sync::CancellationToken;
