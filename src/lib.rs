#![doc = include_str!("../README.md")]

pub mod addr;
pub mod config;
pub mod context;
pub mod error;
pub mod iface;
pub mod ledger;
pub mod options;
pub mod socket;

mod backend;
mod fd;
mod sys;

pub use config::SocketConfig;
pub use context::{SocketContext, SocketKind, Strategy};
pub use error::{Result, SocketError};
pub use iface::NetworkInterface;
pub use options::{OptionValue, SocketOption};
pub use socket::{DatagramPacket, DatagramSocket, ReadResult, Socket, SocketState, StreamSocket};
