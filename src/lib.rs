//! ADB host-side client protocol engine: the packet dispatcher and
//! per-socket flow control that sit between an application and `adbd`,
//! over USB or TCP.
//!
//! The usual entry point is [`Dispatcher::connect`], given a
//! [`transport::Transport`] and a [`keys::KeyStore`]; it runs the
//! handshake and hands back a [`Dispatcher`] whose [`Dispatcher::open`]
//! yields one [`socket::Socket`] per logical stream (`shell:`, `sync:`,
//! and friends).

mod auth;
mod dispatcher;
mod error;
mod incoming;
mod keys;
mod packet;
mod pubkey;
mod socket;
mod transport;
mod usb;

#[cfg(test)]
mod testutil;

pub use crate::auth::Handshake;
pub use crate::dispatcher::Dispatcher;
pub use crate::error::{AdbError, Result};
pub use crate::incoming::{IncomingDecision, IncomingHandler, RejectAll};
pub use crate::keys::KeyStore;
pub use crate::packet::{Command, ConnectionParams};
pub use crate::socket::Socket;
pub use crate::transport::{PacketReader, PacketWriter, TcpTransport, Transport, UsbTransport};
pub use crate::usb::{usb_devices, UsbDevice, UsbDeviceList, UsbDevices};
