//! Userspace TUN virtual stack (§4.7): a smoltcp interface that answers the
//! OS's TCP handshake for flows the dispatcher accepts, plus a raw-frame
//! shortcut for UDP (which has no handshake to emulate).

pub mod checksum;
pub mod device;
pub mod packet_builder;
pub mod platform;
pub mod stack;

pub use device::{TunDevice, TunHandle};
pub use stack::TunStack;
