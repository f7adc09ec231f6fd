//! Delay-tolerant mesh routing core.
//!
//! The crate is organised leaves-first: wire buffers and hashes, the
//! symmetric token and IFAC primitives, identities, the packet wire format,
//! destinations and links on top of them, the interface layer with its
//! framing codecs, and finally the transport engine that ties routing,
//! announce propagation and periodic maintenance together.

pub mod buffer;
pub mod crypt;
pub mod destination;
pub mod error;
pub mod hash;
pub mod identity;
pub mod iface;
pub mod packet;
pub mod ratchets;
pub mod time;
pub mod transport;

pub use crate::destination::link::{Link, LinkEvent, LinkEventData, LinkStatus};
pub use crate::destination::{DestinationName, SingleInputDestination, SingleOutputDestination};
pub use crate::error::MeshError;
pub use crate::hash::AddressHash;
pub use crate::identity::{Identity, PrivateIdentity};
pub use crate::packet::Packet;
pub use crate::transport::{Transport, TransportConfig};
