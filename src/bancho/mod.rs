//! The Bancho stream splicer (C6): a full-duplex byte-forwarder whose
//! server→client direction is parsed as a stream of length-prefixed binary
//! packets, mutating `UserPrivileges` (id 71) in place.

mod packet;
mod splicer;

pub use packet::{BanchoPacketHeader, HEADER_LEN, SUPPORTER_BIT, USER_PRIVILEGES_ID};
pub use splicer::BanchoSplicer;
