/// Fixed 7-byte Bancho packet header: `u16 id | u8 compressionFlag | u32
/// length`, all little-endian. `length` is the size of the payload that
/// follows.
pub const HEADER_LEN: usize = 7;

/// The one packet id this crate ever mutates.
pub const USER_PRIVILEGES_ID: u16 = 71;

/// Bit 2 of the privileges bitmask: `SUPPORTER`.
pub const SUPPORTER_BIT: u32 = 0x04;

/// A decoded header, used only to decide how the splicer should treat the
/// bytes that follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanchoPacketHeader {
    pub id: u16,
    pub compression_flag: u8,
    pub length: u32,
}

impl BanchoPacketHeader {
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        Self {
            id: u16::from_le_bytes([bytes[0], bytes[1]]),
            compression_flag: bytes[2],
            length: u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]),
        }
    }

    pub fn is_user_privileges(&self) -> bool {
        self.id == USER_PRIVILEGES_ID
    }
}
