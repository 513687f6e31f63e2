use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use super::packet::{BanchoPacketHeader, HEADER_LEN, SUPPORTER_BIT, USER_PRIVILEGES_ID};

/// Packets with a `UserPrivileges` payload larger than this are treated as
/// malformed rather than buffered further.
const MAX_USER_PRIVILEGES_PAYLOAD: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Payload,
    PassThrough,
}

/// A pure, allocation-light state machine over the server→client Bancho
/// byte stream. Consumes arbitrarily-fragmented input (down to one byte at a
/// time) and emits output byte-identical to the input except that any
/// well-formed `UserPrivileges` (id 71) packet has its `SUPPORTER` bit set.
///
/// Independent of the socket layer by design, so the property tests in this
/// module (and the crate's integration tests) can drive it with plain byte
/// slices.
pub struct BanchoSplicer {
    phase: Phase,
    header_buf: Vec<u8>,
    pending_header: Vec<u8>,
    payload_buf: Vec<u8>,
    remaining: u64,
    inject_supporter: bool,
    /// Set once a malformed `UserPrivileges` packet is seen; inspection is
    /// abandoned for the remainder of the connection.
    inspection_disabled: bool,
    packets_injected: Arc<AtomicU64>,
}

impl BanchoSplicer {
    pub fn new(inject_supporter: bool, packets_injected: Arc<AtomicU64>) -> Self {
        Self {
            phase: Phase::Header,
            header_buf: Vec::with_capacity(HEADER_LEN),
            pending_header: Vec::with_capacity(HEADER_LEN),
            payload_buf: Vec::with_capacity(4),
            remaining: 0,
            inject_supporter,
            inspection_disabled: false,
            packets_injected,
        }
    }

    /// Feed the next chunk of server→client bytes, returning the bytes to
    /// forward to the client. May be called with any split of the input
    /// stream, including one byte at a time.
    pub fn feed(&mut self, mut input: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(input.len());

        while !input.is_empty() {
            match self.phase {
                Phase::Header => {
                    let need = HEADER_LEN - self.header_buf.len();
                    let take = need.min(input.len());
                    self.header_buf.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    if self.header_buf.len() == HEADER_LEN {
                        self.on_header_complete(&mut output);
                    }
                }
                Phase::Payload => {
                    let need = 4 - self.payload_buf.len();
                    let take = need.min(input.len());
                    self.payload_buf.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    if self.payload_buf.len() == 4 {
                        self.on_payload_complete(&mut output);
                    }
                }
                Phase::PassThrough => {
                    let take = (self.remaining as usize).min(input.len());
                    output.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.phase = Phase::Header;
                    }
                }
            }
        }

        output
    }

    fn on_header_complete(&mut self, output: &mut Vec<u8>) {
        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&self.header_buf);
        let header = BanchoPacketHeader::decode(&header_bytes);

        if header.is_user_privileges() && header.length > MAX_USER_PRIVILEGES_PAYLOAD {
            warn!(
                length = header.length,
                "malformed UserPrivileges packet, abandoning inspection for this connection"
            );
            self.inspection_disabled = true;
        }

        let should_inspect = !self.inspection_disabled
            && header.id == USER_PRIVILEGES_ID
            && header.length == 4
            && header.compression_flag == 0
            && self.inject_supporter;

        if should_inspect {
            std::mem::swap(&mut self.pending_header, &mut self.header_buf);
            self.header_buf.clear();
            self.payload_buf.clear();
            self.phase = Phase::Payload;
        } else {
            output.extend_from_slice(&self.header_buf);
            self.header_buf.clear();
            if header.length == 0 {
                self.phase = Phase::Header;
            } else {
                self.phase = Phase::PassThrough;
                self.remaining = header.length as u64;
            }
        }
    }

    fn on_payload_complete(&mut self, output: &mut Vec<u8>) {
        let old_mask = u32::from_le_bytes([
            self.payload_buf[0],
            self.payload_buf[1],
            self.payload_buf[2],
            self.payload_buf[3],
        ]);
        let new_mask = old_mask | SUPPORTER_BIT;

        if new_mask != old_mask {
            self.packets_injected.fetch_add(1, Ordering::Relaxed);
        }

        output.extend_from_slice(&self.pending_header);
        output.extend_from_slice(&new_mask.to_le_bytes());

        self.pending_header.clear();
        self.payload_buf.clear();
        self.phase = Phase::Header;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_splicer() -> (BanchoSplicer, Arc<AtomicU64>) {
        let counter = Arc::new(AtomicU64::new(0));
        (BanchoSplicer::new(true, counter.clone()), counter)
    }

    fn user_privileges_packet(payload: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(11);
        bytes.extend_from_slice(&71u16.to_le_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&payload.to_le_bytes());
        bytes
    }

    #[test]
    fn supporter_injection_sets_bit() {
        let (mut splicer, counter) = new_splicer();
        let input = user_privileges_packet(0);
        let output = splicer.feed(&input);

        let expected = user_privileges_packet(0x04);
        assert_eq!(output, expected);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn supporter_injection_preserves_existing_bits() {
        let (mut splicer, _counter) = new_splicer();
        let input = user_privileges_packet(0x01);
        let output = splicer.feed(&input);

        assert_eq!(output, user_privileges_packet(0x05));
    }

    #[test]
    fn already_supporter_does_not_increment_counter() {
        let (mut splicer, counter) = new_splicer();
        let input = user_privileges_packet(0x04);
        let output = splicer.feed(&input);

        assert_eq!(output, user_privileges_packet(0x04));
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn non_target_packet_is_untouched() {
        let (mut splicer, counter) = new_splicer();
        let input: Vec<u8> = vec![24, 0, 0, 2, 0, 0, 0, 0xAA, 0xBB];
        let output = splicer.feed(&input);

        assert_eq!(output, input);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn fragmented_injection_one_byte_at_a_time() {
        let (mut splicer, counter) = new_splicer();
        let input = user_privileges_packet(0);
        let mut output = Vec::new();
        for byte in &input {
            output.extend(splicer.feed(std::slice::from_ref(byte)));
        }

        assert_eq!(output, user_privileges_packet(0x04));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn wrong_length_user_privileges_passes_through_unchanged() {
        let (mut splicer, counter) = new_splicer();
        let mut input = Vec::new();
        input.extend_from_slice(&71u16.to_le_bytes());
        input.push(0);
        input.extend_from_slice(&5u32.to_le_bytes());
        input.extend_from_slice(&[1, 2, 3, 4, 5]);

        let output = splicer.feed(&input);
        assert_eq!(output, input);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn disabled_when_inject_supporter_is_false() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut splicer = BanchoSplicer::new(false, counter.clone());
        let input = user_privileges_packet(0);
        let output = splicer.feed(&input);

        assert_eq!(output, input);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn compressed_user_privileges_is_skipped() {
        let (mut splicer, counter) = new_splicer();
        let mut input = Vec::new();
        input.extend_from_slice(&71u16.to_le_bytes());
        input.push(1); // compressionFlag != 0
        input.extend_from_slice(&4u32.to_le_bytes());
        input.extend_from_slice(&0u32.to_le_bytes());

        let output = splicer.feed(&input);
        assert_eq!(output, input);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn oversized_user_privileges_abandons_inspection_for_connection() {
        let (mut splicer, counter) = new_splicer();
        let mut header = Vec::new();
        header.extend_from_slice(&71u16.to_le_bytes());
        header.push(0);
        header.extend_from_slice(&(MAX_USER_PRIVILEGES_PAYLOAD + 1).to_le_bytes());
        let body = vec![0xEEu8; (MAX_USER_PRIVILEGES_PAYLOAD + 1) as usize];

        let mut expected = header.clone();
        expected.extend_from_slice(&body);

        let mut output = splicer.feed(&header);
        output.extend(splicer.feed(&body));
        assert_eq!(output, expected);

        // A subsequent well-formed UserPrivileges packet is no longer inspected.
        let next = user_privileges_packet(0);
        let next_output = splicer.feed(&next);
        assert_eq!(next_output, next);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn header_split_across_two_reads() {
        let (mut splicer, _counter) = new_splicer();
        let input: Vec<u8> = vec![24, 0, 0, 2, 0, 0, 0, 0xAA, 0xBB];

        let mut output = splicer.feed(&input[..1]);
        output.extend(splicer.feed(&input[1..]));

        assert_eq!(output, input);
    }
}

/// Property tests for the invariants spec.md §8 names: byte-equivalence for
/// anything that isn't a `UserPrivileges` packet, idempotence of the bit-set
/// under re-application, and independence from how the input is fragmented
/// across `feed` calls.
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn non_user_privileges_packet(id: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(7 + payload.len());
        bytes.extend_from_slice(&id.to_le_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    fn user_privileges_packet(mask: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(11);
        bytes.extend_from_slice(&USER_PRIVILEGES_ID.to_le_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&mask.to_le_bytes());
        bytes
    }

    fn arbitrary_packet() -> impl Strategy<Value = Vec<u8>> {
        prop_oneof![
            any::<u32>().prop_map(user_privileges_packet),
            (1u16..200, prop::collection::vec(any::<u8>(), 0..16))
                .prop_filter("id must not collide with UserPrivileges", |(id, _)| {
                    *id != USER_PRIVILEGES_ID
                })
                .prop_map(|(id, payload)| non_user_privileges_packet(id, &payload)),
        ]
    }

    fn arbitrary_stream() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(arbitrary_packet(), 0..8).prop_map(|packets| packets.concat())
    }

    proptest! {
        #[test]
        fn non_user_privileges_packets_pass_through_byte_identical(
            id in (1u16..200).prop_filter("must not be UserPrivileges", |id| *id != USER_PRIVILEGES_ID),
            payload in prop::collection::vec(any::<u8>(), 0..32),
        ) {
            let input = non_user_privileges_packet(id, &payload);
            let counter = Arc::new(AtomicU64::new(0));
            let mut splicer = BanchoSplicer::new(true, counter.clone());
            let output = splicer.feed(&input);

            prop_assert_eq!(output, input);
            prop_assert_eq!(counter.load(Ordering::Relaxed), 0);
        }

        #[test]
        fn bit_set_is_idempotent_under_reapplication(mask in any::<u32>()) {
            let packet = user_privileges_packet(mask);

            let counter_a = Arc::new(AtomicU64::new(0));
            let mut first = BanchoSplicer::new(true, counter_a);
            let once = first.feed(&packet);

            let counter_b = Arc::new(AtomicU64::new(0));
            let mut second = BanchoSplicer::new(true, counter_b);
            let twice = second.feed(&once);

            prop_assert_eq!(once, twice);
        }

        #[test]
        fn fragmentation_schedule_does_not_affect_output(
            stream in arbitrary_stream(),
            cuts in prop::collection::vec(1usize..=7, 0..20),
        ) {
            let counter_whole = Arc::new(AtomicU64::new(0));
            let mut whole_splicer = BanchoSplicer::new(true, counter_whole.clone());
            let whole_output = whole_splicer.feed(&stream);

            let counter_frag = Arc::new(AtomicU64::new(0));
            let mut frag_splicer = BanchoSplicer::new(true, counter_frag.clone());
            let mut frag_output = Vec::new();
            let mut offset = 0;
            for cut in &cuts {
                if offset >= stream.len() {
                    break;
                }
                let take = (*cut).min(stream.len() - offset);
                frag_output.extend(frag_splicer.feed(&stream[offset..offset + take]));
                offset += take;
            }
            if offset < stream.len() {
                frag_output.extend(frag_splicer.feed(&stream[offset..]));
            }

            prop_assert_eq!(&whole_output, &frag_output);
            prop_assert_eq!(
                counter_whole.load(Ordering::Relaxed),
                counter_frag.load(Ordering::Relaxed)
            );
        }
    }
}
