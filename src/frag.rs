//! Fragmentation and reassembly of oversized UDP envelopes.
//!
//! When an encoded `UdpMessage` exceeds the QUIC datagram ceiling the
//! payload is split into equal-capped chunks, each re-encoded with the same
//! nonzero `msg_id` and a `frag_id`/`frag_count` pair. The receiving side
//! keeps at most one in-progress message per session; a fragment carrying a
//! different `msg_id` displaces whatever was being collected.

use std::collections::HashMap;

use bytes::BytesMut;

use crate::protocol::UdpMessage;

/// Splits `msg` so every encoded fragment fits in `max_size` bytes.
///
/// The caller is responsible for assigning a nonzero `msg_id` before
/// fragmenting. Messages that already fit are returned unchanged.
pub fn frag_udp_message(msg: UdpMessage, max_size: usize) -> Vec<UdpMessage> {
    if msg.encoded_size() <= max_size {
        return vec![msg];
    }
    let max_payload = max_size.saturating_sub(msg.header_size());
    if max_payload == 0 {
        // Header alone exceeds the ceiling; nothing sensible to emit.
        return vec![msg];
    }

    let payload = msg.data.clone();
    let frag_count = payload.len().div_ceil(max_payload);
    if frag_count > u8::MAX as usize {
        // Cannot be represented on the wire; let the datagram send fail.
        return vec![msg];
    }
    let mut frags = Vec::with_capacity(frag_count);
    for (frag_id, chunk) in (0u8..).zip(payload.chunks(max_payload)) {
        let mut frag = msg.clone();
        frag.frag_id = frag_id;
        frag.frag_count = frag_count as u8;
        frag.data = payload.slice_ref(chunk);
        frags.push(frag);
    }
    frags
}

struct DefragState {
    msg_id: u16,
    received: u8,
    frags: Vec<Option<UdpMessage>>,
}

impl DefragState {
    fn new(msg: &UdpMessage) -> Self {
        Self {
            msg_id: msg.msg_id,
            received: 0,
            frags: vec![None; msg.frag_count as usize],
        }
    }
}

/// Per-session reassembly of fragmented `UdpMessage`s.
#[derive(Default)]
pub struct Defragger {
    sessions: HashMap<u32, DefragState>,
}

impl Defragger {
    /// Feeds one received envelope. Returns a complete message once every
    /// fragment of the tracked `msg_id` has arrived; unfragmented messages
    /// pass straight through.
    pub fn feed(&mut self, msg: UdpMessage) -> Option<UdpMessage> {
        if msg.frag_count <= 1 {
            return Some(msg);
        }
        if msg.frag_id >= msg.frag_count {
            return None;
        }

        let state = self
            .sessions
            .entry(msg.session_id)
            .or_insert_with(|| DefragState::new(&msg));
        if state.msg_id != msg.msg_id || state.frags.len() != msg.frag_count as usize {
            // A different message displaces the partial state.
            *state = DefragState::new(&msg);
        }

        let slot = &mut state.frags[msg.frag_id as usize];
        if slot.is_some() {
            return None;
        }
        *slot = Some(msg.clone());
        state.received += 1;
        if (state.received as usize) < state.frags.len() {
            return None;
        }

        let state = self.sessions.remove(&msg.session_id)?;
        let mut data = BytesMut::new();
        for frag in state.frags.iter() {
            data.extend_from_slice(&frag.as_ref()?.data);
        }
        Some(UdpMessage {
            session_id: msg.session_id,
            host: msg.host,
            port: msg.port,
            msg_id: 0,
            frag_id: 0,
            frag_count: 1,
            data: data.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn message(session_id: u32, len: usize) -> UdpMessage {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        UdpMessage {
            session_id,
            host: "example.com".to_string(),
            port: 443,
            msg_id: 0,
            frag_id: 0,
            frag_count: 1,
            data: Bytes::from(data),
        }
    }

    #[test]
    fn small_message_is_not_fragmented() {
        let msg = message(1, 100);
        let frags = frag_udp_message(msg.clone(), 1200);
        assert_eq!(frags, vec![msg]);
    }

    #[test]
    fn fragments_fit_ceiling_and_cover_ids_exactly_once() {
        for max in [256usize, 512, 1200] {
            let mut msg = message(1, 4096);
            msg.msg_id = 777;
            let frags = frag_udp_message(msg.clone(), max);
            assert!(frags.len() >= 2);
            let count = frags.len() as u8;
            let mut seen = vec![false; frags.len()];
            for frag in &frags {
                assert!(frag.encoded_size() <= max, "fragment exceeds {}", max);
                assert_eq!(frag.msg_id, 777);
                assert_eq!(frag.frag_count, count);
                assert!(!seen[frag.frag_id as usize]);
                seen[frag.frag_id as usize] = true;
            }
            assert!(seen.into_iter().all(|s| s));
        }
    }

    #[test]
    fn round_trips_across_simulated_mtus() {
        for max in [256usize, 512, 1200] {
            for len in [1usize, 200, 4096, 32_000] {
                let mut msg = message(9, len);
                msg.msg_id = 4242;
                let frags = frag_udp_message(msg.clone(), max);

                let mut defrag = Defragger::default();
                let mut result = None;
                for frag in frags {
                    // Exercise the real wire encoding on the way through.
                    let decoded = UdpMessage::decode(frag.encode()).unwrap();
                    if let Some(complete) = defrag.feed(decoded) {
                        assert!(result.is_none());
                        result = Some(complete);
                    }
                }
                let result = result.expect("message never completed");
                assert_eq!(result.data, msg.data);
                assert_eq!(result.host, msg.host);
                assert_eq!(result.port, msg.port);
                assert_eq!(result.frag_count, 1);
                assert_eq!(result.msg_id, 0);
            }
        }
    }

    #[test]
    fn out_of_order_fragments_reassemble() {
        let mut msg = message(3, 3000);
        msg.msg_id = 11;
        let mut frags = frag_udp_message(msg.clone(), 512);
        frags.reverse();

        let mut defrag = Defragger::default();
        let mut result = None;
        for frag in frags {
            if let Some(complete) = defrag.feed(frag) {
                result = Some(complete);
            }
        }
        assert_eq!(result.unwrap().data, msg.data);
    }

    #[test]
    fn newer_msg_id_displaces_partial_state() {
        let mut first = message(5, 3000);
        first.msg_id = 1;
        let mut second = message(5, 3000);
        second.msg_id = 2;

        let first_frags = frag_udp_message(first, 512);
        let second_frags = frag_udp_message(second.clone(), 512);

        let mut defrag = Defragger::default();
        // Partially deliver the first message, then switch to the second.
        assert!(defrag.feed(first_frags[0].clone()).is_none());
        assert!(defrag.feed(first_frags[1].clone()).is_none());
        let mut result = None;
        for frag in second_frags {
            if let Some(complete) = defrag.feed(frag) {
                result = Some(complete);
            }
        }
        assert_eq!(result.unwrap().data, second.data);

        // Stragglers from the displaced message never complete anything.
        for frag in &first_frags[2..] {
            assert!(defrag.feed(frag.clone()).is_none());
        }
    }

    #[test]
    fn sessions_do_not_interfere() {
        let mut a = message(1, 2000);
        a.msg_id = 7;
        let mut b = message(2, 2000);
        b.msg_id = 7;

        let mut defrag = Defragger::default();
        let a_frags = frag_udp_message(a.clone(), 512);
        let b_frags = frag_udp_message(b.clone(), 512);
        let mut done = 0;
        for (fa, fb) in a_frags.into_iter().zip(b_frags.into_iter()) {
            if defrag.feed(fa).is_some() {
                done += 1;
            }
            if defrag.feed(fb).is_some() {
                done += 1;
            }
        }
        assert_eq!(done, 2);
    }

    #[test]
    fn duplicate_and_out_of_range_fragments_are_dropped() {
        let mut msg = message(8, 2000);
        msg.msg_id = 3;
        let frags = frag_udp_message(msg, 512);

        let mut defrag = Defragger::default();
        assert!(defrag.feed(frags[0].clone()).is_none());
        // Duplicate of an already-held fragment.
        assert!(defrag.feed(frags[0].clone()).is_none());

        let mut bogus = frags[1].clone();
        bogus.frag_id = bogus.frag_count;
        assert!(defrag.feed(bogus).is_none());
    }
}
