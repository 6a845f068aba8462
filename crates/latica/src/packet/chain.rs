use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Packet, MESSAGE_BYTES};
use crate::error::LaticaError;
use crate::types::sha256;

/// Message of the head packet of a fragment chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainHead {
    /// Total size of the reassembled message.
    pub size: usize,
    /// Number of fragments following the head.
    pub indexes: usize,
    #[serde(default)]
    pub meta: Value,
}

/// Split `message` into packets modelled on `template`.
///
/// A message that fits the message region yields a single packet with
/// `index == -1`. Larger messages become a head (`index 0`, message is a
/// [`ChainHead`]) followed by `indexes` fragments. The head id is
/// `sha256(head message)`; each following id is
/// `sha256(previous id | sha256(fragment message))`. Fragments carry the
/// head id as `previous_id` and every packet points at its successor
/// through `next_id`. Signature and `usr2` stay on the head only.
pub fn fragment(
    template: &Packet,
    message: &[u8],
    meta: Value,
) -> Result<Vec<Packet>, LaticaError> {
    if message.len() <= MESSAGE_BYTES {
        let mut single = template.clone();
        single.message = message.to_vec();
        single.index = -1;
        single.ensure_id();
        return Ok(vec![single]);
    }

    let chunks: Vec<&[u8]> = message.chunks(MESSAGE_BYTES).collect();
    let head_msg = ChainHead {
        size: message.len(),
        indexes: chunks.len(),
        meta,
    };

    let mut head = template.clone();
    head.message = serde_json::to_vec(&head_msg)?;
    head.index = 0;
    head.packet_id = sha256(&head.message);

    let mut packets = Vec::with_capacity(chunks.len() + 1);
    packets.push(head);

    for (i, chunk) in chunks.iter().enumerate() {
        let prev_id = packets[i].packet_id;
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&prev_id);
        buf.extend_from_slice(&sha256(chunk));

        let mut frag = template.clone();
        frag.message = chunk.to_vec();
        frag.index = i as i32 + 1;
        frag.packet_id = sha256(&buf);
        frag.previous_id = packets[0].packet_id;
        frag.clock = template.clock.wrapping_add(i as u32 + 1);
        frag.sig.clear();
        frag.usr2.clear();

        packets[i].next_id = frag.packet_id;
        packets.push(frag);
    }

    Ok(packets)
}
