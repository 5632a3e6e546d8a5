//! Minimal stand-in for the structured payload codec the proxy sits on top
//! of — that codec is a separate library concern and out of scope here.
//! This module reproduces only the two observable envelope kinds and the
//! one inner record kind ("want configuration" and the text-application
//! packet) that the proxy itself needs to build and recognize.
//!
//! Unlike the real protobuf wire format, this shim tags its own direction
//! explicitly (`DIR_UPSTREAM` / `DIR_DOWNSTREAM`), so there is no ambiguity
//! to resolve by trying both parses — the upstream/downstream sum type the
//! spec asks for is still the return shape of [`try_extract_text`], it's
//! just that the tag, not trial-and-error, picks the variant.

pub const DIR_UPSTREAM: u8 = 0;
pub const DIR_DOWNSTREAM: u8 = 1;

const RECORD_WANT_CONFIG: u8 = 0x01;
const RECORD_PACKET: u8 = 0x02;

pub const PORTNUM_TEXT_MESSAGE_APP: u8 = 1;
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// `(sender_id, channel, text)` extracted from a decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRecord {
    pub sender_id: String,
    pub channel: u32,
    pub text: String,
}

/// Result of attempting to interpret a payload as one of the two envelope
/// kinds carrying a text-application record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedKind {
    UpstreamText(TextRecord),
    DownstreamText(TextRecord),
    Other,
}

/// The inner packet shape shared by both envelope directions. A response
/// injector builds exactly one of these and wraps it on both sides so the
/// radio and the forged client frame carry byte-identical packet fields.
#[derive(Debug, Clone)]
pub struct InnerPacket {
    pub from: u32,
    pub to: u32,
    pub id: u32,
    pub channel: u32,
    pub hop_limit: u8,
    pub want_ack: bool,
    pub portnum: u8,
    pub body: Vec<u8>,
}

impl InnerPacket {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.body.len());
        out.push(RECORD_PACKET);
        out.extend_from_slice(&self.from.to_be_bytes());
        out.extend_from_slice(&self.to.to_be_bytes());
        out.extend_from_slice(&self.id.to_be_bytes());
        out.push(self.channel.min(u8::MAX as u32) as u8);
        out.push(self.hop_limit);
        out.push(self.want_ack as u8);
        out.push(self.portnum);
        let body_len = self.body.len().min(u16::MAX as usize) as u16;
        out.extend_from_slice(&body_len.to_be_bytes());
        out.extend_from_slice(&self.body[..body_len as usize]);
        out
    }

    pub(crate) fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes[0] != RECORD_PACKET {
            return None;
        }
        if bytes.len() < 17 {
            return None;
        }
        let from = u32::from_be_bytes(bytes[1..5].try_into().ok()?);
        let to = u32::from_be_bytes(bytes[5..9].try_into().ok()?);
        let id = u32::from_be_bytes(bytes[9..13].try_into().ok()?);
        let channel = bytes[13] as u32;
        let hop_limit = bytes[14];
        let want_ack = bytes[15] != 0;
        let portnum = bytes[16];
        let body_len = u16::from_be_bytes(bytes.get(17..19)?.try_into().ok()?) as usize;
        let body = bytes.get(19..19 + body_len)?.to_vec();
        Some(Self {
            from,
            to,
            id,
            channel,
            hop_limit,
            want_ack,
            portnum,
            body,
        })
    }
}

/// Wrap an already-built inner packet in an upstream envelope.
pub fn wrap_upstream(pkt: &InnerPacket) -> Vec<u8> {
    let mut out = vec![DIR_UPSTREAM];
    out.extend(pkt.encode());
    out
}

/// Wrap the same inner packet in a downstream envelope.
pub fn wrap_downstream(pkt: &InnerPacket) -> Vec<u8> {
    let mut out = vec![DIR_DOWNSTREAM];
    out.extend(pkt.encode());
    out
}

/// Build the handshake "want configuration" record, wrapped as an upstream
/// envelope, with the given nonzero config id.
pub fn build_want_config(config_id: u32) -> Vec<u8> {
    let mut out = vec![DIR_UPSTREAM, RECORD_WANT_CONFIG];
    out.extend_from_slice(&config_id.to_be_bytes());
    out
}

/// Best-effort decode. Never panics or returns an error — any malformed or
/// unrecognized payload collapses to [`DecodedKind::Other`].
pub fn try_extract_text(payload: &[u8]) -> DecodedKind {
    if payload.len() < 2 {
        return DecodedKind::Other;
    }
    let direction = payload[0];
    let Some(pkt) = InnerPacket::decode(&payload[1..]) else {
        return DecodedKind::Other;
    };
    if pkt.portnum != PORTNUM_TEXT_MESSAGE_APP {
        return DecodedKind::Other;
    }
    let upstream = direction == DIR_UPSTREAM;
    let sender_id = format_sender_id(pkt.from, upstream);
    let text = String::from_utf8_lossy(&pkt.body).into_owned();
    let record = TextRecord {
        sender_id,
        channel: pkt.channel,
        text,
    };
    if upstream {
        DecodedKind::UpstreamText(record)
    } else {
        DecodedKind::DownstreamText(record)
    }
}

/// `!{8 hex digits}` for a nonzero node id; `"client"` (upstream) or
/// `"unknown"` (downstream) for id zero — the asymmetry is intentional,
/// carried over from the fallback literals the proxy used on each side.
fn format_sender_id(from: u32, upstream: bool) -> String {
    if from == 0 {
        if upstream { "client" } else { "unknown" }.to_string()
    } else {
        format!("!{from:08x}")
    }
}
