//! Composes a `/gem` reply into the wire format and delivers it both to the
//! radio (so the mesh actually carries it) and to every connected client
//! (forged as if the radio had echoed it, so clients see it even when the
//! radio doesn't echo their own injected traffic back).

use rand::Rng;
use tracing::warn;

use crate::context::AppContext;
use crate::envelope::{self, InnerPacket, BROADCAST_ADDR, PORTNUM_TEXT_MESSAGE_APP};
use crate::frame;

/// Radio frame payload concern, independent of the [200, 600] band the
/// generator shapes its output to — transport may truncate further. Kept
/// at 200 even though this guarantees truncation for most replies; see
/// DESIGN.md for why this constant is preserved rather than raised.
const MAX_RESPONSE_CHARS: usize = 200;

pub async fn inject(ctx: &AppContext, channel: Option<u32>, text: String) {
    tokio::time::sleep(ctx.response_delay).await;

    let clipped: String = text.chars().take(MAX_RESPONSE_CHARS).collect();
    let use_channel = channel.unwrap_or(ctx.default_channel);
    let packet_id: u32 = loop {
        let v = rand::thread_rng().gen::<u32>();
        if v != 0 {
            break v;
        }
    };

    let packet = InnerPacket {
        from: 0,
        to: BROADCAST_ADDR,
        id: packet_id,
        channel: use_channel,
        hop_limit: 7,
        want_ack: true,
        portnum: PORTNUM_TEXT_MESSAGE_APP,
        body: clipped.into_bytes(),
    };

    match frame::build(&envelope::wrap_upstream(&packet)) {
        Ok(upstream_frame) => {
            if !ctx.radio.send(&upstream_frame).await {
                warn!("failed to deliver /gem response to radio");
            }
        }
        Err(e) => warn!(error = %e, "failed to frame upstream /gem response"),
    }

    match frame::build(&envelope::wrap_downstream(&packet)) {
        Ok(downstream_frame) => ctx.registry.broadcast(&downstream_frame, None),
        Err(e) => warn!(error = %e, "failed to frame downstream /gem response"),
    }
}
