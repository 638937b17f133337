//! Property-based tests for newline framing.
//!
//! However a byte stream is cut into chunks, the framer must produce the same
//! messages in the same order, and a bad line must only ever cost itself.

use mcup_client::protocol::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
use mcup_client::{Framer, TransportError};
use futures::StreamExt;
use proptest::prelude::*;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;

// ─────────────────────────────────────────────────────────────────────────────
// Strategies
// ─────────────────────────────────────────────────────────────────────────────

fn arb_id() -> impl Strategy<Value = RequestId> {
    prop_oneof![
        (1i64..=100_000).prop_map(RequestId::Number),
        "[a-zA-Z0-9_-]{1,16}".prop_map(RequestId::String),
    ]
}

fn arb_method() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_/]{0,20}"
}

/// Free text, including multi-byte characters that can be split mid-sequence.
fn arb_text() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 éü漢字🦀\"\\\\]{0,24}"
}

fn arb_message() -> impl Strategy<Value = JsonRpcMessage> {
    prop_oneof![
        (arb_id(), arb_method(), arb_text()).prop_map(|(id, method, text)| {
            JsonRpcRequest::new(id, method, Some(json!({"text": text}))).into()
        }),
        (arb_method(), arb_text()).prop_map(|(method, text)| {
            JsonRpcNotification::new(method, Some(json!([text]))).into()
        }),
        (arb_id(), arb_text())
            .prop_map(|(id, text)| JsonRpcResponse::new(id, json!({"content": text})).into()),
    ]
}

/// Encode `messages` back to back.
fn wire(messages: &[JsonRpcMessage]) -> Vec<u8> {
    let framer = Framer::default();
    messages
        .iter()
        .flat_map(|m| framer.encode_message(m).unwrap())
        .collect()
}

/// Cut `bytes` at the given (unsorted, possibly out of range) points.
fn chunks(bytes: &[u8], mut cuts: Vec<usize>) -> Vec<&[u8]> {
    cuts.iter_mut().for_each(|c| *c %= bytes.len() + 1);
    cuts.sort_unstable();
    cuts.dedup();

    let mut out = Vec::new();
    let mut start = 0;
    for cut in cuts {
        out.push(&bytes[start..cut]);
        start = cut;
    }
    out.push(&bytes[start..]);
    out
}

/// Write `chunks` one at a time into a pipe and collect what a
/// `FramedRead<_, Framer>` decodes on the other end, the way the pumps read.
fn read_framed(chunks: Vec<Vec<u8>>) -> Vec<mcup_client::Frame> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async move {
        let (mut writer, reader) = tokio::io::duplex(64);
        let feeder = tokio::spawn(async move {
            for chunk in chunks {
                writer.write_all(&chunk).await.unwrap();
                writer.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let frames: Vec<_> = FramedRead::new(reader, Framer::default())
            .map(|frame| frame.unwrap())
            .collect()
            .await;
        feeder.await.unwrap();
        frames
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Properties
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn chunking_does_not_change_output(
        messages in prop::collection::vec(arb_message(), 1..6),
        cuts in prop::collection::vec(any::<usize>(), 0..12),
    ) {
        let bytes = wire(&messages);
        let mut framer = Framer::default();
        let mut decoded = Vec::new();
        for chunk in chunks(&bytes, cuts) {
            decoded.extend(framer.feed(chunk));
        }

        let decoded: Vec<_> = decoded.into_iter().map(|f| f.unwrap()).collect();
        prop_assert_eq!(decoded, messages);
        prop_assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn framed_read_is_chunking_independent(
        messages in prop::collection::vec(arb_message(), 1..6),
        cuts in prop::collection::vec(any::<usize>(), 0..12),
        garbage_at in any::<prop::sample::Index>(),
    ) {
        let at = garbage_at.index(messages.len() + 1);
        let mut bytes = wire(&messages[..at]);
        bytes.extend_from_slice(b"not json\n");
        bytes.extend(wire(&messages[at..]));

        let owned = chunks(&bytes, cuts).into_iter().map(<[u8]>::to_vec).collect();
        let frames = read_framed(owned);

        prop_assert_eq!(frames.len(), messages.len() + 1);
        prop_assert!(frames[at].is_err());
        let good: Vec<_> = frames.into_iter().filter_map(Result::ok).collect();
        prop_assert_eq!(good, messages);
    }

    #[test]
    fn one_bad_line_costs_one_frame(
        messages in prop::collection::vec(arb_message(), 1..6),
        position in any::<prop::sample::Index>(),
        garbage in "[a-z{}\\[\\]]{1,16}",
    ) {
        let at = position.index(messages.len() + 1);
        let mut bytes = wire(&messages[..at]);
        bytes.extend_from_slice(garbage.as_bytes());
        bytes.push(b'\n');
        bytes.extend(wire(&messages[at..]));

        let frames = Framer::default().feed(&bytes);
        prop_assert_eq!(frames.len(), messages.len() + 1);

        // Nothing in the garbage alphabet forms a JSON-RPC message.
        let errors = frames.iter().filter(|f| f.is_err()).count();
        prop_assert_eq!(errors, 1);
        prop_assert!(frames[at].is_err());
        let good: Vec<_> = frames.into_iter().filter_map(Result::ok).collect();
        prop_assert_eq!(good, messages);
    }
}

#[test]
fn malformed_line_is_malformed_message() {
    let frames = Framer::default().feed(b"{\"jsonrpc\":\n");
    assert!(matches!(
        frames.as_slice(),
        [Err(TransportError::MalformedMessage { .. })]
    ));
}
