//! Property tests for the wire protocol.
//!
//! *For any* close code, classification is total and only `1000` counts as
//! a clean close. *For any* inbound text, parsing returns a value or a
//! protocol error and never panics. *For any* `serverContent` made of audio
//! and text parts, every audio part survives the round trip through the
//! parser with its payload intact.

use proptest::prelude::*;
use serde_json::{Value, json};
use vox_realtime::protocol::Part;
use vox_realtime::{AUTH_CLOSE_CODES, CloseReason, FunctionResponse, RealtimeError, ServerMessage};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_close_code_classification(code in any::<u16>()) {
        match CloseReason::from_close_code(code, "reason") {
            None => prop_assert_eq!(code, 1000),
            Some(reason) => {
                prop_assert_ne!(code, 1000);
                prop_assert_eq!(reason.is_auth(), AUTH_CLOSE_CODES.contains(&code));
            }
        }
    }

    #[test]
    fn prop_parse_never_panics(raw in ".{0,200}") {
        match ServerMessage::parse(&raw) {
            Ok(_) | Err(RealtimeError::ProtocolError(_)) => {}
            Err(other) => prop_assert!(false, "unexpected error kind: {other}"),
        }
    }

    #[test]
    fn prop_audio_parts_survive_parsing(parts in prop::collection::vec((any::<bool>(), "[A-Za-z0-9+/]{0,16}"), 0..12)) {
        let wire: Vec<Value> = parts
            .iter()
            .map(|(audio, data)| if *audio {
                json!({"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": data}})
            } else {
                json!({"text": data})
            })
            .collect();
        let raw = json!({"serverContent": {"modelTurn": {"role": "model", "parts": wire}}}).to_string();

        let messages = ServerMessage::parse(&raw).unwrap();
        prop_assert_eq!(messages.len(), 1);
        let ServerMessage::ServerContent(content) = &messages[0] else {
            return Err(TestCaseError::fail("expected serverContent"));
        };
        let parsed: &[Part] = content.model_turn.as_ref().map(|t| t.parts.as_slice()).unwrap_or_default();
        prop_assert_eq!(parsed.len(), parts.len());
        for ((audio, data), part) in parts.iter().zip(parsed) {
            prop_assert_eq!(part.is_audio(), *audio);
            if *audio {
                prop_assert_eq!(&part.inline_data.as_ref().unwrap().data, data);
            } else {
                prop_assert_eq!(part.text.as_deref(), Some(data.as_str()));
            }
        }
    }

    #[test]
    fn prop_string_tool_results_are_wrapped(result in ".{0,64}") {
        let response = FunctionResponse::new("c1", Value::String(result.clone()));
        prop_assert_eq!(response.response, json!({"result": result}));
    }
}
