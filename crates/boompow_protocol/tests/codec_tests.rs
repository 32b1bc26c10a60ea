use boompow_domain::UserId;
use boompow_protocol::{
	CodecError, DEFAULT_MAX_FRAME_SIZE, RewardEarned, ServerMessage, WorkGenerate, WorkResult, WorkerMessage,
	decode_message, encode_message, encode_message_default,
};
use proptest::prelude::*;

const REQUESTER: &str = "6f2a7c1e-4b8d-4a53-9f0e-2d7b1c3a5e90";

#[test]
fn decodes_worker_result_frame() {
	let text = format!(
		r#"{{"type":"work_result","request_id":"r-1","requester_id":"{REQUESTER}","hash":"ABCD","work":"0011","difficulty_multiplier":4}}"#
	);

	let msg: WorkerMessage = decode_message(&text, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	let WorkerMessage::WorkResult(result) = msg;

	assert_eq!(result.request_id, "r-1");
	assert_eq!(result.requester_id, REQUESTER.parse::<UserId>().unwrap());
	assert_eq!(result.difficulty_multiplier, 4);
}

#[test]
fn ignores_fields_the_server_does_not_read() {
	let text = format!(
		r#"{{"type":"work_result","request_id":"r-1","requester_id":"{REQUESTER}","hash":"ABCD","work":"0011","difficulty_multiplier":1,"block_awarded":true}}"#
	);

	let msg: WorkerMessage = decode_message(&text, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	let WorkerMessage::WorkResult(result) = msg;
	assert_eq!(result.hash, "ABCD");
}

#[test]
fn rejects_unknown_message_type() {
	let err = decode_message::<WorkerMessage>(r#"{"type":"hello"}"#, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	assert!(matches!(err, CodecError::Decode(_)), "unexpected error: {err:?}");
}

#[test]
fn server_messages_carry_type_tag() {
	let requester_id: UserId = REQUESTER.parse().unwrap();

	let generate = encode_message_default(&ServerMessage::WorkGenerate(WorkGenerate {
		request_id: "r-2".to_string(),
		requester_id,
		hash: "FFFF".to_string(),
		difficulty_multiplier: 1,
	}))
	.expect("encode");
	assert!(generate.contains(r#""type":"work_generate""#), "got: {generate}");

	let reward = encode_message_default(&ServerMessage::RewardEarned(RewardEarned {
		hash: "FFFF".to_string(),
		requester_id,
		total_results: 10,
		awarded_at_unix_ms: 1_700_000_000_000,
	}))
	.expect("encode");
	assert!(reward.contains(r#""type":"reward_earned""#), "got: {reward}");
	assert!(reward.contains(r#""total_results":10"#), "got: {reward}");
}

#[test]
fn encode_rejects_frames_over_limit() {
	let msg = WorkerMessage::WorkResult(WorkResult {
		request_id: "r".to_string(),
		requester_id: REQUESTER.parse().unwrap(),
		hash: "A".repeat(256),
		work: "0".to_string(),
		difficulty_multiplier: 1,
	});

	match encode_message(&msg, 64).unwrap_err() {
		CodecError::FrameTooLarge { len, max } => {
			assert_eq!(max, 64);
			assert!(len > max);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

proptest! {
	#[test]
	fn decode_rejects_any_frame_over_limit(extra in 1usize..512) {
		let limit = 32usize;
		let text = "x".repeat(limit + extra);
		let err = decode_message::<WorkerMessage>(&text, limit).unwrap_err();
		let is_too_large = matches!(err, CodecError::FrameTooLarge { .. });
		prop_assert!(is_too_large);
	}
}
