use pose_coach::fusion::{Category, FusedInsight, Priority, Recommendation};
use pose_coach::modality::{Modality, ResultType};
use pose_coach::transport::{
    AudioPayload, CancelPayload, ContextPayload, InboundMessage, OutboundMessage, ReplyPayload,
    SetupPayload,
};

#[test]
fn test_setup_envelope_serialization() {
    let msg = OutboundMessage::Setup(SetupPayload {
        session_id: "test-session".to_string(),
        model: "coach-live".to_string(),
        instructions: "Be brief".to_string(),
        modalities: vec![Modality::Pose, Modality::Audio],
    });

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"type\":\"setup\""));
    assert!(json.contains("test-session"));
    assert!(json.contains("[\"pose\",\"audio\"]"));

    let deserialized: OutboundMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(deserialized, msg);
}

#[test]
fn test_context_envelope_carries_analysis_data() {
    let msg = OutboundMessage::Context(ContextPayload {
        analysis_id: "a-1".to_string(),
        modality: Modality::Pose,
        result_type: ResultType::FormAnalysis,
        confidence: 0.9,
        data: serde_json::json!({ "kind": "pose", "knee_angle_deg": 92.0 }),
        timestamp: "2025-10-27T14:30:00Z".to_string(),
    });

    let value = serde_json::to_value(&msg).unwrap();
    assert_eq!(value["type"], "context");
    assert_eq!(value["payload"]["result_type"], "form_analysis");
    assert_eq!(value["payload"]["data"]["knee_angle_deg"], 92.0);
}

#[test]
fn test_insight_envelope_serialization() {
    let insight = FusedInsight {
        id: "i-1".to_string(),
        contributing_modalities: [Modality::Pose, Modality::Audio].into_iter().collect(),
        confidence: 0.75,
        recommendations: vec![Recommendation {
            title: "Form cue".to_string(),
            description: "Pose: knee 92°".to_string(),
            priority: Priority::High,
            category: Category::Form,
            modality: Modality::Pose,
        }],
        produced_at: chrono::Utc::now(),
    };

    let json = serde_json::to_string(&OutboundMessage::Insight(insight.clone())).unwrap();
    assert!(json.contains("\"type\":\"insight\""));
    assert!(json.contains("\"priority\":\"high\""));

    let deserialized: OutboundMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(deserialized, OutboundMessage::Insight(insight));
}

#[test]
fn test_audio_payload_pcm_roundtrip() {
    let samples: Vec<i16> = vec![0, 1, -1, i16::MAX, i16::MIN, 1234];

    let payload = AudioPayload::new(&samples, 16000, 7);
    assert_eq!(payload.sequence, 7);
    assert_eq!(payload.samples().unwrap(), samples);
}

#[test]
fn test_audio_payload_rejects_odd_bytes() {
    let payload = AudioPayload {
        pcm: "AAAA".to_string(), // 3 bytes
        sample_rate: 16000,
        sequence: 0,
        timestamp: String::new(),
    };

    assert!(payload.samples().is_err());
}

#[test]
fn test_cancel_kind() {
    let msg = OutboundMessage::Cancel(CancelPayload {
        reason: "barge_in".to_string(),
        timestamp: "2025-10-27T14:30:00Z".to_string(),
    });

    assert_eq!(msg.kind(), "cancel");
    assert!(serde_json::to_string(&msg).unwrap().contains("\"type\":\"cancel\""));
}

#[test]
fn test_setup_complete_deserialization() {
    let msg: InboundMessage = serde_json::from_str(r#"{"type": "setup_complete"}"#).unwrap();
    assert_eq!(msg, InboundMessage::SetupComplete);
}

#[test]
fn test_reply_deserialization_defaults() {
    let json = r#"{"type": "reply", "payload": {"text": "Keep your back straight"}}"#;

    let msg: InboundMessage = serde_json::from_str(json).unwrap();
    assert_eq!(
        msg,
        InboundMessage::Reply(ReplyPayload {
            text: "Keep your back straight".to_string(),
            turn_complete: false,
        })
    );
}

#[test]
fn test_transcription_and_error_deserialization() {
    let json = r#"{
        "type": "transcription",
        "payload": {"text": "Hello coach", "partial": true, "confidence": 0.95}
    }"#;
    match serde_json::from_str::<InboundMessage>(json).unwrap() {
        InboundMessage::Transcription(t) => {
            assert_eq!(t.text, "Hello coach");
            assert!(t.partial);
            assert_eq!(t.confidence, Some(0.95));
        }
        other => panic!("unexpected message: {:?}", other),
    }

    let json = r#"{"type": "error", "payload": {"message": "quota exceeded", "fatal": true}}"#;
    match serde_json::from_str::<InboundMessage>(json).unwrap() {
        InboundMessage::Error(e) => {
            assert_eq!(e.message, "quota exceeded");
            assert!(e.fatal);
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[test]
fn test_unknown_inbound_type_is_rejected() {
    assert!(serde_json::from_str::<InboundMessage>(r#"{"type": "telemetry", "payload": {}}"#).is_err());
    assert!(serde_json::from_str::<InboundMessage>("not json").is_err());
}
