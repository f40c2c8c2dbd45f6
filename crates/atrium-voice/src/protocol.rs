//! Wire protocol for the realtime speech session.
//!
//! JSON-framed control/event messages exchanged over the persistent
//! WebSocket, with audio carried as base64 PCM16 payloads inside them.
//! Unknown inbound kinds map to [`ServerEvent::Unknown`] and are logged by
//! the transport instead of failing the stream.

use serde::{Deserialize, Serialize};

/// Turn-detection parameters negotiated in `session.update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub create_response: bool,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 200,
            create_response: false,
        }
    }
}

/// Session configuration sent immediately after the socket opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub input_audio_format: String,
    pub turn_detection: TurnDetection,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            input_audio_format: "pcm16".to_string(),
            turn_detection: TurnDetection::default(),
        }
    }
}

/// One content part of a conversation item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

impl ContentPart {
    pub fn input_text(text: impl Into<String>) -> Self {
        Self {
            kind: "input_text".to_string(),
            text: Some(text.into()),
            transcript: None,
        }
    }
}

/// A conversation item, outbound (user text) or inbound (created items,
/// response output items).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
}

impl ConversationItem {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: "message".to_string(),
            role: Some("user".to_string()),
            content: Some(vec![ContentPart::input_text(text)]),
        }
    }

    /// Extract displayable content the way the UI consumes it: the text of
    /// the first part, or the transcript of an audio part. The flag reports
    /// whether the part was audio.
    pub fn display_text(&self) -> Option<(String, bool)> {
        let parts = self.content.as_ref()?;
        let part = parts.first()?;
        match part.kind.as_str() {
            "text" | "input_text" => part.text.clone().map(|t| (t, false)),
            "audio" | "input_audio" => part
                .transcript
                .clone()
                .or_else(|| Some("Assistant audio".to_string()))
                .map(|t| (t, true)),
            _ => None,
        }
    }
}

/// Response request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRequest {
    pub modalities: Vec<String>,
}

impl ResponseRequest {
    pub fn text_only() -> Self {
        Self {
            modalities: vec!["text".to_string()],
        }
    }

    pub fn with_audio() -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
        }
    }
}

/// Events emitted to the remote endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseRequest },
}

/// Completed-response payload carried by `response.done`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponsePayload {
    pub output: Option<Vec<ConversationItem>>,
    pub status: Option<String>,
}

/// Remote error payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub message: Option<String>,
}

/// Events received from the remote endpoint, dispatched by kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "input_audio_buffer.committed")]
    Committed,
    #[serde(rename = "conversation.item.created")]
    ItemCreated { item: Option<ConversationItem> },
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        delta: Option<String>,
        item_id: Option<String>,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        transcript: Option<String>,
        item_id: Option<String>,
    },
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { item: Option<ConversationItem> },
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        delta: Option<String>,
        item_id: Option<String>,
    },
    #[serde(rename = "response.audio.done")]
    AudioDone,
    #[serde(rename = "response.done")]
    ResponseDone { response: Option<ResponsePayload> },
    #[serde(rename = "error")]
    Error { error: Option<ErrorPayload> },
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_carry_wire_type_tags() {
        let append = serde_json::to_value(ClientEvent::InputAudioBufferAppend {
            audio: "AAAA".to_string(),
        })
        .unwrap();
        assert_eq!(append["type"], "input_audio_buffer.append");
        assert_eq!(append["audio"], "AAAA");

        let update = serde_json::to_value(ClientEvent::SessionUpdate {
            session: SessionSettings::default(),
        })
        .unwrap();
        assert_eq!(update["type"], "session.update");
        assert_eq!(update["session"]["input_audio_format"], "pcm16");
        assert_eq!(update["session"]["turn_detection"]["type"], "server_vad");

        let clear = serde_json::to_value(ClientEvent::InputAudioBufferClear).unwrap();
        assert_eq!(clear["type"], "input_audio_buffer.clear");
    }

    #[test]
    fn user_text_item_matches_wire_shape() {
        let event = serde_json::to_value(ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text("hello"),
        })
        .unwrap();
        assert_eq!(event["type"], "conversation.item.create");
        assert_eq!(event["item"]["role"], "user");
        assert_eq!(event["item"]["content"][0]["type"], "input_text");
        assert_eq!(event["item"]["content"][0]["text"], "hello");
    }

    #[test]
    fn transcription_events_deserialize() {
        let delta: ServerEvent = serde_json::from_str(
            r#"{"type":"conversation.item.input_audio_transcription.delta",
                "delta":"hel","item_id":"item_1","content_index":0}"#,
        )
        .unwrap();
        match delta {
            ServerEvent::TranscriptionDelta { delta, item_id } => {
                assert_eq!(delta.as_deref(), Some("hel"));
                assert_eq!(item_id.as_deref(), Some("item_1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let completed: ServerEvent = serde_json::from_str(
            r#"{"type":"conversation.item.input_audio_transcription.completed",
                "transcript":"hello there","item_id":"item_1"}"#,
        )
        .unwrap();
        assert!(matches!(
            completed,
            ServerEvent::TranscriptionCompleted { .. }
        ));
    }

    #[test]
    fn audio_delta_deserializes() {
        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"response.audio.delta","delta":"UE9N","item_id":"i"}"#,
        )
        .unwrap();
        match event {
            ServerEvent::AudioDelta { delta, .. } => {
                assert_eq!(delta.as_deref(), Some("UE9N"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn response_done_extracts_output_transcript() {
        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"response.done","response":{"status":"completed","output":[
                {"id":"msg_1","type":"message","role":"assistant",
                 "content":[{"type":"audio","transcript":"certainly"}]}]}}"#,
        )
        .unwrap();

        let ServerEvent::ResponseDone { response } = event else {
            panic!("expected response.done");
        };
        let output = response.unwrap().output.unwrap();
        let (text, is_audio) = output[0].display_text().unwrap();
        assert_eq!(text, "certainly");
        assert!(is_audio);
    }

    #[test]
    fn unit_events_tolerate_extra_fields() {
        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"input_audio_buffer.speech_started","event_id":"ev_1","audio_start_ms":120}"#,
        )
        .unwrap();
        assert!(matches!(event, ServerEvent::SpeechStarted));
    }

    #[test]
    fn unknown_kinds_do_not_fail_the_stream() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert!(matches!(event, ServerEvent::Unknown));
    }
}
