//! Voice adapter contract.
//!
//! Transport internals (audio streaming) belong to the voice collaborator;
//! this adapter owns the contract: control messages carry identity, audio
//! arrives as stream handles, transcription and synthesis go through the tool
//! protocol, and prosody markers are honoured on egress.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::envelope::{Channel, InputPart, RequestEnvelope, Scope};
use crate::graph::RunContext;
use crate::state::PipelineState;
use crate::tool::{ToolCall, ToolError};

use super::markup::strip_prosody_markers;
use super::{final_response, response_error_kind};

/// Control message opening a voice session.
#[derive(Clone, Debug, Deserialize)]
pub struct VoiceControl {
    pub tenant: String,
    pub actor: String,
    pub session_id: String,
}

/// One synthesized reply turn.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct VoiceTurn {
    pub request_id: String,
    /// Egress audio handle from the synthesis tool.
    pub audio_handle: Option<String>,
    /// Marker-free text for caption display.
    pub transcript: String,
}

pub struct VoiceAdapter;

impl VoiceAdapter {
    /// Builds the envelope for one inbound audio turn. Transcription happens
    /// inside `io_in` via the speech tool.
    pub fn ingress(control: &VoiceControl, audio_handle: impl Into<String>) -> RequestEnvelope {
        RequestEnvelope::new(
            Scope::tenant(control.tenant.clone()),
            control.actor.clone(),
            Channel::Voice,
            vec![InputPart::AudioStream {
                handle: audio_handle.into(),
            }],
        )
        .with_session_id(control.session_id.clone())
    }

    /// Synthesises the final response to audio. Markers stay in the synthesis
    /// input (the speech tool honours them) and are stripped from the caption.
    pub async fn egress(
        state: &PipelineState,
        ctx: &RunContext,
    ) -> Result<VoiceTurn, ToolError> {
        let request_id = ctx.request_id().to_string();
        let response = final_response(state, &request_id);

        let spoken_text = response
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| match response_error_kind(&response) {
                Some(_) => response
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Sorry, that request failed.")
                    .to_string(),
                None => response.to_string(),
            });

        let mut call = ToolCall::new(
            &request_id,
            ctx.tenant(),
            &ctx.envelope.actor,
            "speech.synthesize",
            json!({ "text": spoken_text }),
        );
        if let Some(deadline) = ctx.envelope.deadline {
            call = call.with_deadline(deadline);
        }
        let synthesis = ctx.resources.tools.invoke(&call, &ctx.cancel).await?;

        Ok(VoiceTurn {
            request_id,
            audio_handle: synthesis
                .get("handle")
                .and_then(Value::as_str)
                .map(str::to_string),
            transcript: strip_prosody_markers(&spoken_text),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Voice ingress carries identity from the control message
    /// and the audio handle as the input part.
    #[test]
    fn ingress_from_control() {
        let control = VoiceControl {
            tenant: "acme".into(),
            actor: "caller-7".into(),
            session_id: "call-42".into(),
        };
        let envelope = VoiceAdapter::ingress(&control, "audio://in/1");
        assert_eq!(envelope.channel, Channel::Voice);
        assert_eq!(envelope.scope.tenant, "acme");
        assert_eq!(envelope.session_key(), "call-42");
        assert_eq!(
            envelope.input,
            vec![InputPart::AudioStream {
                handle: "audio://in/1".into()
            }]
        );
    }
}
