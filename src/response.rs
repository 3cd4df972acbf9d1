//! Acknowledgment building and the response sender.
//!
//! Every received transmission gets a reply: acknowledgment construction
//! never surfaces an error to the handler. When the inbound message is
//! too malformed to address a proper ACK, a fallback AE acknowledgment
//! is built and sent instead.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::SinkExt;
use log::{debug, warn};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

use crate::codec::{MllpCodec, Transport};
use crate::config::MshOverride;
use crate::error::{Error, Result};
use crate::events::{emit, EventSender, InboundEvent};
use crate::hl7::{random_string, Message, MessageHeader, Version};

pub(crate) type MllpSink = SplitSink<Framed<Box<dyn Transport>, MllpCodec>, String>;
pub(crate) type SharedSink = Arc<Mutex<MllpSink>>;

/// MSA-1 acknowledgment codes.
///
/// `AA`/`AR`/`AE` are original-mode accept/reject/error; the `C*`
/// variants are their enhanced-mode commit counterparts, which only
/// exist from version 2.2 onward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckCode {
    /// Application Accept.
    AA,
    /// Application Reject.
    AR,
    /// Application Error.
    AE,
    /// Commit Accept.
    CA,
    /// Commit Reject.
    CR,
    /// Commit Error.
    CE,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::AA => "AA",
            AckCode::AR => "AR",
            AckCode::AE => "AE",
            AckCode::CA => "CA",
            AckCode::CR => "CR",
            AckCode::CE => "CE",
        }
    }

    /// Version 2.1 only defines the original-mode codes.
    fn valid_for(&self, version: Version) -> bool {
        match version {
            Version::V2_1 => matches!(self, AckCode::AA | AckCode::AR | AckCode::AE),
            _ => true,
        }
    }
}

impl std::fmt::Display for AckCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds and transmits the acknowledgment for one inbound message.
///
/// Bound to the connection the message arrived on; the built ACK stays
/// available through [`SendResponse::ack_message`] after sending.
pub struct SendResponse {
    sink: SharedSink,
    message: Message,
    msh_overrides: Arc<Vec<(String, MshOverride)>>,
    peer: SocketAddr,
    events: EventSender,
    ack: Option<Message>,
}

impl SendResponse {
    pub(crate) fn new(
        sink: SharedSink,
        message: Message,
        msh_overrides: Arc<Vec<(String, MshOverride)>>,
        peer: SocketAddr,
        events: EventSender,
    ) -> Self {
        SendResponse {
            sink,
            message,
            msh_overrides,
            peer,
            events,
            ack: None,
        }
    }

    /// Build the acknowledgment for `code` and write it back on the
    /// originating connection.
    ///
    /// If an ACK can't be built from the inbound message (unsupported
    /// version, malformed header, or a code the version doesn't allow),
    /// a fallback AE acknowledgment is sent instead; the error is never
    /// surfaced here. A peer that already disconnected is also not an
    /// error: the write is skipped and the built ACK kept.
    pub async fn send_response(&mut self, code: AckCode) -> Result<()> {
        let ack = match create_ack_message(&self.message, code, &self.msh_overrides) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("falling back to AE acknowledgment: {}", e);
                create_ae_ack_message()
            }
        };
        let text = ack.to_string();
        self.ack = Some(ack);

        {
            let mut sink = self.sink.lock().await;
            match sink.send(text).await {
                Ok(()) => {}
                Err(e) if is_disconnect(&e) => {
                    debug!("peer {} went away before the response: {}", self.peer, e);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        emit(&self.events, InboundEvent::ResponseSent { peer: self.peer });
        Ok(())
    }

    /// The acknowledgment built by the last [`SendResponse::send_response`]
    /// call, literal or fallback. `None` before any build.
    pub fn ack_message(&self) -> Option<&Message> {
        self.ack.as_ref()
    }
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
    )
}

/// Build an ACK addressed back to the sender of `message`.
///
/// The ACK reuses the inbound protocol version, swaps the sending and
/// receiving application/facility pairs, echoes the processing ID and
/// control ID, and carries `code` in MSA-1. Overrides are applied after
/// the defaults, in declaration order.
pub(crate) fn create_ack_message(
    message: &Message,
    code: AckCode,
    msh_overrides: &[(String, MshOverride)],
) -> Result<Message> {
    let version = message.version()?;
    if !code.valid_for(version) {
        return Err(Error::Hl7(format!(
            "invalid MSA-1 value: {} for HL7 version {}",
            code, version
        )));
    }

    let mut ack = Message::new(
        version,
        MessageHeader {
            msh_9_1: "ACK".to_string(),
            msh_9_2: message.get("MSH.9.2"),
            msh_9_3: None,
            msh_10: "ACK".to_string(),
            msh_11_1: message.get("MSH.11.1"),
        },
    );

    // reply goes back the way the message came
    ack.set("MSH.3", &message.get("MSH.5"));
    ack.set("MSH.4", &message.get("MSH.6"));
    ack.set("MSH.5", &message.get("MSH.3"));
    ack.set("MSH.6", &message.get("MSH.4"));
    ack.set("MSH.12", &message.get("MSH.12"));

    for (path, value) in msh_overrides {
        let resolved = value.resolve(message);
        ack.set(&format!("MSH.{}", path), &resolved);
    }

    let control_id = message.get("MSH.10");
    let segment = ack.add_segment("MSA");
    segment.set_field(1, code.as_str());
    segment.set_field(2, &control_id);

    Ok(ack)
}

/// The guaranteed fallback: a minimal AE acknowledgment that can always
/// be built, whatever state the inbound message was in.
///
/// No trigger event is defined for acknowledging an unusable message,
/// so Z99 from the unassigned extension space stands in. The sending
/// and receiving fields are left blank for the application to fill via
/// overrides, and the echoed control ID is freshly generated because
/// the original may be unrecoverable.
pub(crate) fn create_ae_ack_message() -> Message {
    let mut ack = Message::new(
        Version::V2_7,
        MessageHeader {
            msh_9_1: "ACK".to_string(),
            msh_9_2: "Z99".to_string(),
            msh_9_3: Some("ACK".to_string()),
            msh_10: "ACK".to_string(),
            msh_11_1: "P".to_string(),
        },
    );

    ack.set("MSH.3", "");
    ack.set("MSH.4", "");

    let segment = ack.add_segment("MSA");
    segment.set_field(1, AckCode::AE.as_str());
    segment.set_field(2, &random_string());

    ack
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncReadExt;
    use tokio::sync::broadcast;

    const ADT_2_5: &str =
        "MSH|^~\\&|SndApp|SndFac|RcvApp|RcvFac|20240101||ADT^A01|CTRL-77|P|2.5\rEVN|A01";
    const ADT_2_1: &str =
        "MSH|^~\\&|SndApp|SndFac|RcvApp|RcvFac|20240101||ADT^A01|CTRL-21|P|2.1";

    fn inbound(text: &str) -> Message {
        Message::parse(text).unwrap()
    }

    #[test]
    fn ack_swaps_facilities_and_applications() {
        let ack = create_ack_message(&inbound(ADT_2_5), AckCode::AA, &[]).unwrap();

        assert_eq!(ack.get("MSH.3"), "RcvApp");
        assert_eq!(ack.get("MSH.4"), "RcvFac");
        assert_eq!(ack.get("MSH.5"), "SndApp");
        assert_eq!(ack.get("MSH.6"), "SndFac");
    }

    #[test]
    fn ack_echoes_version_event_processing_and_control_id() {
        let ack = create_ack_message(&inbound(ADT_2_5), AckCode::AA, &[]).unwrap();

        assert_eq!(ack.get("MSH.9.1"), "ACK");
        assert_eq!(ack.get("MSH.9.2"), "A01");
        assert_eq!(ack.get("MSH.11.1"), "P");
        assert_eq!(ack.get("MSH.12"), "2.5");
        assert_eq!(ack.get("MSA.1"), "AA");
        assert_eq!(ack.get("MSA.2"), "CTRL-77");
    }

    #[test]
    fn commit_codes_are_rejected_for_2_1() {
        assert!(create_ack_message(&inbound(ADT_2_1), AckCode::CA, &[]).is_err());
        assert!(create_ack_message(&inbound(ADT_2_1), AckCode::AA, &[]).is_ok());
    }

    #[test]
    fn commit_codes_are_accepted_for_2_5() {
        let ack = create_ack_message(&inbound(ADT_2_5), AckCode::CA, &[]).unwrap();
        assert_eq!(ack.get("MSA.1"), "CA");
        assert_eq!(ack.get("MSA.2"), "CTRL-77");
    }

    #[test]
    fn unknown_version_fails_the_build() {
        let msg = inbound("MSH|^~\\&|A|B|C|D|||ADT^A01|X|P|9.9");
        assert!(create_ack_message(&msg, AckCode::AA, &[]).is_err());
    }

    #[test]
    fn overrides_apply_after_defaults_and_later_wins() {
        let overrides = vec![
            ("4".to_string(), MshOverride::Value("FIRST".to_string())),
            ("4".to_string(), MshOverride::Value("SECOND".to_string())),
            (
                "6".to_string(),
                MshOverride::Derive(Arc::new(|m: &Message| m.get("MSH.10"))),
            ),
        ];
        let ack = create_ack_message(&inbound(ADT_2_5), AckCode::AA, &overrides).unwrap();

        assert_eq!(ack.get("MSH.4"), "SECOND");
        assert_eq!(ack.get("MSH.6"), "CTRL-77");
    }

    #[test]
    fn fallback_is_a_sendable_ae_ack() {
        let ack = create_ae_ack_message();

        assert_eq!(ack.get("MSH.9.1"), "ACK");
        assert_eq!(ack.get("MSH.9.2"), "Z99");
        assert_eq!(ack.get("MSH.9.3"), "ACK");
        assert_eq!(ack.get("MSH.11.1"), "P");
        assert_eq!(ack.get("MSA.1"), "AE");
        assert!(!ack.get("MSA.2").is_empty());

        // the generated control ID must be fresh every time
        assert_ne!(ack.get("MSA.2"), create_ae_ack_message().get("MSA.2"));
    }

    fn response_over(
        stream: tokio::io::DuplexStream,
        message: Message,
        overrides: Vec<(String, MshOverride)>,
    ) -> SendResponse {
        let framed = Framed::new(Box::new(stream) as Box<dyn Transport>, MllpCodec::new());
        let (sink, _stream) = framed.split();
        let (events, _) = broadcast::channel(8);
        SendResponse::new(
            Arc::new(Mutex::new(sink)),
            message,
            Arc::new(overrides),
            "127.0.0.1:0".parse().unwrap(),
            events,
        )
    }

    #[tokio::test]
    async fn send_response_frames_the_ack() {
        let (server_side, mut client_side) = tokio::io::duplex(1024);
        let mut res = response_over(server_side, inbound(ADT_2_5), Vec::new());

        res.send_response(AckCode::AA).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let n = client_side.read(&mut buf).await.unwrap();
        let frame = &buf[..n];

        assert_eq!(frame[0], MllpCodec::BLOCK_HEADER);
        assert_eq!(frame[n - 2], MllpCodec::BLOCK_END);
        assert_eq!(frame[n - 1], MllpCodec::BLOCK_FOOTER);
        let text = String::from_utf8_lossy(&frame[1..n - 2]);
        assert!(text.contains("MSA|AA|CTRL-77"));

        let ack = res.ack_message().unwrap();
        assert_eq!(ack.get("MSA.1"), "AA");
    }

    #[tokio::test]
    async fn invalid_code_sends_the_fallback() {
        let (server_side, mut client_side) = tokio::io::duplex(1024);
        let mut res = response_over(server_side, inbound(ADT_2_1), Vec::new());

        res.send_response(AckCode::CA).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let n = client_side.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(text.contains("MSA|AE|"));
        assert!(text.contains("ACK^Z99^ACK"));

        let ack = res.ack_message().unwrap();
        assert_eq!(ack.get("MSA.1"), "AE");
        assert_ne!(ack.get("MSA.2"), "CTRL-21");
    }

    #[tokio::test]
    async fn disconnected_peer_is_not_an_error() {
        let (server_side, client_side) = tokio::io::duplex(64);
        drop(client_side);
        let mut res = response_over(server_side, inbound(ADT_2_5), Vec::new());

        res.send_response(AckCode::AA).await.unwrap();
        assert!(res.ack_message().is_some());
    }
}
