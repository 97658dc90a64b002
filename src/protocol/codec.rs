//! Frame Codec
//!
//! Length-delimited frames, each holding one JSON encoded [`Frame`].

use super::message::Frame;
use crate::error::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::LengthDelimitedCodec;

/// Upper bound for one frame; full syncs of large clusters are the biggest
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode_frame<M: Serialize>(frame: &Frame<M>) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(frame)?))
}

pub fn decode_frame<M: DeserializeOwned>(bytes: &[u8]) -> Result<Frame<M>> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::InvalidPayload(format!("undecodable frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClusterNode, NodeType, ResourceName};
    use crate::protocol::message::{Change, ControllerMessage, SatelliteMessage, UpdateEnvelope};
    use assert_matches::assert_matches;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_update_survives_framing() {
        let frame = Frame::oneway(ControllerMessage::Update(UpdateEnvelope {
            epoch: 3,
            sequence: 12,
            change: Change::ApplyNode(ClusterNode::new("node-a", NodeType::Satellite)),
        }));

        let mut codec = frame_codec();
        let mut buf = BytesMut::new();
        codec.encode(encode_frame(&frame).unwrap(), &mut buf).unwrap();

        let raw = codec.decode(&mut buf).unwrap().unwrap();
        let decoded: Frame<ControllerMessage> = decode_frame(&raw).unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_garbage_is_invalid_payload() {
        let result = decode_frame::<SatelliteMessage>(b"{\"kind\":\"oneway\"");
        assert_matches!(result, Err(Error::InvalidPayload(_)));
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let raw = br#"{"kind":"oneway","message":{"type":"format_disk","payload":null}}"#;
        assert!(decode_frame::<SatelliteMessage>(raw).is_err());

        let raw = br#"{"kind":"oneway","message":{"type":"resource_applied","payload":{"resource":"rsc-1"}}}"#;
        let frame = decode_frame::<SatelliteMessage>(raw).unwrap();
        assert_eq!(
            frame.message,
            SatelliteMessage::ResourceApplied {
                resource: ResourceName::new("rsc-1")
            }
        );
    }
}
