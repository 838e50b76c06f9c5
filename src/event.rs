//! Change events and their wire format.
//!
//! The watch stream is a sequence of JSON documents, normally one per line:
//!
//! ```text
//! {"type":"ADDED","object":{"metadata":{"resourceVersion":"123"},"subsets":[...]}}
//! ```
//!
//! Frames are split off the byte stream incrementally and then decoded into a
//! typed [`ChangeEvent`] according to their `type`.

use bytes::{Buf, BytesMut};
use k8s_openapi::api::core::v1::Endpoints;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::WatchError;

/// The remote logical clock of an `Endpoints` resource.
pub type ResourceVersion = u64;

/// The unit delivered from the stream watcher to the resolver.
pub type ChangeResult = Result<ChangeEvent, WatchError>;

/// A single notification about the watched resource.
///
/// The full resource body is attached to every change.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent {
    /// The resource was created (or first observed).
    Added(Endpoints),
    /// The resource changed.
    Modified(Endpoints),
    /// The resource was deleted.
    Deleted(Endpoints),
    /// The server reported an error on the watch.
    Error(RemoteStatus),
}

impl ChangeEvent {
    /// Decodes the object of a raw frame according to its `type`.
    pub(crate) fn from_frame(frame: Frame) -> Result<Self, WatchError> {
        let object_error = |source: serde_json::Error| WatchError::Object {
            event_type: frame.event_type.clone(),
            source,
        };

        match frame.event_type.as_str() {
            "ADDED" => Ok(Self::Added(
                serde_json::from_value(frame.object).map_err(object_error)?,
            )),
            "MODIFIED" => Ok(Self::Modified(
                serde_json::from_value(frame.object).map_err(object_error)?,
            )),
            "DELETED" => Ok(Self::Deleted(
                serde_json::from_value(frame.object).map_err(object_error)?,
            )),
            "ERROR" => Ok(Self::Error(
                serde_json::from_value(frame.object).map_err(object_error)?,
            )),
            other => Err(WatchError::InvalidEventType(other.to_string())),
        }
    }

    /// The raw `metadata.resourceVersion` of the attached object.
    #[must_use]
    pub fn raw_resource_version(&self) -> &str {
        let version = match self {
            Self::Added(ep) | Self::Modified(ep) | Self::Deleted(ep) => {
                ep.metadata.resource_version.as_deref()
            }
            Self::Error(status) => status.metadata.resource_version.as_deref(),
        };

        version.unwrap_or_default()
    }

    /// Parses the resource version of the attached object.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::ResourceVersion`] if the value is not a decimal integer.
    pub fn resource_version(&self) -> Result<ResourceVersion, WatchError> {
        parse_resource_version(self.raw_resource_version())
    }
}

/// Parses a decimal resource version string.
pub(crate) fn parse_resource_version(value: &str) -> Result<ResourceVersion, WatchError> {
    value
        .parse()
        .map_err(|source| WatchError::ResourceVersion {
            value: value.to_string(),
            source,
        })
}

/// The object attached to an `ERROR` watch event (a `meta/v1` `Status`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteStatus {
    /// Status metadata.
    pub metadata: StatusMeta,
    /// Suggested HTTP return code.
    pub code: Option<i32>,
    /// Machine-readable reason, e.g. `Expired`.
    pub reason: Option<String>,
    /// Human-readable description.
    pub message: Option<String>,
}

/// List metadata of a [`RemoteStatus`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatusMeta {
    /// Resource version, usually absent on errors.
    pub resource_version: Option<String>,
}

/// One undecoded watch document.
#[derive(Debug, Deserialize)]
pub(crate) struct Frame {
    #[serde(rename = "type", default)]
    pub(crate) event_type: String,
    #[serde(default)]
    pub(crate) object: serde_json::Value,
}

/// Incremental frame reader over a byte stream.
pub(crate) struct EventDecoder<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> EventDecoder<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Reads the next frame, blocking on the connection as needed.
    ///
    /// Any error is terminal for the stream.
    pub(crate) async fn next_frame(&mut self) -> Result<Frame, WatchError> {
        loop {
            if let Some(frame) = self.try_decode()? {
                return Ok(frame);
            }

            let read = self
                .reader
                .read_buf(&mut self.buf)
                .await
                .map_err(WatchError::Io)?;

            if read == 0 {
                return Err(if self.buf.iter().all(u8::is_ascii_whitespace) {
                    WatchError::EndOfStream
                } else {
                    WatchError::UnexpectedEndOfStream
                });
            }
        }
    }

    fn try_decode(&mut self) -> Result<Option<Frame>, WatchError> {
        let (next, consumed) = {
            let mut frames = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Frame>();
            let next = frames.next();
            (next, frames.byte_offset())
        };

        match next {
            Some(Ok(frame)) => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            // Incomplete document; wait for more bytes.
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(WatchError::Decode(e)),
            None => {
                self.buf.clear();
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn endpoints(version: &str) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "1.2.3.4".to_string(),
                    ..Default::default()
                }]),
                ports: Some(vec![EndpointPort {
                    port: 8080,
                    name: Some("noName".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        }
    }

    fn frame(json: &str) -> Frame {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn decodes_added_event() {
        let object = serde_json::to_value(endpoints("123")).unwrap();
        let event = ChangeEvent::from_frame(Frame {
            event_type: "ADDED".to_string(),
            object,
        })
        .unwrap();

        assert_eq!(event, ChangeEvent::Added(endpoints("123")));
        assert_eq!(event.resource_version().unwrap(), 123);
    }

    #[test]
    fn decodes_error_event_status() {
        let status = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "too old resource version: 1 (2)",
            "reason": "Expired",
            "code": 410,
        });
        let raw = serde_json::json!({ "type": "ERROR", "object": status }).to_string();
        let event = ChangeEvent::from_frame(frame(&raw)).unwrap();

        let ChangeEvent::Error(status) = &event else {
            panic!("expected error event, got {event:?}");
        };
        assert_eq!(status.code, Some(410));
        assert_eq!(status.reason.as_deref(), Some("Expired"));
        assert!(event.resource_version().is_err());
    }

    #[test]
    fn rejects_unknown_event_type() {
        let err = ChangeEvent::from_frame(frame(r#"{"type":"not-supported"}"#)).unwrap_err();
        assert!(matches!(err, WatchError::InvalidEventType(t) if t == "not-supported"));
    }

    #[test]
    fn missing_type_is_an_invalid_event_type() {
        let err = ChangeEvent::from_frame(frame(r#"{"object":{}}"#)).unwrap_err();
        assert!(matches!(err, WatchError::InvalidEventType(ref t) if t.is_empty()), "{err}");
    }

    #[test]
    fn rejects_missing_object() {
        let err = ChangeEvent::from_frame(frame(r#"{"type":"MODIFIED"}"#)).unwrap_err();
        assert!(
            matches!(err, WatchError::Object { ref event_type, .. } if event_type == "MODIFIED")
        );
    }

    #[test]
    fn unparsable_resource_version() {
        let event = ChangeEvent::Added(endpoints("12a"));
        let err = event.resource_version().unwrap_err();
        assert!(matches!(err, WatchError::ResourceVersion { ref value, .. } if value == "12a"));
    }

    #[tokio::test]
    async fn decoder_handles_split_and_concatenated_frames() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut decoder = EventDecoder::new(rx);

        tx.write_all(br#"{"type":"ADD"#).await.unwrap();
        tx.write_all(br#"ED"}{"type":"DELETED"}"#).await.unwrap();
        tx.write_all(b"\n").await.unwrap();
        drop(tx);

        assert_eq!(decoder.next_frame().await.unwrap().event_type, "ADDED");
        assert_eq!(decoder.next_frame().await.unwrap().event_type, "DELETED");
        assert!(matches!(decoder.next_frame().await, Err(WatchError::EndOfStream)));
    }

    #[tokio::test]
    async fn decoder_reports_unexpected_eof() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut decoder = EventDecoder::new(rx);

        tx.write_all(br#"{"type":"ADDED","obj"#).await.unwrap();
        drop(tx);

        assert!(matches!(
            decoder.next_frame().await,
            Err(WatchError::UnexpectedEndOfStream)
        ));
    }

    #[tokio::test]
    async fn decoder_reports_malformed_json() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut decoder = EventDecoder::new(rx);

        tx.write_all(br#"{{{{ "temp-err": true}"#).await.unwrap();

        assert!(matches!(decoder.next_frame().await, Err(WatchError::Decode(_))));
    }
}
