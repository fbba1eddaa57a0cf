use std::io::{BufRead, ErrorKind, Write};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::warn;

/// Version stamped into every outbound header.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Upper bounds on declared section sizes; a header asking for more is
/// treated as malformed rather than allocated.
const MAX_DATA_LENGTH: usize = 1 << 20;
const MAX_PAYLOAD_LENGTH: usize = 8 << 20;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The `data` section of a frame: JSON when it parses, raw bytes otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameData {
    Json(Value),
    Raw(Vec<u8>),
}

impl FrameData {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            FrameData::Json(value) => Some(value),
            FrameData::Raw(_) => None,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            FrameData::Json(value) => value.to_string().into_bytes(),
            FrameData::Raw(bytes) => bytes.clone(),
        }
    }
}

/// One framed event: a JSON header line, optional JSON data and an optional
/// binary payload, with section lengths declared in the header.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Map<String, Value>,
    pub data: Option<FrameData>,
    pub payload: Option<Vec<u8>>,
}

impl Frame {
    pub fn new(event_type: &str) -> Self {
        let mut header = Map::new();
        header.insert("type".to_string(), json!(event_type));
        header.insert("version".to_string(), json!(PROTOCOL_VERSION));
        Self {
            header,
            data: None,
            payload: None,
        }
    }

    pub fn with_data(event_type: &str, data: Value) -> Self {
        let mut frame = Self::new(event_type);
        frame.data = Some(FrameData::Json(data));
        frame
    }

    pub fn with_payload(event_type: &str, data: Value, payload: Vec<u8>) -> Self {
        let mut frame = Self::with_data(event_type, data);
        frame.payload = Some(payload);
        frame
    }

    pub fn event_type(&self) -> &str {
        self.header
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn data_json(&self) -> Option<&Value> {
        self.data.as_ref().and_then(FrameData::as_json)
    }
}

/// Read one frame. `Ok(None)` only when the stream closes cleanly before a
/// header line begins; a half-received header or short data/payload section
/// is `UnexpectedEof`.
pub fn read_frame<R: BufRead>(reader: &mut R) -> Result<Option<Frame>, ProtocolError> {
    let mut line = String::new();
    let n = match reader.read_line(&mut line) {
        Ok(n) => n,
        Err(err) if err.kind() == ErrorKind::InvalidData => {
            return Err(ProtocolError::Malformed("header is not UTF-8".to_string()));
        }
        Err(err) => return Err(err.into()),
    };
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        return Err(ProtocolError::UnexpectedEof);
    }

    let header: Map<String, Value> = serde_json::from_str(line.trim_end())
        .map_err(|err| ProtocolError::Malformed(format!("header: {err}")))?;

    match header.get("type").and_then(Value::as_str) {
        Some(event_type) if !event_type.is_empty() => {}
        _ => {
            return Err(ProtocolError::Malformed(
                "header is missing a non-empty type".to_string(),
            ))
        }
    }

    let data_length = length_field(&header, "data_length", MAX_DATA_LENGTH)?;
    let payload_length = length_field(&header, "payload_length", MAX_PAYLOAD_LENGTH)?;

    let data = if data_length > 0 {
        let bytes = read_section(reader, data_length)?;
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Some(FrameData::Json(value)),
            Err(err) => {
                warn!(error = %err, length = data_length, "frame data is not JSON, keeping raw bytes");
                Some(FrameData::Raw(bytes))
            }
        }
    } else {
        None
    };

    let payload = if payload_length > 0 {
        Some(read_section(reader, payload_length)?)
    } else {
        None
    };

    Ok(Some(Frame {
        header,
        data,
        payload,
    }))
}

/// Write one frame: header line, data bytes, payload bytes, flush. The
/// caller serializes writers per connection (see [`FrameWriter`]).
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError> {
    let mut header = frame.header.clone();
    header.insert("version".to_string(), json!(PROTOCOL_VERSION));

    let data_bytes = frame.data.as_ref().map(FrameData::to_bytes);
    match data_bytes.as_deref() {
        Some(bytes) if !bytes.is_empty() => {
            header.insert("data_length".to_string(), json!(bytes.len()));
        }
        _ => {
            header.remove("data_length");
        }
    }
    match frame.payload.as_deref() {
        Some(payload) if !payload.is_empty() => {
            header.insert("payload_length".to_string(), json!(payload.len()));
        }
        _ => {
            header.remove("payload_length");
        }
    }

    let line = serde_json::to_string(&Value::Object(header))
        .map_err(|err| ProtocolError::Malformed(format!("header encode: {err}")))?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    if let Some(bytes) = &data_bytes {
        writer.write_all(bytes)?;
    }
    if let Some(payload) = &frame.payload {
        writer.write_all(payload)?;
    }
    writer.flush()?;
    Ok(())
}

/// Serialized frame writer for one connection; frames never interleave.
pub struct FrameWriter<W: Write> {
    inner: Mutex<W>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    pub fn write(&self, frame: &Frame) -> Result<(), ProtocolError> {
        let mut writer = self.inner.lock().unwrap();
        write_frame(&mut *writer, frame)
    }
}

fn length_field(
    header: &Map<String, Value>,
    key: &str,
    max: usize,
) -> Result<usize, ProtocolError> {
    let Some(value) = header.get(key) else {
        return Ok(0);
    };
    let length = value
        .as_u64()
        .ok_or_else(|| ProtocolError::Malformed(format!("{key} must be a non-negative integer")))?
        as usize;
    if length > max {
        return Err(ProtocolError::Malformed(format!(
            "{key} {length} exceeds limit {max}"
        )));
    }
    Ok(length)
}

fn read_section<R: BufRead>(reader: &mut R, length: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = vec![0u8; length];
    reader.read_exact(&mut bytes).map_err(|err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            ProtocolError::UnexpectedEof
        } else {
            ProtocolError::Io(err)
        }
    })?;
    Ok(bytes)
}

/// PCM stream parameters carried by the audio events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub rate: u32,
    pub width: u16,
    pub channels: u16,
}

impl AudioFormat {
    /// Capture-side format: 16kHz mono signed 16-bit.
    pub fn capture() -> Self {
        Self {
            rate: crate::SAMPLE_RATE,
            width: 2,
            channels: 1,
        }
    }
}

/// Message types the satellite exchanges, typed over the header `type`.
/// Types outside the known set round-trip untouched as [`Event::Unknown`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Describe,
    Info(Value),
    Ping,
    Pong,
    AudioStart(AudioFormat),
    AudioChunk {
        format: Option<AudioFormat>,
        payload: Vec<u8>,
    },
    AudioStop,
    RunSatellite,
    PauseSatellite,
    Detect,
    Detection {
        name: Option<String>,
    },
    Transcribe,
    VoiceStarted,
    VoiceStopped,
    Played,
    Error {
        text: String,
    },
    Unknown(Frame),
}

impl Event {
    pub fn from_frame(frame: Frame) -> Result<Event, ProtocolError> {
        let event = match frame.event_type() {
            "describe" => Event::Describe,
            "info" => Event::Info(frame.data_json().cloned().unwrap_or(Value::Null)),
            "ping" => Event::Ping,
            "pong" => Event::Pong,
            "audio-start" => Event::AudioStart(parse_format(&frame)?),
            "audio-chunk" => Event::AudioChunk {
                format: frame
                    .data_json()
                    .map(|data| serde_json::from_value(data.clone()))
                    .transpose()
                    .ok()
                    .flatten(),
                payload: frame.payload.unwrap_or_default(),
            },
            "audio-stop" => Event::AudioStop,
            "run-satellite" => Event::RunSatellite,
            "pause-satellite" => Event::PauseSatellite,
            "detect" => Event::Detect,
            "detection" => Event::Detection {
                name: frame
                    .data_json()
                    .and_then(|data| data.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            "transcribe" => Event::Transcribe,
            "voice-started" => Event::VoiceStarted,
            "voice-stopped" => Event::VoiceStopped,
            "played" => Event::Played,
            "error" => Event::Error {
                text: frame
                    .data_json()
                    .and_then(|data| data.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => Event::Unknown(frame),
        };
        Ok(event)
    }

    pub fn to_frame(&self) -> Frame {
        match self {
            Event::Describe => Frame::new("describe"),
            Event::Info(data) => Frame::with_data("info", data.clone()),
            Event::Ping => Frame::new("ping"),
            Event::Pong => Frame::new("pong"),
            Event::AudioStart(format) => {
                Frame::with_data("audio-start", serde_json::to_value(format).unwrap_or(Value::Null))
            }
            Event::AudioChunk { format, payload } => {
                let mut frame = Frame::new("audio-chunk");
                if let Some(format) = format {
                    if let Ok(data) = serde_json::to_value(format) {
                        frame.data = Some(FrameData::Json(data));
                    }
                }
                frame.payload = Some(payload.clone());
                frame
            }
            Event::AudioStop => Frame::new("audio-stop"),
            Event::RunSatellite => Frame::new("run-satellite"),
            Event::PauseSatellite => Frame::new("pause-satellite"),
            Event::Detect => Frame::new("detect"),
            Event::Detection { name } => match name {
                Some(name) => Frame::with_data("detection", json!({ "name": name })),
                None => Frame::new("detection"),
            },
            Event::Transcribe => Frame::new("transcribe"),
            Event::VoiceStarted => Frame::new("voice-started"),
            Event::VoiceStopped => Frame::new("voice-stopped"),
            Event::Played => Frame::new("played"),
            Event::Error { text } => Frame::with_data("error", json!({ "text": text })),
            Event::Unknown(frame) => frame.clone(),
        }
    }
}

fn parse_format(frame: &Frame) -> Result<AudioFormat, ProtocolError> {
    let data = frame
        .data_json()
        .ok_or_else(|| ProtocolError::Malformed("audio-start is missing data".to_string()))?;
    serde_json::from_value(data.clone())
        .map_err(|err| ProtocolError::Malformed(format!("audio-start data: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(frame: &Frame) -> Frame {
        let mut wire = Vec::new();
        write_frame(&mut wire, frame).unwrap();
        read_frame(&mut Cursor::new(wire)).unwrap().unwrap()
    }

    #[test]
    fn test_round_trip_header_only() {
        let decoded = round_trip(&Frame::new("ping"));
        assert_eq!(decoded.event_type(), "ping");
        assert_eq!(decoded.header.get("version"), Some(&json!("1.0")));
        assert_eq!(decoded.data, None);
        assert_eq!(decoded.payload, None);
    }

    #[test]
    fn test_round_trip_data_and_payload() {
        let frame = Frame::with_payload(
            "audio-chunk",
            json!({"rate": 16000, "width": 2, "channels": 1}),
            vec![1, 2, 3, 4, 5],
        );
        let decoded = round_trip(&frame);
        assert_eq!(decoded.event_type(), "audio-chunk");
        assert_eq!(decoded.data, frame.data);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn test_version_rewritten_on_encode() {
        let mut frame = Frame::new("ping");
        frame
            .header
            .insert("version".to_string(), json!("0.9"));
        let decoded = round_trip(&frame);
        assert_eq!(decoded.header.get("version"), Some(&json!("1.0")));
    }

    #[test]
    fn test_clean_close_returns_none() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut empty).unwrap().is_none());
    }

    #[test]
    fn test_half_header_is_unexpected_eof() {
        let mut cursor = Cursor::new(b"{\"type\":\"pi".to_vec());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(ProtocolError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_short_data_is_unexpected_eof() {
        let mut wire = b"{\"type\":\"x\",\"version\":\"1.0\",\"data_length\":50}\n".to_vec();
        wire.extend_from_slice(b"{\"partial\":true}");
        assert!(matches!(
            read_frame(&mut Cursor::new(wire)),
            Err(ProtocolError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_garbage_header_is_malformed() {
        let mut cursor = Cursor::new(b"not json at all\n".to_vec());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_type_is_malformed() {
        let mut cursor = Cursor::new(b"{\"version\":\"1.0\"}\n".to_vec());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(ProtocolError::Malformed(_))
        ));

        let mut cursor = Cursor::new(b"{\"type\":\"\",\"version\":\"1.0\"}\n".to_vec());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_non_json_data_degrades_to_raw() {
        let mut wire = b"{\"type\":\"x\",\"version\":\"1.0\",\"data_length\":5}\n".to_vec();
        wire.extend_from_slice(b"ab\xffcd");
        let frame = read_frame(&mut Cursor::new(wire)).unwrap().unwrap();
        assert_eq!(frame.data, Some(FrameData::Raw(b"ab\xffcd".to_vec())));
    }

    #[test]
    fn test_byte_accounting_across_consecutive_frames() {
        // The second frame must start exactly data_length bytes after the
        // first header line.
        let first = Frame::with_data("audio-start", json!({"rate": 16000}));
        let second = Frame::new("ping");

        let mut wire = Vec::new();
        write_frame(&mut wire, &first).unwrap();
        let first_len = wire.len();
        write_frame(&mut wire, &second).unwrap();

        let mut cursor = Cursor::new(wire);
        let a = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(cursor.position() as usize, first_len);
        let b = read_frame(&mut cursor).unwrap().unwrap();

        assert_eq!(a.event_type(), "audio-start");
        assert_eq!(a.data_json().unwrap()["rate"], json!(16000));
        assert_eq!(a.payload, None);
        assert_eq!(b.event_type(), "ping");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_declared_length_matches_consumed_bytes() {
        let frame = Frame::with_payload("audio-chunk", json!({"rate": 16000}), vec![0u8; 64]);
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).unwrap();

        let header_line_len = wire.iter().position(|&b| b == b'\n').unwrap() + 1;
        let header: Map<String, Value> =
            serde_json::from_slice(&wire[..header_line_len - 1]).unwrap();
        let data_length = header["data_length"].as_u64().unwrap() as usize;
        let payload_length = header["payload_length"].as_u64().unwrap() as usize;
        assert_eq!(wire.len(), header_line_len + data_length + payload_length);
    }

    #[test]
    fn test_negative_length_is_malformed() {
        let mut cursor = Cursor::new(b"{\"type\":\"x\",\"version\":\"1.0\",\"data_length\":-4}\n".to_vec());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_event_round_trips_opaque() {
        let frame = Frame::with_data("future-event", json!({"field": [1, 2, 3]}));
        let event = Event::from_frame(frame.clone()).unwrap();
        assert!(matches!(event, Event::Unknown(_)));
        let re_encoded = round_trip(&event.to_frame());
        assert_eq!(re_encoded.event_type(), "future-event");
        assert_eq!(re_encoded.data, frame.data);
    }

    #[test]
    fn test_audio_start_requires_format() {
        let frame = Frame::new("audio-start");
        assert!(matches!(
            Event::from_frame(frame),
            Err(ProtocolError::Malformed(_))
        ));

        let frame = Frame::with_data(
            "audio-start",
            json!({"rate": 22050, "width": 2, "channels": 1}),
        );
        let event = Event::from_frame(frame).unwrap();
        assert_eq!(
            event,
            Event::AudioStart(AudioFormat {
                rate: 22050,
                width: 2,
                channels: 1
            })
        );
    }

    #[test]
    fn test_audio_chunk_keeps_binary_payload() {
        let pcm: Vec<u8> = (0..=255).collect();
        let frame = Frame::with_payload(
            "audio-chunk",
            json!({"rate": 16000, "width": 2, "channels": 1}),
            pcm.clone(),
        );
        match Event::from_frame(round_trip(&frame)).unwrap() {
            Event::AudioChunk { format, payload } => {
                assert_eq!(format, Some(AudioFormat::capture()));
                assert_eq!(payload, pcm);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_frame_writer_serializes_atomically() {
        let writer = FrameWriter::new(Vec::new());
        writer.write(&Frame::new("ping")).unwrap();
        writer.write(&Frame::new("pong")).unwrap();

        let wire = writer.inner.into_inner().unwrap();
        let mut cursor = Cursor::new(wire);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap().event_type(), "ping");
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap().event_type(), "pong");
    }
}
