//! Command requests and replies.
//!
//! Commands are length-prefixed BSON documents on the reliable stream.
//! Requests always carry `00type = 1`, the target `service`, one command
//! subdocument under `cmd` and a `user-data` transaction id the backend
//! echoes back; replies carry `result`, an optional `error_message` and the
//! command's payload under `data`.

use bson::{Bson, Document};
use servolink_wire::ResponseCode;

use crate::error::Error;

/// Smallest possible BSON document on the stream.
pub(crate) const MIN_DOCUMENT_SIZE: usize = 5;

/// Upper bound for one stream document; anything larger is framing loss.
pub(crate) const MAX_DOCUMENT_SIZE: usize = 1 << 20;

/// How a command failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The command never reached the backend or the session went away
    /// before a reply arrived.
    Local(Error),
    /// The backend replied with a failure code.
    Backend {
        code: ResponseCode,
        message: String,
    },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Local(e) => write!(f, "{e}"),
            CommandError::Backend { code, message } if message.is_empty() => {
                write!(f, "backend error: {code}")
            }
            CommandError::Backend { code, message } => {
                write!(f, "backend error: {code}: {message}")
            }
        }
    }
}

impl std::error::Error for CommandError {}

/// Successful replies carry the command's payload document, when any.
pub type CommandResult = std::result::Result<Option<Document>, CommandError>;

/// Builder for one command request.
///
/// Add argument fields through [`body_mut`](CommandRequest::body_mut), then
/// hand the request to `Session::async_command` or
/// `Session::blocking_command`.
pub struct CommandRequest {
    service: String,
    command: String,
    body: Document,
}

impl CommandRequest {
    pub fn new(service: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            command: command.into(),
            body: Document::new(),
        }
    }

    /// Start from an existing body document.
    pub fn with_body(
        service: impl Into<String>,
        command: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            service: service.into(),
            command: command.into(),
            body,
        }
    }

    /// The command's argument document.
    pub fn body_mut(&mut self) -> &mut Document {
        &mut self.body
    }

    /// Shorthand for inserting one argument field.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.body.insert(key, value);
        self
    }

    /// Serialize the request with its transaction id.
    pub(crate) fn finalize(self, cmd_id: i32) -> Vec<u8> {
        let mut cmd = Document::new();
        cmd.insert(self.command, self.body);

        let mut packet = Document::new();
        packet.insert("00type", 1i32);
        packet.insert("service", self.service);
        packet.insert("cmd", cmd);
        packet.insert("user-data", cmd_id);

        let mut out = Vec::with_capacity(128);
        packet
            .to_writer(&mut out)
            .expect("writing BSON to a Vec cannot fail");
        out
    }
}

/// One reply pulled off the stream.
#[derive(Debug)]
pub(crate) struct ParsedReply {
    pub user_data: i32,
    pub result: CommandResult,
}

/// Interpret one stream document as a command reply.
///
/// Returns `None` for documents that are not command replies (unknown
/// `00type`) or that carry no transaction id; those are logged and dropped
/// by the caller.
pub(crate) fn parse_reply(doc: &Document) -> Option<ParsedReply> {
    if doc.get_i32("00type").ok()? != 1 {
        return None;
    }
    let user_data = doc.get_i32("user-data").ok()?;

    let code = ResponseCode::from_raw(doc.get_i32("result").unwrap_or(-1));
    if !code.is_ok() {
        return Some(ParsedReply {
            user_data,
            result: Err(CommandError::Backend {
                code,
                message: doc.get_str("error_message").unwrap_or("").to_string(),
            }),
        });
    }

    // The payload is the single subdocument of "data", keyed by the
    // command name.
    let payload = doc.get_document("data").ok().and_then(|data| {
        data.iter().find_map(|(_, value)| match value {
            Bson::Document(inner) => Some(inner.clone()),
            _ => None,
        })
    });

    Some(ParsedReply {
        user_data,
        result: Ok(payload),
    })
}

/// Extract the payload of a named command from a success reply document,
/// used by the synchronous registration path.
pub(crate) fn reply_payload_for<'d>(doc: &'d Document, command: &str) -> Option<&'d Document> {
    doc.get_document("data").ok()?.get_document(command).ok()
}

/// Pull every complete document off the front of `buf`.
///
/// Leaves partial data in place for the next read. Returns `Err(())` on
/// framing loss (a size field that cannot be valid), after which the stream
/// cannot be resynchronized.
pub(crate) fn drain_documents(buf: &mut Vec<u8>) -> std::result::Result<Vec<Document>, ()> {
    let mut docs = Vec::new();
    let mut offset = 0usize;

    while buf.len() - offset >= MIN_DOCUMENT_SIZE {
        let size = i32::from_le_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ]);
        if size < MIN_DOCUMENT_SIZE as i32 || size as usize > MAX_DOCUMENT_SIZE {
            return Err(());
        }
        let size = size as usize;
        if size > buf.len() - offset {
            break;
        }

        match Document::from_reader(&mut &buf[offset..offset + size]) {
            Ok(doc) => docs.push(doc),
            Err(e) => {
                // One malformed document; framing is still intact.
                tracing::warn!("dropping malformed stream document: {e}");
            }
        }
        offset += size;
    }

    if offset > 0 {
        buf.drain(..offset);
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn finalize_produces_canonical_field_order() {
        let request = CommandRequest::new("ffb", "configure_pipeline")
            .arg("device_session_id", 3i32)
            .arg("offset_mode", "torque");
        let bytes = request.finalize(17);
        let doc = Document::from_reader(&mut &bytes[..]).unwrap();

        let keys: Vec<&str> = doc.keys().map(String::as_str).collect();
        assert_eq!(keys, ["00type", "service", "cmd", "user-data"]);
        assert_eq!(doc.get_i32("00type").unwrap(), 1);
        assert_eq!(doc.get_str("service").unwrap(), "ffb");
        assert_eq!(doc.get_i32("user-data").unwrap(), 17);

        let body = doc
            .get_document("cmd")
            .unwrap()
            .get_document("configure_pipeline")
            .unwrap();
        assert_eq!(body.get_i32("device_session_id").unwrap(), 3);
        assert_eq!(body.get_str("offset_mode").unwrap(), "torque");
    }

    #[test]
    fn parse_reply_success_extracts_payload() {
        let reply = doc! {
            "00type": 1i32,
            "service": "ffb",
            "result": 0i32,
            "data": { "configure_pipeline": { "pipeline_id": 2i32 } },
            "user-data": 9i32,
        };
        let parsed = parse_reply(&reply).unwrap();
        assert_eq!(parsed.user_data, 9);
        let payload = parsed.result.unwrap().unwrap();
        assert_eq!(payload.get_i32("pipeline_id").unwrap(), 2);
    }

    #[test]
    fn parse_reply_failure_carries_code_and_message() {
        let reply = doc! {
            "00type": 1i32,
            "result": 6i32,
            "error_message": "not yours",
            "user-data": 4i32,
        };
        let parsed = parse_reply(&reply).unwrap();
        match parsed.result {
            Err(CommandError::Backend { code, message }) => {
                assert_eq!(code, ResponseCode::NoControl);
                assert_eq!(message, "not yours");
            }
            other => panic!("expected backend failure, got {other:?}"),
        }
    }

    #[test]
    fn parse_reply_ignores_unknown_types() {
        assert!(parse_reply(&doc! {"00type": 2i32, "user-data": 1i32}).is_none());
        assert!(parse_reply(&doc! {"result": 0i32}).is_none());
    }

    #[test]
    fn drain_documents_handles_partial_and_multiple_frames() {
        let mut wire = Vec::new();
        doc! {"a": 1i32}.to_writer(&mut wire).unwrap();
        doc! {"b": 2i32}.to_writer(&mut wire).unwrap();
        let second_start = {
            let mut first = Vec::new();
            doc! {"a": 1i32}.to_writer(&mut first).unwrap();
            first.len()
        };

        // Deliver everything except the last byte.
        let mut buf = wire[..wire.len() - 1].to_vec();
        let docs = drain_documents(&mut buf).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get_i32("a").unwrap(), 1);
        assert_eq!(buf.len(), wire.len() - second_start - 1);

        // Deliver the final byte.
        buf.push(*wire.last().unwrap());
        let docs = drain_documents(&mut buf).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get_i32("b").unwrap(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_documents_flags_framing_loss() {
        let mut buf = vec![0xff, 0xff, 0xff, 0xff, 0x00, 0x00];
        assert!(drain_documents(&mut buf).is_err());
    }

    #[test]
    fn drain_documents_skips_malformed_document_but_keeps_framing() {
        let mut buf = Vec::new();
        // A size-valid frame full of garbage.
        buf.extend_from_slice(&16i32.to_le_bytes());
        buf.extend_from_slice(&[0xee; 12]);
        doc! {"ok": true}.to_writer(&mut buf).unwrap();

        let docs = drain_documents(&mut buf).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get_bool("ok").unwrap(), true);
    }
}
