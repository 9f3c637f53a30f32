//! The structured, newline-terminated wire message and its typed parameters.
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Current value written by [`Message::add_version_parameter`] and checked
/// by [`Message::check_version_parameter`].
pub const MESSAGE_VERSION: i64 = 1;

/// Parameter name carrying the permanent-connection cache directive.
pub const PARAM_CACHE: &str = "cache";
/// Parameter name carrying the datagram shared-secret token.
pub const PARAM_SECRET_CODE: &str = "secret_code";
/// Parameter name carrying a datagram reply address.
pub const PARAM_REPLY_TO: &str = "reply_to";
/// Parameter name carrying the wire-compatibility version.
pub const PARAM_MESSAGE_VERSION: &str = "message_version";

/// A structured command message: a command name, optional routing labels,
/// and a bag of typed parameters.
///
/// Values live on the wire as percent-escaped strings; typed accessors
/// parse on read rather than storing a second representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    command: String,
    sent_from_server: Option<String>,
    sent_from_service: Option<String>,
    server: Option<String>,
    service: Option<String>,
    parameters: BTreeMap<String, String>,
}

impl Message {
    /// Build a message with the given command, validating it against
    /// `[A-Za-z_][A-Za-z0-9_]*`.
    pub fn new(command: impl Into<String>) -> Result<Self> {
        let command = command.into();
        if !is_valid_command(&command) {
            return Err(Error::MalformedMessage(format!(
                "invalid command `{command}`"
            )));
        }
        Ok(Self {
            command,
            sent_from_server: None,
            sent_from_service: None,
            server: None,
            service: None,
            parameters: BTreeMap::new(),
        })
    }

    /// The command name.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The sender's server label, if set.
    pub fn sent_from_server(&self) -> Option<&str> {
        self.sent_from_server.as_deref()
    }

    /// The sender's service label, if set.
    pub fn sent_from_service(&self) -> Option<&str> {
        self.sent_from_service.as_deref()
    }

    /// The destination server label, if set.
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// The destination service label, if set.
    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    /// Set the sender routing labels (`sent_from_server`/`sent_from_service`).
    pub fn set_sent_from(&mut self, server: impl Into<String>, service: impl Into<String>) {
        self.sent_from_server = Some(server.into());
        self.sent_from_service = Some(service.into());
    }

    /// Set the destination routing labels (`server`/`service`).
    pub fn set_destination(&mut self, server: impl Into<String>, service: impl Into<String>) {
        self.server = Some(server.into());
        self.service = Some(service.into());
    }

    /// Set only the destination server label, leaving `service` untouched.
    pub fn set_server(&mut self, server: impl Into<String>) {
        self.server = Some(server.into());
    }

    /// Set only the destination service label, leaving `server` untouched.
    pub fn set_service(&mut self, service: impl Into<String>) {
        self.service = Some(service.into());
    }

    /// Address this message as a reply to `other`: its sender becomes our
    /// destination, and our own sender labels are cleared. The command is
    /// untouched.
    pub fn reply_to(&mut self, other: &Message) {
        self.server = other.sent_from_server.clone();
        self.service = other.sent_from_service.clone();
        self.sent_from_server = None;
        self.sent_from_service = None;
    }

    /// Set a string parameter, last write wins.
    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(name.into(), value.into());
    }

    /// Set a signed-integer parameter.
    pub fn set_integer_parameter(&mut self, name: impl Into<String>, value: i64) {
        self.set_parameter(name, value.to_string());
    }

    /// Set an unsigned-integer parameter.
    pub fn set_unsigned_parameter(&mut self, name: impl Into<String>, value: u64) {
        self.set_parameter(name, value.to_string());
    }

    /// Read a string parameter.
    pub fn get_parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// True if a parameter with this name is present.
    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    /// Read a parameter as a signed 64-bit integer. Accepts an optional
    /// leading `+`/`-` and decimal digits only.
    pub fn get_integer_parameter(&self, name: &str) -> Result<i64> {
        let raw = self.require_parameter(name)?;
        parse_signed(raw).ok_or_else(|| Error::InvalidParameter {
            name: name.to_string(),
            reason: format!("`{raw}` is not an integer"),
        })
    }

    /// Read a parameter as an unsigned 64-bit integer. Rejects a leading
    /// `-`, including `-0`.
    pub fn get_unsigned_parameter(&self, name: &str) -> Result<u64> {
        let raw = self.require_parameter(name)?;
        if raw.starts_with('-') {
            return Err(Error::InvalidParameter {
                name: name.to_string(),
                reason: format!("`{raw}` is negative"),
            });
        }
        parse_signed(raw)
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| Error::InvalidParameter {
                name: name.to_string(),
                reason: format!("`{raw}` is not an unsigned integer"),
            })
    }

    /// Read a parameter as a double.
    pub fn get_double_parameter(&self, name: &str) -> Result<f64> {
        let raw = self.require_parameter(name)?;
        raw.parse::<f64>().map_err(|_| Error::InvalidParameter {
            name: name.to_string(),
            reason: format!("`{raw}` is not a number"),
        })
    }

    /// Read a parameter as a Unix timestamp (seconds).
    pub fn get_timestamp_parameter(&self, name: &str) -> Result<u64> {
        self.get_unsigned_parameter(name)
    }

    fn require_parameter(&self, name: &str) -> Result<&str> {
        self.get_parameter(name).ok_or_else(|| Error::InvalidParameter {
            name: name.to_string(),
            reason: "missing".to_string(),
        })
    }

    /// Iterate over all parameters as raw strings.
    pub fn parameters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parameters.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Stamp this message with the crate's wire-compatibility version.
    pub fn add_version_parameter(&mut self) {
        self.set_integer_parameter(PARAM_MESSAGE_VERSION, MESSAGE_VERSION);
    }

    /// True iff `message_version` is present and equals [`MESSAGE_VERSION`].
    pub fn check_version_parameter(&self) -> bool {
        self.get_integer_parameter(PARAM_MESSAGE_VERSION) == Ok(MESSAGE_VERSION)
    }

    /// Encode this message as a single line, without the trailing `\n`.
    pub fn encode(&self) -> String {
        let mut out = String::new();

        if let (Some(server), Some(service)) =
            (&self.sent_from_server, &self.sent_from_service)
        {
            out.push('<');
            out.push_str(server);
            out.push(':');
            out.push_str(service);
            out.push(' ');
        }

        if let Some(server) = &self.server {
            out.push_str(server);
            out.push('/');
        }
        if let Some(service) = &self.service {
            out.push_str(service);
            out.push(':');
        }

        out.push_str(&self.command);

        if !self.parameters.is_empty() {
            out.push(' ');
            let mut first = true;
            for (name, value) in &self.parameters {
                if !first {
                    out.push(';');
                }
                first = false;
                out.push_str(name);
                out.push('=');
                out.push_str(&percent_encode(value));
            }
        }

        out
    }

    /// Decode a single line (without its trailing `\n`/`\r\n`).
    pub fn decode(line: &str) -> Result<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        let mut sent_from_server = None;
        let mut sent_from_service = None;
        let mut rest = line.trim_start();

        if let Some(after_angle) = rest.strip_prefix('<') {
            let space = after_angle
                .find(' ')
                .ok_or_else(|| Error::MalformedMessage("unterminated `<...` prefix".to_string()))?;
            let from = &after_angle[..space];
            let (server, service) = from.split_once(':').ok_or_else(|| {
                Error::MalformedMessage(format!("malformed sender prefix `{from}`"))
            })?;
            sent_from_server = Some(server.to_string());
            sent_from_service = Some(service.to_string());
            rest = after_angle[space + 1..].trim_start();
        }

        let (head, params_str) = match rest.find(' ') {
            Some(idx) => (&rest[..idx], Some(rest[idx + 1..].trim_start())),
            None => (rest, None),
        };
        let head = head.trim_end();

        let (server, head) = match head.split_once('/') {
            Some((server, tail)) => (Some(server.to_string()), tail),
            None => (None, head),
        };
        let (service, command) = match head.split_once(':') {
            Some((service, tail)) => (Some(service.to_string()), tail),
            None => (None, head),
        };

        if !is_valid_command(command) {
            return Err(Error::MalformedMessage(format!(
                "missing or invalid command in `{line}`"
            )));
        }

        let mut parameters = BTreeMap::new();
        if let Some(params_str) = params_str {
            if !params_str.is_empty() {
                for entry in params_str.split(';') {
                    let (name, value) = entry.trim().split_once('=').ok_or_else(|| {
                        Error::MalformedMessage(format!("parameter `{entry}` lacks `=`"))
                    })?;
                    if name.is_empty() {
                        return Err(Error::MalformedMessage(
                            "empty parameter name".to_string(),
                        ));
                    }
                    parameters.insert(name.to_string(), percent_decode(value)?);
                }
            }
        }

        Ok(Message {
            command: command.to_string(),
            sent_from_server,
            sent_from_service,
            server,
            service,
            parameters,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn is_valid_command(command: &str) -> bool {
    let mut chars = command.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_signed(raw: &str) -> Option<i64> {
    let (sign, digits) = match raw.as_bytes().first() {
        Some(b'+') => (1i64, &raw[1..]),
        Some(b'-') => (-1i64, &raw[1..]),
        _ => (1i64, raw),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i64>().ok().map(|v| v * sign)
}

/// Escape bytes that would otherwise be ambiguous in the wire grammar:
/// `%`, `;`, `=`, `\n`, `\r`, `\0`, and the remaining C0 control range.
/// Operates on raw bytes, not `char`s — a non-ASCII `char` is a multi-byte
/// UTF-8 sequence, and escaping/copying byte-by-byte is what keeps the
/// sequence intact instead of reinterpreting each continuation byte as its
/// own Latin-1 codepoint.
fn percent_encode(value: &str) -> String {
    let mut out = Vec::with_capacity(value.len());
    for byte in value.bytes() {
        if byte == b'%' || byte == b';' || byte == b'=' || byte < 0x20 {
            out.push(b'%');
            out.extend_from_slice(format!("{byte:02X}").as_bytes());
        } else {
            out.push(byte);
        }
    }
    String::from_utf8(out).expect("escaping never breaks UTF-8 validity of a &str input")
}

fn percent_decode(value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3).ok_or_else(|| {
                Error::MalformedMessage(format!("truncated escape in `{value}`"))
            })?;
            let hex = std::str::from_utf8(hex).map_err(|_| {
                Error::MalformedMessage(format!("invalid escape in `{value}`"))
            })?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| {
                Error::MalformedMessage(format!("invalid escape `%{hex}` in `{value}`"))
            })?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| Error::MalformedMessage(format!("non-UTF-8 parameter value in `{value}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_simple_message() {
        let mut m = Message::new("PING").unwrap();
        m.set_parameter("serial", "42");
        let encoded = m.encode();
        let decoded = Message::decode(&format!("{encoded}\n")).unwrap();
        assert_eq!(m, decoded);
    }

    #[test]
    fn round_trips_routing_and_escapes() {
        let mut m = Message::new("DELAYED").unwrap();
        m.set_sent_from("srvA", "svcA");
        m.set_destination("srvB", "svcB");
        m.set_parameter("value", "a;b=c\n\r%weird");
        let encoded = m.encode();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(m, decoded);
        assert_eq!(decoded.get_parameter("value").unwrap(), "a;b=c\n\r%weird");
    }

    #[test]
    fn round_trips_non_ascii_parameter() {
        let mut m = Message::new("GREETING").unwrap();
        m.set_parameter("name", "café \u{1F980}");
        let encoded = m.encode();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(m, decoded);
        assert_eq!(decoded.get_parameter("name").unwrap(), "café \u{1F980}");
    }

    #[test]
    fn rejects_missing_command() {
        assert!(Message::decode("param=1\n").is_err());
        assert!(Message::decode("\n").is_err());
    }

    #[test]
    fn rejects_parameter_without_equals() {
        assert!(Message::decode("PING broken\n").is_err());
    }

    #[test]
    fn typed_accessors_reject_non_numeric() {
        let mut m = Message::new("PING").unwrap();
        m.set_parameter("n", "abc");
        assert!(m.get_integer_parameter("n").is_err());
        m.set_parameter("n", "-5");
        assert!(m.get_unsigned_parameter("n").is_err());
        m.set_parameter("n", "5");
        assert_eq!(m.get_unsigned_parameter("n").unwrap(), 5);
    }

    #[test]
    fn reply_to_swaps_routing_and_keeps_command() {
        let mut incoming = Message::new("PING").unwrap();
        incoming.set_sent_from("clientA", "pinger");

        let mut reply = Message::new("PONG").unwrap();
        reply.reply_to(&incoming);

        assert_eq!(reply.command(), "PONG");
        assert_eq!(reply.server(), Some("clientA"));
        assert_eq!(reply.service(), Some("pinger"));
        assert_eq!(reply.sent_from_server(), None);
    }

    #[test]
    fn version_parameter_round_trips() {
        let mut m = Message::new("HELLO").unwrap();
        assert!(!m.check_version_parameter());
        m.add_version_parameter();
        assert!(m.check_version_parameter());
        m.set_integer_parameter(PARAM_MESSAGE_VERSION, MESSAGE_VERSION + 1);
        assert!(!m.check_version_parameter());
    }

    #[test]
    fn accepts_crlf_input() {
        let decoded = Message::decode("PING serial=1\r\n").unwrap();
        assert_eq!(decoded.command(), "PING");
    }
}
