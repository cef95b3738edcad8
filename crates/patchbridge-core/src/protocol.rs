//! Protocol types for the patchbridge relay.
//!
//! Three layers live here:
//! - commands: the `{"action": ..., "request_id": ..., ...}` objects a controller sends
//! - snapshots: the box/patchline records that graph queries answer with
//! - relay frames: the websocket text messages that carry both
//!
//! Command format:
//! ```json
//! {"action": "connect_objects", "src_varname": "osc", "dst_varname": "dac", "outlet_idx": 0}
//! ```
//!
//! Response envelope (before chunking):
//! ```json
//! {"request_id": "uuid", "results": {...}}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Protocol version spoken by the relay.
pub const PROTOCOL_VERSION: u8 = 1;

/// Stable error codes carried in `error` frames.
pub mod codes {
    pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
    pub const MISSING_ACTION: &str = "MISSING_ACTION";
    pub const MISSING_FIELD: &str = "MISSING_FIELD";
    pub const UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";
    pub const INVALID_PORT: &str = "INVALID_PORT";
    pub const TRANSPORT: &str = "TRANSPORT";
    pub const MALFORMED_RESPONSE: &str = "MALFORMED_RESPONSE";
}

// ============================================================================
// Atoms and messages
// ============================================================================

/// A single message element: integer, float or symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Atom {
    Int(i64),
    Float(f64),
    Symbol(String),
}

impl Atom {
    /// Parse a whitespace-free token the way a message box would.
    pub fn parse(token: &str) -> Self {
        if let Ok(i) = token.parse::<i64>() {
            return Atom::Int(i);
        }
        match token.parse::<f64>() {
            Ok(f) if f.is_finite() => Atom::Float(f),
            _ => Atom::Symbol(token.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Atom::Int(i) => Some(*i as f64),
            Atom::Float(f) => Some(*f),
            Atom::Symbol(_) => None,
        }
    }

    pub fn is_number(&self) -> bool {
        !matches!(self, Atom::Symbol(_))
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Int(i) => write!(f, "{}", i),
            Atom::Float(x) => write!(f, "{}", x),
            Atom::Symbol(s) => f.write_str(s),
        }
    }
}

impl From<&serde_json::Number> for Atom {
    fn from(n: &serde_json::Number) -> Self {
        match n.as_i64() {
            Some(i) => Atom::Int(i),
            None => Atom::Float(n.as_f64().unwrap_or_default()),
        }
    }
}

/// Join atoms with single spaces, as box text shows them.
pub fn atoms_to_text(atoms: &[Atom]) -> String {
    atoms
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Body of `send_message_to_object`: either a message string or an atom list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    List(Vec<Atom>),
}

impl MessageBody {
    /// Split into selector and arguments.
    ///
    /// A leading number gets the implicit `int`/`float`/`list` selector.
    /// Returns `None` for an empty message.
    pub fn into_selector(self) -> Option<(String, Vec<Atom>)> {
        let atoms: Vec<Atom> = match self {
            MessageBody::Text(text) => text.split_whitespace().map(Atom::parse).collect(),
            MessageBody::List(atoms) => atoms,
        };

        let first = atoms.first()?.clone();
        match first {
            Atom::Symbol(selector) => Some((selector, atoms[1..].to_vec())),
            _ if atoms.len() > 1 => Some(("list".to_string(), atoms)),
            Atom::Int(_) => Some(("int".to_string(), atoms)),
            Atom::Float(_) => Some(("float".to_string(), atoms)),
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

/// The closed action vocabulary.
///
/// The request identifier is kept on [`Command`], not on the variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    GetObjectsInPatch {},
    GetObjectsInSelected {},
    GetObjectAttributes {
        varname: String,
    },
    GetAvoidRectPosition {},
    AddObject {
        obj_type: String,
        position: [f64; 2],
        varname: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<Atom>,
    },
    RemoveObject {
        varname: String,
    },
    ConnectObjects {
        src_varname: String,
        dst_varname: String,
        #[serde(default)]
        outlet_idx: u32,
        #[serde(default, alias = "inlet_index")]
        inlet_idx: u32,
    },
    DisconnectObjects {
        src_varname: String,
        dst_varname: String,
        #[serde(default)]
        outlet_idx: u32,
        #[serde(default, alias = "inlet_index")]
        inlet_idx: u32,
    },
    SetObjectAttribute {
        varname: String,
        attr_name: String,
        attr_value: Value,
    },
    SetMessageText {
        varname: String,
        new_text: String,
    },
    SetNumber {
        varname: String,
        num: serde_json::Number,
    },
    SendMessageToObject {
        varname: String,
        message: MessageBody,
    },
    SendBangToObject {
        varname: String,
    },
}

/// Required fields per action, in the order they are checked.
const REQUIRED_FIELDS: &[(&str, &[&str])] = &[
    ("get_objects_in_patch", &["request_id"]),
    ("get_objects_in_selected", &["request_id"]),
    ("get_object_attributes", &["request_id", "varname"]),
    ("get_avoid_rect_position", &["request_id"]),
    ("add_object", &["obj_type", "position", "varname"]),
    ("remove_object", &["varname"]),
    ("connect_objects", &["src_varname", "dst_varname"]),
    ("disconnect_objects", &["src_varname", "dst_varname"]),
    ("set_object_attribute", &["varname", "attr_name", "attr_value"]),
    ("set_message_text", &["varname", "new_text"]),
    ("set_number", &["varname", "num"]),
    ("send_message_to_object", &["varname", "message"]),
    ("send_bang_to_object", &["varname"]),
];

impl Action {
    /// Wire name of this action.
    pub fn name(&self) -> &'static str {
        match self {
            Action::GetObjectsInPatch {} => "get_objects_in_patch",
            Action::GetObjectsInSelected {} => "get_objects_in_selected",
            Action::GetObjectAttributes { .. } => "get_object_attributes",
            Action::GetAvoidRectPosition {} => "get_avoid_rect_position",
            Action::AddObject { .. } => "add_object",
            Action::RemoveObject { .. } => "remove_object",
            Action::ConnectObjects { .. } => "connect_objects",
            Action::DisconnectObjects { .. } => "disconnect_objects",
            Action::SetObjectAttribute { .. } => "set_object_attribute",
            Action::SetMessageText { .. } => "set_message_text",
            Action::SetNumber { .. } => "set_number",
            Action::SendMessageToObject { .. } => "send_message_to_object",
            Action::SendBangToObject { .. } => "send_bang_to_object",
        }
    }

    /// Queries answer with a response; everything else is a silent mutation.
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Action::GetObjectsInPatch {}
                | Action::GetObjectsInSelected {}
                | Action::GetObjectAttributes { .. }
                | Action::GetAvoidRectPosition {}
        )
    }

    /// Required fields for an action name, or `None` if the name is unknown.
    pub fn required_fields(name: &str) -> Option<&'static [&'static str]> {
        REQUIRED_FIELDS
            .iter()
            .find(|(action, _)| *action == name)
            .map(|(_, fields)| *fields)
    }
}

/// A decoded command: action plus optional correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub request_id: Option<String>,
    pub action: Action,
}

/// Why an inbound command was refused.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Command must be a JSON object")]
    NotAnObject,

    #[error("Missing action")]
    MissingAction,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Missing {field} for {action}")]
    MissingField { action: String, field: &'static str },

    #[error("Invalid {action} payload: {message}")]
    InvalidField { action: String, message: String },
}

impl CommandError {
    /// Wire error code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::InvalidJson(_)
            | CommandError::NotAnObject
            | CommandError::InvalidField { .. } => codes::INVALID_PAYLOAD,
            CommandError::MissingAction => codes::MISSING_ACTION,
            CommandError::UnknownAction(_) => codes::UNKNOWN_ACTION,
            CommandError::MissingField { .. } => codes::MISSING_FIELD,
        }
    }
}

/// A refused command, with whatever request id could be recovered from it.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{error}")]
pub struct CommandFailure {
    pub request_id: Option<String>,
    pub error: CommandError,
}

impl Command {
    /// A command without a request id (mutations).
    pub fn new(action: Action) -> Self {
        Self {
            request_id: None,
            action,
        }
    }

    /// A command with a fresh UUID request id.
    pub fn with_new_id(action: Action) -> Self {
        Self {
            request_id: Some(uuid::Uuid::new_v4().to_string()),
            action,
        }
    }

    /// Parse a raw inbound message.
    pub fn parse(raw: &str) -> Result<Self, CommandFailure> {
        let value: Value = serde_json::from_str(raw).map_err(|e| CommandFailure {
            request_id: None,
            error: CommandError::InvalidJson(e.to_string()),
        })?;
        Self::from_value(value)
    }

    /// Validate and decode a JSON command object.
    pub fn from_value(value: Value) -> Result<Self, CommandFailure> {
        let Value::Object(map) = value else {
            return Err(CommandFailure {
                request_id: None,
                error: CommandError::NotAnObject,
            });
        };

        let request_id = map.get("request_id").and_then(request_id_of);
        let fail = |error: CommandError| CommandFailure {
            request_id: request_id.clone(),
            error,
        };

        let action_name = match map.get("action") {
            None | Some(Value::Null) => return Err(fail(CommandError::MissingAction)),
            Some(Value::String(name)) => name.clone(),
            Some(other) => return Err(fail(CommandError::UnknownAction(other.to_string()))),
        };

        let required = Action::required_fields(&action_name)
            .ok_or_else(|| fail(CommandError::UnknownAction(action_name.clone())))?;

        if let Some(field) = required.iter().copied().find(|f| is_missing(&map, f)) {
            return Err(fail(CommandError::MissingField {
                action: action_name,
                field,
            }));
        }

        let action: Action = serde_json::from_value(Value::Object(map)).map_err(|e| {
            fail(CommandError::InvalidField {
                action: action_name.clone(),
                message: e.to_string(),
            })
        })?;

        Ok(Self { request_id, action })
    }

    /// Encode to the wire object.
    pub fn to_value(&self) -> Value {
        let mut value = serde_json::to_value(&self.action).unwrap_or(Value::Null);
        if let (Value::Object(map), Some(id)) = (&mut value, &self.request_id) {
            map.insert("request_id".to_string(), Value::String(id.clone()));
        }
        value
    }
}

/// Absent, `null` and empty strings all count as missing.
fn is_missing(map: &Map<String, Value>, field: &str) -> bool {
    match map.get(field) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Correlation tag as echoed back in replies.
///
/// Any truthy value is accepted: strings as-is, anything else in its
/// compact JSON text (`42` becomes `"42"`). `null`, `false`, `0` and `""`
/// mean no id.
fn request_id_of(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        other => Some(other.to_string()),
    }
}

/// Response envelope before chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub results: Value,
}

// ============================================================================
// Snapshot records
// ============================================================================

/// Box geometry, serialized as `[x, y, width, height]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }
}

impl From<[f64; 4]> for Rect {
    fn from([x, y, width, height]: [f64; 4]) -> Self {
        Self::new(x, y, width, height)
    }
}

impl From<Rect> for [f64; 4] {
    fn from(r: Rect) -> Self {
        [r.x, r.y, r.width, r.height]
    }
}

/// Enclosing rectangle, serialized as `[left, top, right, bottom]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct Bounds {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl Bounds {
    pub fn of(rect: &Rect) -> Self {
        Self {
            left: rect.x,
            top: rect.y,
            right: rect.right(),
            bottom: rect.bottom(),
        }
    }

    /// Grow to enclose `rect`.
    pub fn include(&mut self, rect: &Rect) {
        self.left = self.left.min(rect.x);
        self.top = self.top.min(rect.y);
        self.right = self.right.max(rect.right());
        self.bottom = self.bottom.max(rect.bottom());
    }
}

impl From<[f64; 4]> for Bounds {
    fn from([left, top, right, bottom]: [f64; 4]) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }
}

impl From<Bounds> for [f64; 4] {
    fn from(b: Bounds) -> Self {
        [b.left, b.top, b.right, b.bottom]
    }
}

/// One node of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxRecord {
    pub maxclass: String,
    pub varname: String,
    pub patching_rect: Rect,
    pub numinlets: u32,
    pub numoutlets: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Map<String, Value>>,
}

/// `(varname, port)` pair, serialized as a two-element array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint(pub String, pub u32);

/// One edge of a snapshot: outlet of `source` to inlet of `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Patchline {
    pub source: Endpoint,
    pub destination: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxEntry {
    #[serde(rename = "box")]
    pub record: BoxRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineEntry {
    pub patchline: Patchline,
}

/// Nodes and edges captured by one traversal, in document-file layout.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub boxes: Vec<BoxEntry>,
    pub lines: Vec<LineEntry>,
}

impl Snapshot {
    pub fn push_box(&mut self, record: BoxRecord) {
        self.boxes.push(BoxEntry { record });
    }

    pub fn push_line(&mut self, patchline: Patchline) {
        self.lines.push(LineEntry { patchline });
    }

    pub fn nodes(&self) -> impl Iterator<Item = &BoxRecord> {
        self.boxes.iter().map(|b| &b.record)
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut BoxRecord> {
        self.boxes.iter_mut().map(|b| &mut b.record)
    }

    pub fn edges(&self) -> impl Iterator<Item = &Patchline> {
        self.lines.iter().map(|l| &l.patchline)
    }

    pub fn node(&self, varname: &str) -> Option<&BoxRecord> {
        self.nodes().find(|b| b.varname == varname)
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty() && self.lines.is_empty()
    }
}

// ============================================================================
// Relay frames
// ============================================================================

/// Client-to-relay websocket message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Forward a command object to the patcher host
    Command { data: Value },
    /// Move the relay endpoint to another port
    SetPort { port: i64 },
    /// Liveness check
    Ping,
    /// Relay status
    Status,
}

/// Relay-to-client websocket message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// One chunk of a serialized [`ResponseEnvelope`]
    Response {
        request_id: String,
        seq: u32,
        last: bool,
        chunk: String,
    },
    /// Error channel
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: String,
        message: String,
    },
    /// Reconfiguration applied
    PortChanged { port: u16 },
    Pong,
    Status(StatusInfo),
}

impl ServerFrame {
    pub fn error(request_id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            request_id,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<CommandFailure> for ServerFrame {
    fn from(failure: CommandFailure) -> Self {
        ServerFrame::error(failure.request_id, failure.error.code(), failure.error.to_string())
    }
}

/// Relay health information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub pid: u32,
    pub started_at: String,
    pub port: u16,
    pub clients: usize,
    pub protocol_v: u8,
    pub version: String,
}
