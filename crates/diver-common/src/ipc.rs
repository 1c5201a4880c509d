//! Wire protocol between controllers and the diver
//!
//! Every message is a frame: `u32` little-endian body length followed by a
//! JSON body. Requests carry a tagged [`Command`]; responses carry either
//! `data` or an error triple (kind, message, stack trace). Hook and event
//! pushes travel to the controller's callback endpoint with the same framing.

use crate::error::{Error, ErrorKind, Result};
use crate::types::{
    CallbackEndpoint, CollectionQuery, HookPosition, ObjectAddress, ObjectOrPrimitive, ProcessId,
    RemoteHandle, Token,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bumped whenever a wire type changes shape
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame body size
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default diver port
pub const DEFAULT_DIVER_PORT: u16 = 9977;

/// Reply to `ping`
pub const PONG: &str = "pong";

// =============================================================================
// Envelopes
// =============================================================================

/// Distributed tracing context propagated from the controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u32,
    #[serde(default = "default_version")]
    pub version: u32,
    /// Pid of the registered session issuing the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<ProcessId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<TraceContext>,
    pub body: Command,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl RequestEnvelope {
    pub fn new(id: u32, body: Command) -> Self {
        Self {
            id,
            version: PROTOCOL_VERSION,
            session: None,
            trace_context: None,
            body,
        }
    }

    pub fn with_session(mut self, pid: ProcessId) -> Self {
        self.session = Some(pid);
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace_context = Some(trace);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u32,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack_trace: Option<String>,
    /// Address and expected type of a stale reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_object: Option<ObjectAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ResponseEnvelope {
    pub fn success<T: Serialize>(id: u32, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                id,
                is_error: false,
                error_kind: None,
                error_message: None,
                error_stack_trace: None,
                error_object: None,
                data: Some(value),
            },
            Err(e) => Self::from_error(id, &Error::from(e)),
        }
    }

    pub fn from_error(id: u32, error: &Error) -> Self {
        let message = match error {
            Error::Target { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            id,
            is_error: true,
            error_kind: Some(error.kind()),
            error_message: Some(message),
            error_stack_trace: error.stack_trace().map(str::to_string),
            error_object: match error {
                Error::StaleReference { address, type_name } => {
                    Some(ObjectAddress::new(*address, type_name.clone()))
                }
                _ => None,
            },
            data: None,
        }
    }

    /// Rebuild the diver-side error carried by this response
    pub fn error(&self) -> Option<Error> {
        if !self.is_error {
            return None;
        }
        let message = self
            .error_message
            .clone()
            .unwrap_or_else(|| "Unknown error".to_string());
        Some(match self.error_kind.unwrap_or(ErrorKind::Internal) {
            ErrorKind::Protocol => Error::Protocol(message),
            ErrorKind::Target => Error::Target {
                message,
                stack_trace: self.error_stack_trace.clone(),
            },
            ErrorKind::StaleReference => match &self.error_object {
                Some(object) => Error::stale(object.address, object.type_name.clone()),
                None => Error::stale(0, message),
            },
            ErrorKind::Session => Error::Session(message),
            ErrorKind::Transport => Error::Transport(message),
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::Internal => Error::Internal(message),
        })
    }

    /// Decode `data` into `T`, or return the carried error
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        let data = self.data.unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(data)?)
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Fixed command set understood by the diver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "params", rename_all = "snake_case")]
pub enum Command {
    Register(RegisterRequest),
    Unregister(UnregisterRequest),
    Ping,
    Status,
    ListAssemblies,
    ListTypes(ListTypesRequest),
    DumpType(DumpTypeRequest),
    Invoke(InvocationRequest),
    GetField(GetFieldRequest),
    SetField(SetFieldRequest),
    CreateObject(CreateObjectRequest),
    PinObject(PinObjectRequest),
    ReleaseObject(ReleaseObjectRequest),
    GetItem(GetItemRequest),
    QueryCollection(QueryCollectionRequest),
    SubscribeEvent(SubscribeEventRequest),
    UnsubscribeEvent(TokenRequest),
    HookMethod(HookMethodRequest),
    UnhookMethod(TokenRequest),
    SearchHeap(SearchHeapRequest),
    Die(DieRequest),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Register(_) => "register",
            Command::Unregister(_) => "unregister",
            Command::Ping => "ping",
            Command::Status => "status",
            Command::ListAssemblies => "list_assemblies",
            Command::ListTypes(_) => "list_types",
            Command::DumpType(_) => "dump_type",
            Command::Invoke(_) => "invoke",
            Command::GetField(_) => "get_field",
            Command::SetField(_) => "set_field",
            Command::CreateObject(_) => "create_object",
            Command::PinObject(_) => "pin_object",
            Command::ReleaseObject(_) => "release_object",
            Command::GetItem(_) => "get_item",
            Command::QueryCollection(_) => "query_collection",
            Command::SubscribeEvent(_) => "subscribe_event",
            Command::UnsubscribeEvent(_) => "unsubscribe_event",
            Command::HookMethod(_) => "hook_method",
            Command::UnhookMethod(_) => "unhook_method",
            Command::SearchHeap(_) => "search_heap",
            Command::Die(_) => "die",
        }
    }

    /// Commands that create or touch session-owned state need a registered pid
    pub fn requires_session(&self) -> bool {
        matches!(
            self,
            Command::Invoke(_)
                | Command::GetField(_)
                | Command::SetField(_)
                | Command::CreateObject(_)
                | Command::PinObject(_)
                | Command::ReleaseObject(_)
                | Command::GetItem(_)
                | Command::QueryCollection(_)
                | Command::SubscribeEvent(_)
                | Command::UnsubscribeEvent(_)
                | Command::HookMethod(_)
                | Command::UnhookMethod(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub pid: ProcessId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub pid: ProcessId,
    /// Succeed even when `pid` has no session
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterResponse {
    pub was_removed: bool,
    pub other_clients_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListTypesRequest {
    pub assembly: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpTypeRequest {
    #[serde(default)]
    pub assembly: Option<String>,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// Instance to call on; `None` for a static method
    #[serde(default)]
    pub target: Option<RemoteHandle>,
    pub type_full_name: String,
    pub method_name: String,
    #[serde(default)]
    pub generic_args: Vec<String>,
    #[serde(default)]
    pub args: Vec<ObjectOrPrimitive>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub void_return: bool,
    #[serde(default)]
    pub return_value: Option<ObjectOrPrimitive>,
}

impl InvocationResult {
    pub fn void() -> Self {
        Self {
            void_return: true,
            return_value: None,
        }
    }

    pub fn value(value: ObjectOrPrimitive) -> Self {
        Self {
            void_return: false,
            return_value: Some(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetFieldRequest {
    /// Instance to read from; `None` for a static field
    #[serde(default)]
    pub target: Option<RemoteHandle>,
    pub type_full_name: String,
    pub field_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetFieldRequest {
    #[serde(default)]
    pub target: Option<RemoteHandle>,
    pub type_full_name: String,
    pub field_name: String,
    pub value: ObjectOrPrimitive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateObjectRequest {
    pub type_full_name: String,
    #[serde(default)]
    pub args: Vec<ObjectOrPrimitive>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinObjectRequest {
    pub address: u64,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseObjectRequest {
    pub handle: RemoteHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetItemRequest {
    pub target: RemoteHandle,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCollectionRequest {
    pub target: RemoteHandle,
    #[serde(default)]
    pub query: CollectionQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCollectionResponse {
    pub items: Vec<ObjectOrPrimitive>,
    /// Elements matching the filter before `take`
    pub matched: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeEventRequest {
    pub target: RemoteHandle,
    pub event_name: String,
    pub callback_endpoint: CallbackEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookMethodRequest {
    pub type_full_name: String,
    pub method_name: String,
    #[serde(default)]
    pub parameter_types: Vec<String>,
    pub position: HookPosition,
    pub callback_endpoint: CallbackEndpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub token: Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHeapRequest {
    /// Full type name; `*` matches any run of characters
    pub type_filter: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHeapResponse {
    pub objects: Vec<ObjectAddress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DieRequest {
    #[serde(default)]
    pub force: bool,
}

/// Snapshot of diver bookkeeping returned by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiverStatus {
    pub version: String,
    pub protocol_version: u32,
    pub pid: u32,
    pub sessions: Vec<ProcessId>,
    pub pinned_objects: usize,
    pub active_hooks: usize,
    pub active_subscriptions: usize,
    pub queued_callbacks: usize,
    pub dropped_callbacks: u64,
}

// =============================================================================
// Callback pushes
// =============================================================================

/// What fired a callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallbackContext {
    Event {
        event_name: String,
    },
    Hook {
        position: HookPosition,
        type_full_name: String,
        method_name: String,
        #[serde(default)]
        instance: Option<ObjectOrPrimitive>,
        #[serde(default)]
        return_value: Option<ObjectOrPrimitive>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Push sent to a callback endpoint for every hook or event firing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackInvocationRequest {
    /// Unix epoch milliseconds at capture time
    pub timestamp: u64,
    pub token: Token,
    #[serde(default)]
    pub args: Vec<ObjectOrPrimitive>,
    pub context: CallbackContext,
}

// =============================================================================
// Framing
// =============================================================================

/// Serialize a message into a length-prefixed frame
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(Error::protocol(format!("Message too large: {}", body.len())));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one frame body
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::Transport(format!("Failed to read length: {}", e)))?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::protocol(format!("Message too large: {}", len)));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::Transport(format!("Failed to read body: {}", e)))?;
    Ok(body)
}

pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let body = read_frame(reader).await?;
    serde_json::from_slice(&body).map_err(|e| Error::protocol(format!("Invalid JSON: {}", e)))
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(message)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| Error::Transport(format!("Failed to write frame: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Transport(format!("Failed to flush: {}", e)))
}

/// Blocking write, for threads outside the async runtime
pub fn write_message_blocking<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: std::io::Write,
    T: Serialize,
{
    let frame = encode_frame(message)?;
    writer
        .write_all(&frame)
        .and_then(|_| writer.flush())
        .map_err(|e| Error::Transport(format!("Failed to write frame: {}", e)))
}

/// Decode a request body, keeping the id when only the command is malformed
pub fn decode_request(body: &[u8]) -> std::result::Result<RequestEnvelope, (u32, Error)> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| (0, Error::protocol(format!("Invalid JSON: {}", e))))?;
    let id = value
        .get("id")
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0);
    let envelope: RequestEnvelope = serde_json::from_value(value)
        .map_err(|e| (id, Error::protocol(format!("Malformed request: {}", e))))?;
    if envelope.version != PROTOCOL_VERSION {
        return Err((
            id,
            Error::protocol(format!(
                "Unsupported protocol version {} (expected {})",
                envelope.version, PROTOCOL_VERSION
            )),
        ));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CompareOp, HandleId, KeySelector, Predicate, Primitive};
    use serde_json::json;

    fn round_trip_request(body: Command) {
        let envelope = RequestEnvelope::new(9, body).with_session(100);
        let frame = encode_frame(&envelope).unwrap();
        let decoded = decode_request(&frame[4..]).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_invocation_request_round_trip() {
        round_trip_request(Command::Invoke(InvocationRequest {
            target: Some(RemoteHandle::new(HandleId(1), 0x1000, "Demo.Player")),
            type_full_name: "Demo.Player".to_string(),
            method_name: "Heal".to_string(),
            generic_args: vec!["int".to_string()],
            args: vec![
                ObjectOrPrimitive::from(5i64),
                ObjectOrPrimitive::Null,
                ObjectOrPrimitive::from("potion"),
                ObjectOrPrimitive::from(RemoteHandle::new(HandleId(2), 0x2000, "Demo.Item")),
            ],
        }));
    }

    #[test]
    fn test_empty_and_null_fields_round_trip() {
        round_trip_request(Command::Invoke(InvocationRequest {
            target: None,
            type_full_name: "Demo.Game".to_string(),
            method_name: "Tick".to_string(),
            generic_args: vec![],
            args: vec![],
        }));
        round_trip_request(Command::DumpType(DumpTypeRequest {
            assembly: None,
            type_name: "Demo.Player".to_string(),
        }));
        round_trip_request(Command::Ping);
        round_trip_request(Command::Die(DieRequest { force: false }));
    }

    #[test]
    fn test_hook_and_query_round_trip() {
        round_trip_request(Command::HookMethod(HookMethodRequest {
            type_full_name: "Demo.Player".to_string(),
            method_name: "Bar".to_string(),
            parameter_types: vec!["int".to_string(), "string".to_string()],
            position: HookPosition::Finalizer,
            callback_endpoint: CallbackEndpoint::new("127.0.0.1:5000"),
        }));
        round_trip_request(Command::QueryCollection(QueryCollectionRequest {
            target: RemoteHandle::new(HandleId(4), 0x4000, "Demo.Inventory"),
            query: CollectionQuery {
                filter: Some(Predicate {
                    member: Some("Weight".to_string()),
                    op: CompareOp::Gt,
                    value: Primitive::Float(1.5),
                }),
                order_by: Some(KeySelector {
                    member: None,
                    descending: true,
                }),
                take: Some(3),
            },
        }));
    }

    #[test]
    fn test_response_round_trip() {
        let ok = ResponseEnvelope::success(
            3,
            &InvocationResult::value(ObjectOrPrimitive::from(true)),
        );
        let bytes = encode_frame(&ok).unwrap();
        let decoded: ResponseEnvelope = serde_json::from_slice(&bytes[4..]).unwrap();
        assert_eq!(decoded, ok);
        let result: InvocationResult = decoded.into_result().unwrap();
        assert!(!result.void_return);

        let err = ResponseEnvelope::from_error(
            4,
            &Error::Target {
                message: "Divide by zero".to_string(),
                stack_trace: Some("at Demo.Math.Div".to_string()),
            },
        );
        let decoded: ResponseEnvelope =
            serde_json::from_slice(&encode_frame(&err).unwrap()[4..]).unwrap();
        assert_eq!(decoded, err);
        assert!(decoded.is_error);
        assert_eq!(decoded.error_kind, Some(ErrorKind::Target));
        match decoded.into_result::<InvocationResult>() {
            Err(Error::Target {
                message,
                stack_trace,
            }) => {
                assert_eq!(message, "Divide by zero");
                assert_eq!(stack_trace.as_deref(), Some("at Demo.Math.Div"));
            }
            other => panic!("Expected target error, got {:?}", other),
        }
    }

    #[test]
    fn test_callback_round_trip() {
        let push = CallbackInvocationRequest {
            timestamp: 1_700_000_000_000,
            token: Token(7),
            args: vec![ObjectOrPrimitive::from(1i64)],
            context: CallbackContext::Hook {
                position: HookPosition::Post,
                type_full_name: "Demo.Player".to_string(),
                method_name: "Bar".to_string(),
                instance: None,
                return_value: Some(ObjectOrPrimitive::Null),
                error: None,
            },
        };
        let bytes = encode_frame(&push).unwrap();
        let decoded: CallbackInvocationRequest = serde_json::from_slice(&bytes[4..]).unwrap();
        assert_eq!(decoded, push);
    }

    #[test]
    fn test_non_finite_floats_in_responses_and_pushes() {
        let specials = [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -0.0];

        for v in specials {
            let response = ResponseEnvelope::success(1, &ObjectOrPrimitive::from(v));
            let bytes = encode_frame(&response).unwrap();
            let decoded: ResponseEnvelope = serde_json::from_slice(&bytes[4..]).unwrap();
            let got: ObjectOrPrimitive = decoded.into_result().unwrap();
            let Some(Primitive::Float(got)) = got.as_primitive().cloned() else {
                panic!("expected a float for {}", v);
            };
            assert_eq!(got.to_bits(), v.to_bits(), "{} came back as {}", v, got);
        }

        let push = CallbackInvocationRequest {
            timestamp: 1,
            token: Token(2),
            args: specials.iter().map(|v| ObjectOrPrimitive::from(*v)).collect(),
            context: CallbackContext::Event {
                event_name: "Measured".to_string(),
            },
        };
        let bytes = encode_frame(&push).unwrap();
        let decoded: CallbackInvocationRequest = serde_json::from_slice(&bytes[4..]).unwrap();
        let bits: Vec<u64> = decoded
            .args
            .iter()
            .map(|a| match a.as_primitive() {
                Some(Primitive::Float(v)) => v.to_bits(),
                other => panic!("expected a float, got {:?}", other),
            })
            .collect();
        assert_eq!(bits, specials.map(f64::to_bits).to_vec());
    }

    #[test]
    fn test_stale_reference_keeps_address() {
        let response = ResponseEnvelope::from_error(6, &Error::stale(0x0200_0040, "Demo.Player"));
        let bytes = encode_frame(&response).unwrap();
        let decoded: ResponseEnvelope = serde_json::from_slice(&bytes[4..]).unwrap();
        assert_eq!(
            decoded.error_object,
            Some(ObjectAddress::new(0x0200_0040, "Demo.Player"))
        );
        match decoded.into_result::<bool>() {
            Err(Error::StaleReference { address, type_name }) => {
                assert_eq!(address, 0x0200_0040);
                assert_eq!(type_name, "Demo.Player");
            }
            other => panic!("Expected stale reference, got {:?}", other),
        }
    }

    #[test]
    fn test_command_wire_shape() {
        let json = serde_json::to_value(Command::Register(RegisterRequest { pid: 100 })).unwrap();
        assert_eq!(json, json!({"command": "register", "params": {"pid": 100}}));
        let ping = serde_json::to_value(Command::Ping).unwrap();
        assert_eq!(ping, json!({"command": "ping"}));
    }

    #[test]
    fn test_decode_rejects_malformed_but_keeps_id() {
        let body = serde_json::to_vec(&json!({"id": 17, "body": {"command": "warp"}})).unwrap();
        let (id, err) = decode_request(&body).unwrap_err();
        assert_eq!(id, 17);
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let (id, _) = decode_request(b"{{{").unwrap_err();
        assert_eq!(id, 0);
    }

    #[test]
    fn test_decode_rejects_other_versions() {
        let body = serde_json::to_vec(&json!({
            "id": 2, "version": 99, "body": {"command": "ping"}
        }))
        .unwrap();
        let (id, err) = decode_request(&body).unwrap_err();
        assert_eq!(id, 2);
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn test_requires_session() {
        assert!(!Command::Ping.requires_session());
        assert!(!Command::Register(RegisterRequest { pid: 1 }).requires_session());
        assert!(Command::UnhookMethod(TokenRequest { token: Token(1) }).requires_session());
    }

    #[tokio::test]
    async fn test_async_framing() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let envelope = RequestEnvelope::new(5, Command::Ping);
        write_message(&mut a, &envelope).await.unwrap();
        let got: RequestEnvelope = read_message(&mut b).await.unwrap();
        assert_eq!(got, envelope);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_le_bytes();
        a.write_all(&len).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
