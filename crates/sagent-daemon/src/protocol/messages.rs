//! Request parsing and response building.
//!
//! [`RequestKind`] is the single authoritative registry of request types:
//! dispatch, success-response naming and error-response naming all derive
//! from it. Parsing is strict about the envelope (`format_error` for
//! malformed JSON or missing/ill-typed fields, `type_error` for an
//! unrecognized type) but tolerant of unknown extra fields, matching the
//! original wire behavior.

use sagent_core::overlay::ConfigOverlay;
use sagent_core::{InstanceInfo, LeaseInfo};
use serde_json::{Map, Value, json};

/// Error tag for malformed JSON or missing/ill-typed fields.
pub const FORMAT_ERROR: &str = "format_error";
/// Error tag for an unrecognized request type.
pub const TYPE_ERROR: &str = "type_error";
/// Error tag for a failed start request.
pub const START_ERROR: &str = "start_error";
/// Error tag for a failed stop request.
pub const STOP_ERROR: &str = "stop_error";

/// The registry of recognized request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// List all instances merged with their leases.
    List,
    /// Create (and initiate) a new instance.
    Create,
    /// Destroy an instance.
    Destroy,
    /// Start a stopped instance.
    Start,
    /// Stop a running instance.
    Stop,
    /// Inspect one instance.
    Inspect,
}

impl RequestKind {
    /// Every recognized request type.
    pub const ALL: [Self; 6] = [
        Self::List,
        Self::Create,
        Self::Destroy,
        Self::Start,
        Self::Stop,
        Self::Inspect,
    ];

    /// Resolves the wire `type` string.
    #[must_use]
    pub fn from_type_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_str() == s)
    }

    /// The wire `type` string of the request.
    #[must_use]
    pub const fn type_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Create => "create",
            Self::Destroy => "destroy",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Inspect => "inspect",
        }
    }

    /// The response `type` on success.
    #[must_use]
    pub const fn result_type(self) -> &'static str {
        match self {
            Self::List => "list_res",
            Self::Create => "create_res",
            Self::Destroy => "destroy_res",
            Self::Start => "start_res",
            Self::Stop => "stop_res",
            Self::Inspect => "inspect_res",
        }
    }

    /// The response `type` on failure.
    #[must_use]
    pub const fn error_type(self) -> &'static str {
        match self {
            Self::List => "error",
            Self::Create => "create_error",
            Self::Destroy => "destroy_error",
            Self::Start => "start_error",
            Self::Stop => "stop_error",
            Self::Inspect => "inspect_error",
        }
    }
}

/// Fields of a `create` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Requested container name.
    pub container_name: String,
    /// Hex public key of the owning tenant.
    pub owner_pubkey: String,
    /// Contract id; must be a well-formed UUID.
    pub contract_id: String,
    /// Image reference, optionally carrying a `--<size>` tag.
    pub image: String,
    /// Outbound IPv6 address handed to the user installer (may be empty).
    pub outbound_ipv6: String,
    /// Outbound network interface handed to the user installer (may be
    /// empty).
    pub outbound_net_interface: String,
    /// Initiation config overlay.
    pub config: ConfigOverlay,
}

/// A parsed request record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `list`
    List,
    /// `create`
    Create(Box<CreateRequest>),
    /// `destroy`
    Destroy {
        /// Target container.
        container_name: String,
    },
    /// `start`
    Start {
        /// Target container.
        container_name: String,
    },
    /// `stop`
    Stop {
        /// Target container.
        container_name: String,
    },
    /// `inspect`
    Inspect {
        /// Target container.
        container_name: String,
    },
}

impl Request {
    /// The registry entry this request was parsed as.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::List => RequestKind::List,
            Self::Create(_) => RequestKind::Create,
            Self::Destroy { .. } => RequestKind::Destroy,
            Self::Start { .. } => RequestKind::Start,
            Self::Stop { .. } => RequestKind::Stop,
            Self::Inspect { .. } => RequestKind::Inspect,
        }
    }
}

/// How a frame failed to parse, carrying enough to name the error
/// response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Not JSON, not an object, or no string `type` field. Answered with
    /// `{"type":"error","content":"format_error"}`.
    Format,
    /// A well-formed envelope with an unrecognized type. Answered with
    /// `{"type":"error","content":"type_error"}`.
    UnknownType,
    /// A recognized type with missing or ill-typed fields. Answered with
    /// the type's own error response and `format_error` content.
    Fields(RequestKind),
}

impl ParseError {
    /// The response `type` for this failure.
    #[must_use]
    pub const fn response_type(&self) -> &'static str {
        match self {
            Self::Format | Self::UnknownType => "error",
            Self::Fields(kind) => kind.error_type(),
        }
    }

    /// The response content tag for this failure.
    #[must_use]
    pub const fn content_tag(&self) -> &'static str {
        match self {
            Self::Format | Self::Fields(_) => FORMAT_ERROR,
            Self::UnknownType => TYPE_ERROR,
        }
    }
}

fn required_str(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// Parses one frame payload into a request record.
///
/// The whole payload must be a single JSON object; trailing bytes fail the
/// parse.
///
/// # Errors
///
/// Returns a [`ParseError`] naming the response to send.
pub fn parse_request(payload: &[u8]) -> Result<Request, ParseError> {
    let doc: Value = serde_json::from_slice(payload).map_err(|_| ParseError::Format)?;
    let obj = doc.as_object().ok_or(ParseError::Format)?;
    let type_str = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ParseError::Format)?;
    let kind = RequestKind::from_type_str(type_str).ok_or(ParseError::UnknownType)?;

    let fields = ParseError::Fields(kind);
    match kind {
        RequestKind::List => Ok(Request::List),
        RequestKind::Create => {
            let config_value = obj.get("config").cloned().ok_or(fields)?;
            if !config_value.is_object() {
                return Err(fields);
            }
            let config: ConfigOverlay =
                serde_json::from_value(config_value).map_err(|_| fields)?;
            Ok(Request::Create(Box::new(CreateRequest {
                container_name: required_str(obj, "container_name").ok_or(fields)?,
                owner_pubkey: required_str(obj, "owner_pubkey").ok_or(fields)?,
                contract_id: required_str(obj, "contract_id").ok_or(fields)?,
                image: required_str(obj, "image").ok_or(fields)?,
                outbound_ipv6: required_str(obj, "outbound_ipv6").ok_or(fields)?,
                outbound_net_interface: required_str(obj, "outbound_net_interface")
                    .ok_or(fields)?,
                config,
            })))
        }
        RequestKind::Destroy | RequestKind::Start | RequestKind::Stop | RequestKind::Inspect => {
            let container_name = required_str(obj, "container_name").ok_or(fields)?;
            Ok(match kind {
                RequestKind::Destroy => Request::Destroy { container_name },
                RequestKind::Start => Request::Start { container_name },
                RequestKind::Stop => Request::Stop { container_name },
                _ => Request::Inspect { container_name },
            })
        }
    }
}

/// Builds `{"type": t, "content": <string>}`.
#[must_use]
pub fn build_tag_response(response_type: &str, tag: &str) -> Vec<u8> {
    json!({ "type": response_type, "content": tag })
        .to_string()
        .into_bytes()
}

/// Builds `{"type": t, "content": <object>}` with the content embedded as
/// parsed JSON rather than a string.
#[must_use]
pub fn build_object_response(response_type: &str, content: Value) -> Vec<u8> {
    json!({ "type": response_type, "content": content })
        .to_string()
        .into_bytes()
}

/// Builds the parse-failure response for a rejected frame.
#[must_use]
pub fn build_parse_error_response(err: &ParseError) -> Vec<u8> {
    build_tag_response(err.response_type(), err.content_tag())
}

/// Builds a `create_res` or `inspect_res` content body.
#[must_use]
pub fn instance_value(info: &InstanceInfo) -> Value {
    serde_json::to_value(info).unwrap_or(Value::Null)
}

/// Builds the `list_res` content: instance records merged with lease rows
/// by container name.
#[must_use]
pub fn list_value(instances: &[InstanceInfo], leases: &[LeaseInfo]) -> Value {
    let entries: Vec<Value> = instances
        .iter()
        .map(|info| {
            let mut entry = instance_value(info);
            if let Some(lease) = leases
                .iter()
                .find(|lease| lease.container_name == info.container_name)
            {
                if let Some(obj) = entry.as_object_mut() {
                    obj.insert("timestamp".into(), lease.timestamp.into());
                    obj.insert(
                        "tenant_xrp_address".into(),
                        lease.tenant_xrp_address.clone().into(),
                    );
                    obj.insert("created_on_ledger".into(), lease.created_on_ledger.into());
                    obj.insert("life_moments".into(), lease.life_moments.into());
                }
            }
            entry
        })
        .collect();
    Value::Array(entries)
}

/// Builds the `initiate_error` content object: the instance was created
/// but could not be initiated, so the client learns the name it must
/// destroy alongside the error tag.
#[must_use]
pub fn initiate_error_value(container_name: &str, error_tag: &str) -> Value {
    json!({ "container_name": container_name, "error": error_tag })
}
