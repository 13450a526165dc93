//! The service descriptor data model (spec.md §3, "Service descriptor").
//!
//! The original source keys a `RpcHandlerInfo` by method short-name inside a
//! `Service`, carrying protobuf `Descriptor*` pointers for the request and
//! response types. This crate has no code-generated message schema (that is
//! explicitly out of scope, spec.md §1), so a `MessageDescriptor` is just a
//! type-erased name/`TypeId` pair used for the boundary type check
//! spec.md §4.9's "Dynamic dispatch" note requires.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crate::handler::RpcHandlerFactory;

/// One of the four RPC shapes spec.md §1 names.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StreamType {
    Unary,
    ClientStreaming,
    ServerStreaming,
    BidiStreaming,
}

impl StreamType {
    /// Whether the server is expected to arm another `READ` immediately
    /// after handling one (spec.md §4.3 transition table).
    pub fn reads_until_half_close(self) -> bool {
        matches!(self, StreamType::ClientStreaming | StreamType::BidiStreaming)
    }

    /// Whether the client is allowed to write more than one request.
    pub fn client_streams(self) -> bool {
        matches!(self, StreamType::ClientStreaming | StreamType::BidiStreaming)
    }

    /// Whether the server is allowed to write more than one response.
    pub fn server_streams(self) -> bool {
        matches!(self, StreamType::ServerStreaming | StreamType::BidiStreaming)
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamType::Unary => "UNARY",
            StreamType::ClientStreaming => "CLIENT_STREAMING",
            StreamType::ServerStreaming => "SERVER_STREAMING",
            StreamType::BidiStreaming => "BIDI_STREAMING",
        };
        f.write_str(s)
    }
}

/// Type-erased stand-in for a protobuf `Descriptor*`: enough to check that a
/// request/response message handed across the framework boundary is of the
/// type the registered handler expects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MessageDescriptor {
    pub name: &'static str,
    pub type_id: TypeId,
}

impl MessageDescriptor {
    pub fn of<T: Any>(name: &'static str) -> Self {
        Self { name, type_id: TypeId::of::<T>() }
    }

    pub fn matches(&self, value: &dyn Any) -> bool {
        value.type_id() == self.type_id
    }
}

/// Immutable, per-method registration record (spec.md §3 `MethodInfo`).
///
/// Created once at `RegisterHandler` time and never mutated afterward;
/// `Service` stores these in a `method_name -> MethodInfo` map.
#[derive(Clone)]
pub struct MethodInfo {
    pub request_descriptor: MessageDescriptor,
    pub response_descriptor: MessageDescriptor,
    pub stream_type: StreamType,
    pub handler_factory: RpcHandlerFactory,
    /// `/service.package.Service/Method`, see `parse_method_full_name`.
    pub fully_qualified_name: Arc<str>,
}

impl fmt::Debug for MethodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodInfo")
            .field("fully_qualified_name", &self.fully_qualified_name)
            .field("stream_type", &self.stream_type)
            .field("request_descriptor", &self.request_descriptor)
            .field("response_descriptor", &self.response_descriptor)
            .finish()
    }
}

/// Splits `/service.package.Service/Method` into `(service_full_name,
/// method_name)`, as spec.md §6 requires of the server builder surface.
pub fn parse_method_full_name(full_name: &str) -> anyhow::Result<(String, String)> {
    let trimmed = full_name.strip_prefix('/').unwrap_or(full_name);
    let (service, method) = trimmed
        .rsplit_once('/')
        .ok_or_else(|| anyhow::anyhow!("malformed method full name: {full_name:?}"))?;
    if service.is_empty() || method.is_empty() {
        anyhow::bail!("malformed method full name: {full_name:?}");
    }
    Ok((service.to_string(), method.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_name() {
        let (service, method) = parse_method_full_name("/cartographer.Trajectory/GetSquare")
            .expect("should parse");
        assert_eq!(service, "cartographer.Trajectory");
        assert_eq!(method, "GetSquare");
    }

    #[test]
    fn rejects_malformed_name() {
        assert!(parse_method_full_name("NoSlash").is_err());
        assert!(parse_method_full_name("/OnlyService").is_err());
    }
}
