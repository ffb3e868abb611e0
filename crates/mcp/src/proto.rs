//! Wire messages, written as the prost derives code generation would
//! emit so no protoc step is needed at build time.

use prost::Message;

/// Subscriber-to-server frame: initial subscription, ack, or nack.
///
/// A subscription carries empty `version_info`/`response_nonce`; an ack
/// echoes both from the response it acknowledges; a nack additionally
/// sets `error_detail`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct McpRequest {
    #[prost(string, tag = "1")]
    pub collection: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub version_info: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub response_nonce: ::prost::alloc::string::String,
    /// Identifier the subscriber presents for itself; used for logs and
    /// monitoring only.
    #[prost(string, tag = "4")]
    pub sink_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "5")]
    pub error_detail: ::core::option::Option<StatusDetail>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusDetail {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

/// One resource inside a response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub version: ::prost::alloc::string::String,
    #[prost(int64, tag = "3")]
    pub created_at_unix: i64,
    /// Canonical payload as JSON bytes.
    #[prost(bytes = "vec", tag = "4")]
    pub body: ::prost::alloc::vec::Vec<u8>,
}

/// Server-to-subscriber frame: a full snapshot of one collection, or a
/// clean end-of-stream marker during shutdown.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct McpResponse {
    #[prost(string, tag = "1")]
    pub collection: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub version_info: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub nonce: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "4")]
    pub envelopes: ::prost::alloc::vec::Vec<Envelope>,
    #[prost(bool, tag = "5")]
    pub end_of_stream: bool,
}

pub fn encode<M: Message>(msg: &M) -> bytes::Bytes {
    let mut buf = bytes::BytesMut::with_capacity(msg.encoded_len());
    msg.encode(&mut buf).expect("BytesMut grows on demand");
    buf.freeze()
}
