//! Minimal subscriber client: enough protocol to consume snapshots and
//! drive the server from tests and tooling.

use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::proto::{self, McpRequest, McpResponse, StatusDetail};
use crate::McpError;

pub struct McpClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    sink_id: String,
}

impl McpClient {
    pub async fn connect(addr: impl ToSocketAddrs, sink_id: &str) -> Result<Self, McpError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
            sink_id: sink_id.to_string(),
        })
    }

    /// Declare interest in a collection; the server responds with the
    /// current snapshot.
    pub async fn subscribe(&mut self, collection: &str) -> Result<(), McpError> {
        self.send(McpRequest {
            collection: collection.to_string(),
            version_info: String::new(),
            response_nonce: String::new(),
            sink_id: self.sink_id.clone(),
            error_detail: None,
        })
        .await
    }

    /// Next server frame; `Err(Closed)` on clean connection end.
    pub async fn recv(&mut self) -> Result<McpResponse, McpError> {
        match self.framed.next().await {
            None => Err(McpError::Closed),
            Some(Err(e)) => Err(McpError::Io(e)),
            Some(Ok(bytes)) => Ok(McpResponse::decode(bytes.freeze())?),
        }
    }

    /// Accept a snapshot, unblocking the next push for its collection.
    pub async fn ack(&mut self, response: &McpResponse) -> Result<(), McpError> {
        self.send(McpRequest {
            collection: response.collection.clone(),
            version_info: response.version_info.clone(),
            response_nonce: response.nonce.clone(),
            sink_id: self.sink_id.clone(),
            error_detail: None,
        })
        .await
    }

    /// Reject a snapshot. The server records the rejection and pushes
    /// again only once the collection changes.
    pub async fn nack(&mut self, response: &McpResponse, message: &str) -> Result<(), McpError> {
        self.send(McpRequest {
            collection: response.collection.clone(),
            version_info: response.version_info.clone(),
            response_nonce: response.nonce.clone(),
            sink_id: self.sink_id.clone(),
            error_detail: Some(StatusDetail { code: 3, message: message.to_string() }),
        })
        .await
    }

    async fn send(&mut self, request: McpRequest) -> Result<(), McpError> {
        self.framed.send(proto::encode(&request)).await.map_err(McpError::Io)
    }
}
