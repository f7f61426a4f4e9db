//! gRPC shard transport
//!
//! Every request carries the namespace `label` as metadata and, when a
//! [`JwtTokenGetter`] is configured, an `authorization: bearer <token>`
//! header. Each call is bounded by the configured request timeout. Closing
//! a client releases its channel and fails every later request.

use crate::{Dialer, JwtTokenGetter, KeyStream, ShardClient};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, warn};
use zstor_common::{DataStorConfig, Error, ObjectStatus, Result, display_key};
use zstor_proto::datastor::object_manager_client::ObjectManagerClient;
use zstor_proto::datastor::{
    DeleteObjectRequest, GetObjectRequest, GetObjectStatusRequest, ListObjectKeysRequest,
    ObjectStatus as ProtoObjectStatus, SetObjectRequest,
};

/// Metadata key carrying the namespace label
const LABEL_HEADER: &str = "label";

/// Metadata key carrying the JWT token
const AUTHORIZATION_HEADER: &str = "authorization";

/// Dialer opening gRPC connections to shards
#[derive(Clone)]
pub struct GrpcDialer {
    token_getter: Option<Arc<dyn JwtTokenGetter>>,
    request_timeout: Duration,
    max_message_size: usize,
}

impl GrpcDialer {
    /// Create a dialer from the datastor configuration
    #[must_use]
    pub fn from_config(
        config: &DataStorConfig,
        token_getter: Option<Arc<dyn JwtTokenGetter>>,
    ) -> Self {
        Self {
            token_getter,
            request_timeout: config.request_timeout(),
            max_message_size: config.max_message_size,
        }
    }
}

#[async_trait]
impl Dialer for GrpcDialer {
    async fn dial(&self, address: &str, label: &str) -> Result<Arc<dyn ShardClient>> {
        let channel = endpoint(address)?
            .connect_timeout(self.request_timeout)
            .connect()
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{address}: {e}")))?;
        debug!("Connected to shard at {}", address);

        Ok(Arc::new(GrpcShardClient::from_channel(
            channel,
            address,
            label,
            self.token_getter.clone(),
            self.request_timeout,
            self.max_message_size,
        )))
    }
}

fn endpoint(address: &str) -> Result<Endpoint> {
    let uri = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    Endpoint::from_shared(uri)
        .map_err(|e| Error::invalid_argument(format!("invalid shard address {address}: {e}")))
}

/// Shard client speaking the `ObjectManager` gRPC service
pub struct GrpcShardClient {
    /// `None` once closed
    client: Mutex<Option<ObjectManagerClient<Channel>>>,
    address: String,
    label: String,
    token_getter: Option<Arc<dyn JwtTokenGetter>>,
    timeout: Duration,
}

impl GrpcShardClient {
    /// Wrap an established channel
    #[must_use]
    pub fn from_channel(
        channel: Channel,
        address: &str,
        label: &str,
        token_getter: Option<Arc<dyn JwtTokenGetter>>,
        timeout: Duration,
        max_message_size: usize,
    ) -> Self {
        let client = ObjectManagerClient::new(channel)
            .max_decoding_message_size(max_message_size)
            .max_encoding_message_size(max_message_size);
        Self {
            client: Mutex::new(Some(client)),
            address: address.to_string(),
            label: label.to_string(),
            token_getter,
            timeout,
        }
    }

    /// Handle on the channel, unless the client was closed
    fn connection(&self) -> Result<ObjectManagerClient<Channel>> {
        self.client.lock().clone().ok_or_else(|| {
            Error::ConnectionFailed(format!("connection to {} is closed", self.address))
        })
    }

    /// Build a request carrying the label and, if configured, the JWT token
    async fn request<T>(&self, message: T) -> Result<tonic::Request<T>> {
        let mut request = tonic::Request::new(message);
        request.set_timeout(self.timeout);

        let label = AsciiMetadataValue::try_from(self.label.as_str())
            .map_err(|_| Error::invalid_argument("label is not valid ASCII"))?;
        request.metadata_mut().insert(LABEL_HEADER, label);

        if let Some(getter) = &self.token_getter {
            let token = getter.get_jwt_token(&self.label).await?;
            let value = AsciiMetadataValue::try_from(format!("bearer {token}"))
                .map_err(|_| Error::invalid_argument("JWT token is not valid ASCII"))?;
            request.metadata_mut().insert(AUTHORIZATION_HEADER, value);
        }
        Ok(request)
    }

    /// Await a call within the request timeout
    async fn call<F, T>(&self, key: &[u8], fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<tonic::Response<T>, Status>>,
    {
        let response = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| {
                warn!("Timeout waiting for shard {}", self.address);
                Error::Timeout
            })?
            .map_err(|status| status_to_error(&status, &self.address, key))?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl ShardClient for GrpcShardClient {
    async fn set_object(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let request = self
            .request(SetObjectRequest {
                key: key.to_vec(),
                data: data.to_vec(),
            })
            .await?;
        let mut client = self.connection()?;
        let response = self.call(key, client.set_object(request)).await?;
        if response.key.is_empty() {
            return Ok(key.to_vec());
        }
        Ok(response.key)
    }

    async fn get_object(&self, key: &[u8]) -> Result<Vec<u8>> {
        let request = self.request(GetObjectRequest { key: key.to_vec() }).await?;
        let mut client = self.connection()?;
        Ok(self.call(key, client.get_object(request)).await?.data)
    }

    async fn delete_object(&self, key: &[u8]) -> Result<()> {
        let request = self.request(DeleteObjectRequest { key: key.to_vec() }).await?;
        let mut client = self.connection()?;
        self.call(key, client.delete_object(request)).await?;
        Ok(())
    }

    async fn get_object_status(&self, key: &[u8]) -> Result<ObjectStatus> {
        let request = self
            .request(GetObjectStatusRequest { key: key.to_vec() })
            .await?;
        let mut client = self.connection()?;
        let response = self.call(key, client.get_object_status(request)).await?;
        match ProtoObjectStatus::try_from(response.status) {
            Ok(ProtoObjectStatus::Missing) => Ok(ObjectStatus::Missing),
            Ok(ProtoObjectStatus::Ok) => Ok(ObjectStatus::Ok),
            Ok(ProtoObjectStatus::Corrupted) => Ok(ObjectStatus::Corrupted),
            Err(_) => Err(Error::InvalidResponse(format!(
                "unknown object status {}",
                response.status
            ))),
        }
    }

    async fn list_object_keys(&self) -> Result<KeyStream> {
        let request = self.request(ListObjectKeysRequest {}).await?;
        let mut client = self.connection()?;
        let stream = self.call(&[], client.list_object_keys(request)).await?;

        let address = self.address.clone();
        Ok(stream
            .map(move |item| match item {
                Ok(response) if response.key.is_empty() => Err(Error::InvalidResponse(
                    "listed key is empty".to_string(),
                )),
                Ok(response) => Ok(response.key),
                Err(status) => Err(status_to_error(&status, &address, &[])),
            })
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        // The channel is torn down once in-flight requests drop their clones
        if self.client.lock().take().is_some() {
            debug!("Closed connection to shard {}", self.address);
        }
        Ok(())
    }
}

/// Map a gRPC status onto the shared error kinds
fn status_to_error(status: &Status, address: &str, key: &[u8]) -> Error {
    match status.code() {
        Code::NotFound => Error::KeyNotFound {
            key: display_key(key),
        },
        Code::DataLoss => Error::ObjectCorrupted {
            key: display_key(key),
        },
        Code::PermissionDenied | Code::Unauthenticated => Error::PermissionDenied,
        Code::DeadlineExceeded => Error::Timeout,
        Code::Cancelled => Error::Cancelled,
        Code::Unavailable => {
            Error::ServiceUnavailable(format!("{address}: {}", status.message()))
        }
        Code::InvalidArgument => Error::invalid_argument(status.message()),
        _ => Error::internal(format!("shard {address}: {status}")),
    }
}
