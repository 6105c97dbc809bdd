use async_trait::async_trait;

use crate::error::Result;
use crate::rpc::messages::{GovernorRequest, Reply};

/// Outbound request channel to one peer governor.
///
/// The TCP implementation lives in [`crate::rpc::client`]; tests plug in
/// in-memory links.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Address the link dials, also used as its membership key.
    fn addr(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Dial the peer if the link is down. Returns true when this call
    /// established a fresh connection.
    async fn ensure_connected(&self) -> Result<bool>;

    /// Send one request and wait for its reply. Error replies are returned
    /// as `Reply::Error`, transport failures as `Err`.
    async fn call(&self, request: GovernorRequest) -> Result<Reply>;
}
