use crate::{Error, Result};
use std::time::Duration;
use tokio::{net::TcpStream, time::timeout};
use tracing::debug;

/// Dial `endpoint` (host:port) within `dial_timeout`.
/// Any failure, the timeout included, means unreachable.
pub async fn check_reachable(endpoint: &str, dial_timeout: Duration) -> Result<()> {
    match timeout(dial_timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(_)) => {
            debug!("{endpoint} is reachable");
            Ok(())
        }
        Ok(Err(e)) => Err(Error::Unreachable(endpoint.to_string(), e.to_string())),
        Err(_) => Err(Error::Unreachable(
            endpoint.to_string(),
            format!("no answer within {}s", dial_timeout.as_secs_f32()),
        )),
    }
}
