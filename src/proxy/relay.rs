//! Bidirectional relay between a client and a dialed connection

use crate::transport::{StreamConn, StreamConnExt};
use std::io;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How a relay ended
#[derive(Debug)]
pub enum RelayOutcome {
    /// Both directions reached EOF
    Completed { to_remote: u64, to_client: u64 },
    /// The cancellation token fired
    Cancelled,
    /// A read or write failed
    Failed(io::Error),
}

impl RelayOutcome {
    /// Whether the relay ended without an I/O error
    pub fn is_clean(&self) -> bool {
        !matches!(self, RelayOutcome::Failed(_))
    }
}

/// Copy both directions until both finish, one fails, or `cancel` fires.
///
/// EOF from one side becomes `close_write` on the other. Both ends are
/// closed before returning.
pub async fn relay<A, B>(mut client: A, mut remote: B, cancel: CancellationToken) -> RelayOutcome
where
    A: StreamConn,
    B: StreamConn,
{
    let outcome = tokio::select! {
        _ = cancel.cancelled() => RelayOutcome::Cancelled,
        result = tokio::io::copy_bidirectional(&mut client, &mut remote) => match result {
            Ok((to_remote, to_client)) => RelayOutcome::Completed { to_remote, to_client },
            Err(e) => RelayOutcome::Failed(e),
        },
    };

    if let Err(e) = client.close().await {
        trace!("relay: closing client: {}", e);
    }
    if let Err(e) = remote.close().await {
        trace!("relay: closing remote: {}", e);
    }

    match &outcome {
        RelayOutcome::Completed { to_remote, to_client } => {
            debug!("relay finished: {} bytes up, {} bytes down", to_remote, to_client)
        }
        RelayOutcome::Cancelled => debug!("relay cancelled"),
        RelayOutcome::Failed(e) => debug!("relay failed: {}", e),
    }
    outcome
}
