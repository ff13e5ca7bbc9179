//! Periodic liveness frames.

use std::time::Duration;

use tokio::time::sleep;
use tracing::trace;

use super::Session;
use crate::codec::Message;

/// Send a heartbeat every `interval` until the session closes or a write
/// fails. A failed write is left for the dispatcher to notice.
pub(super) async fn run(session: Session, interval: Duration) {
    loop {
        sleep(interval).await;
        if session.is_closed() {
            break;
        }
        if let Err(e) = session.send(&Message::Heartbeat).await {
            trace!("Heartbeat to {} stopped: {}", session.peer_label(), e);
            break;
        }
        trace!("Heartbeat sent to {}", session.peer_label());
    }
}
