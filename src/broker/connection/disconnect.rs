//! Connection teardown and will publication

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::{Connection, State};
use crate::broker::{BrokerEvent, CloseReason, Origin};
use crate::protocol::{Publish, Will};

/// Whether a connection ending this way publishes its will
pub(crate) fn publishes_will(reason: CloseReason) -> bool {
    matches!(
        reason,
        CloseReason::KeepAliveTimeout | CloseReason::NetworkError | CloseReason::ProtocolError
    )
}

fn will_publish(will: Will) -> Publish {
    Publish {
        dup: false,
        qos: will.qos,
        retain: will.retain,
        topic: Arc::from(will.topic),
        packet_id: None,
        payload: will.payload,
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Release the session after the connection ended
    ///
    /// A connection that lost its session to a takeover leaves it untouched.
    pub(crate) async fn cleanup(&mut self, reason: CloseReason) {
        let State::Connected { client_id, session } =
            std::mem::replace(&mut self.state, State::Closed)
        else {
            return;
        };
        let shared = self.shared.clone();
        let router = &shared.router;

        let (owned, clean_start, will) = {
            let mut s = session.write();
            let owned = s.detach(self.conn_id, Instant::now());
            let will = if owned { s.will.take() } else { None };
            if owned {
                router.persist_session(&s);
            }
            (owned, s.clean_start, will)
        };

        if owned && clean_start {
            router.sessions().destroy_if_current(&session);
            debug!("Clean session {} removed", client_id);
        }

        shared
            .connections
            .remove_if(&client_id, |_, conn_id| *conn_id == self.conn_id);

        if let Some(will) = will {
            if publishes_will(reason) {
                info!("Publishing will of {} to {}", client_id, will.topic);
                router.route(&will_publish(will), Origin::Will(client_id.clone()));
            } else {
                debug!("Will of {} discarded ({:?})", client_id, reason);
            }
        }

        info!("Client disconnected: {} ({:?})", client_id, reason);
        router.emit(BrokerEvent::ConnectionClosed {
            client_id: client_id.clone(),
            reason,
        });
        shared
            .hooks
            .on_disconnected(&client_id, reason == CloseReason::Disconnect)
            .await;
    }
}
