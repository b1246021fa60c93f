//! Reclamation worker.
//!
//! Sessions whose units have both finished are queued here by the second
//! finisher. The reaper joins both units, removes the session from the
//! registry and, once shutdown has emptied the live set, signals that the
//! server has drained.
//!
//! Cleanup runs off the accept path, one session at a time. A unit that
//! ended abnormally is logged and does not stop the reaper.

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    registry::Reclaimed,
    server::SharedState,
    session::Session,
    state::Unit,
};

/// Producer side of the reclamation queue.
pub(crate) type ReclaimSender = mpsc::UnboundedSender<Arc<Session>>;

/// Consumer side of the reclamation queue.
pub(crate) type ReclaimQueue = mpsc::UnboundedReceiver<Arc<Session>>;

pub(crate) struct Reaper {
    shared: Arc<SharedState>,
    queue: ReclaimQueue,
}

impl Reaper {
    /// Spawn the reaper task.
    pub(crate) fn spawn(shared: Arc<SharedState>, queue: ReclaimQueue) -> JoinHandle<()> {
        tokio::spawn(Self { shared, queue }.run())
    }

    async fn run(mut self) {
        tracing::debug!("reaper started");
        let drained = self.shared.drained_token();

        loop {
            tokio::select! {
                biased;

                Some(session) = self.queue.recv() => {
                    if self.reclaim(&session).await.drained() {
                        tracing::info!("all sessions reclaimed");
                        drained.cancel();
                        break;
                    }
                },
                // Shutdown found no live sessions, nothing will be queued
                () = drained.cancelled() => break,
            }
        }

        tracing::debug!("reaper stopped");
    }

    async fn reclaim(&self, session: &Arc<Session>) -> Reclaimed {
        let units = session.take_units();
        assert!(units.is_some(), "invariant: session {} reclaimed twice", session.id());

        if let Some((reader, writer)) = units {
            join_unit(session, Unit::Reader, reader).await;
            join_unit(session, Unit::Writer, writer).await;
        }
        debug_assert!(session.state().is_quiesced());

        let reclaimed = self.shared.registry.reclaim(session);
        tracing::info!(
            session = session.id(),
            name = session.display_name(),
            remaining = reclaimed.remaining,
            "session reclaimed"
        );
        reclaimed
    }
}

async fn join_unit(session: &Session, unit: Unit, handle: JoinHandle<()>) {
    if let Err(err) = handle.await {
        tracing::error!(session = session.id(), ?unit, "unit did not exit cleanly: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn reaper_drains_after_shutdown() {
        let (shared, queue) = SharedState::for_tests();
        let reaper = Reaper::spawn(Arc::clone(&shared), queue);

        let (client_end, server_end) = tokio::io::duplex(256);
        let session = shared.new_session(None);
        assert!(shared.registry.admit(Arc::clone(&session)));
        let (input, output) = tokio::io::split(server_end);
        session.start(input, output);

        shared.shutdown();

        timeout(WAIT, reaper).await.unwrap().unwrap();
        assert!(shared.drained_token().is_cancelled());
        assert_eq!(shared.registry.live_count(), 0);
        drop(client_end);
    }

    #[tokio::test]
    async fn reaper_keeps_running_without_shutdown() {
        let (shared, queue) = SharedState::for_tests();
        let reaper = Reaper::spawn(Arc::clone(&shared), queue);

        for _ in 0..3 {
            let (client_end, server_end) = tokio::io::duplex(256);
            let session = shared.new_session(None);
            assert!(shared.registry.admit(Arc::clone(&session)));
            let (input, output) = tokio::io::split(server_end);
            session.start(input, output);
            // Peer hangs up immediately
            drop(client_end);
        }

        timeout(WAIT, async {
            while shared.registry.live_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(!reaper.is_finished());
        assert!(!shared.drained_token().is_cancelled());
        reaper.abort();
    }

    #[tokio::test]
    async fn shutdown_with_no_sessions_stops_reaper() {
        let (shared, queue) = SharedState::for_tests();
        let reaper = Reaper::spawn(Arc::clone(&shared), queue);

        shared.shutdown();
        timeout(WAIT, reaper).await.unwrap().unwrap();
    }
}
