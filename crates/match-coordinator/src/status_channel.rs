//! Lobby status channel with push and polling transports
//!
//! Consumers see a single stream of snapshots. The push channel is tried
//! first; if it cannot be opened, errors, or closes, the background task
//! switches to polling without the consumer noticing.

use crate::lobby::LobbyService;
use crate::types::MatchStatus;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct MatchStatusChannel {
    lobby: Arc<dyn LobbyService>,
    poll_interval: Duration,
    push: bool,
}

impl MatchStatusChannel {
    /// Create a new channel; nothing runs until the first subscribe
    pub fn new(lobby: Arc<dyn LobbyService>, poll_interval: Duration) -> Self {
        Self {
            lobby,
            poll_interval,
            push: true,
        }
    }

    /// Skip the push channel entirely
    pub fn polling_only(mut self) -> Self {
        self.push = false;
        self
    }

    /// Start delivering snapshots. Nothing runs until this is called, and
    /// dropping the subscription stops the background task.
    pub fn subscribe(&self) -> StatusSubscription {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(drive(
            self.lobby.clone(),
            self.push,
            self.poll_interval,
            tx,
        ));
        StatusSubscription { rx, task }
    }
}

async fn drive(
    lobby: Arc<dyn LobbyService>,
    push: bool,
    poll_interval: Duration,
    tx: mpsc::Sender<MatchStatus>,
) {
    if push {
        match lobby.open_updates().await {
            Ok(mut updates) => {
                // the stream only reports changes; read the current state once
                match lobby.fetch_status().await {
                    Ok(status) => {
                        if tx.send(status).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::debug!("Initial lobby status read failed: {}", e),
                }

                while let Some(update) = updates.next().await {
                    match update {
                        Ok(status) => {
                            if tx.send(status).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Lobby push failed: {}", e);
                            break;
                        }
                    }
                }
                tracing::info!("Lobby push channel gone, falling back to polling");
            }
            Err(e) => tracing::info!("Lobby push unavailable ({}), polling instead", e),
        }
    }

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match lobby.fetch_status().await {
            Ok(status) => {
                if tx.send(status).await.is_err() {
                    return;
                }
            }
            Err(e) => tracing::warn!("Lobby status poll failed: {}", e),
        }
    }
}

/// Live subscription to lobby snapshots
pub struct StatusSubscription {
    rx: mpsc::Receiver<MatchStatus>,
    task: JoinHandle<()>,
}

impl StatusSubscription {
    /// Next snapshot, or `None` once the channel is gone
    pub async fn next(&mut self) -> Option<MatchStatus> {
        self.rx.recv().await
    }

    /// Skip snapshots until everyone is ready and both settlement
    /// addresses are known
    pub async fn wait_until_complete(&mut self) -> Option<MatchStatus> {
        while let Some(status) = self.next().await {
            if status.is_complete() {
                return Some(status);
            }
            tracing::debug!(
                "Lobby: {}/{} ready",
                status.ready_participants.len(),
                status.participants.len()
            );
        }
        None
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobby::LobbyError;
    use crate::tests::support::{complete_status, waiting_status, ScriptedLobby};
    use solana_sdk::pubkey::Pubkey;

    #[tokio::test(start_paused = true)]
    async fn test_push_delivers_updates() {
        let (a, b) = (Pubkey::new_unique(), Pubkey::new_unique());
        let lobby = Arc::new(
            ScriptedLobby::polling(vec![waiting_status(&a, &b)])
                .with_push(vec![Ok(complete_status(&a, &b))], true),
        );
        let channel = MatchStatusChannel::new(lobby.clone(), Duration::from_secs(2));

        let mut sub = channel.subscribe();
        let status = sub.wait_until_complete().await.unwrap();
        assert!(status.all_ready);
        // only the initial read, no polling
        assert_eq!(lobby.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_polling_on_push_error() {
        let (a, b) = (Pubkey::new_unique(), Pubkey::new_unique());
        let lobby = Arc::new(
            ScriptedLobby::polling(vec![
                waiting_status(&a, &b),
                waiting_status(&a, &b),
                complete_status(&a, &b),
            ])
            .with_push(vec![Err(LobbyError::Stream("reset".into()))], false),
        );
        let channel = MatchStatusChannel::new(lobby.clone(), Duration::from_secs(2));

        let mut sub = channel.subscribe();
        let status = sub.wait_until_complete().await.unwrap();
        assert!(status.is_complete());
        assert!(lobby.fetch_count() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_when_push_unavailable() {
        let (a, b) = (Pubkey::new_unique(), Pubkey::new_unique());
        let lobby = Arc::new(ScriptedLobby::polling(vec![
            waiting_status(&a, &b),
            complete_status(&a, &b),
        ]));
        let channel = MatchStatusChannel::new(lobby.clone(), Duration::from_secs(2));

        let mut sub = channel.subscribe();
        assert!(!sub.next().await.unwrap().all_ready);
        assert!(sub.next().await.unwrap().all_ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_polling() {
        let (a, b) = (Pubkey::new_unique(), Pubkey::new_unique());
        let lobby = Arc::new(ScriptedLobby::polling(vec![waiting_status(&a, &b)]));
        let channel =
            MatchStatusChannel::new(lobby.clone(), Duration::from_secs(2)).polling_only();

        let mut sub = channel.subscribe();
        sub.next().await.unwrap();
        drop(sub);

        let before = lobby.fetch_count();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(lobby.fetch_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_start() {
        let (a, b) = (Pubkey::new_unique(), Pubkey::new_unique());
        let lobby = Arc::new(ScriptedLobby::polling(vec![waiting_status(&a, &b)]));
        let _channel = MatchStatusChannel::new(lobby.clone(), Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(lobby.fetch_count(), 0);
    }
}
