//! Test doubles shared by the coordinator tests

use crate::lobby::{LobbyError, LobbyService, StatusUpdates};
use crate::types::MatchStatus;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use solana_sdk::pubkey::Pubkey;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Lobby that replays scripted snapshots. Each fetch pops the next
/// snapshot; the last one repeats forever.
pub struct ScriptedLobby {
    snapshots: Mutex<VecDeque<MatchStatus>>,
    push: Mutex<Option<(Vec<Result<MatchStatus, LobbyError>>, bool)>>,
    fetches: AtomicUsize,
}

impl ScriptedLobby {
    pub fn polling(snapshots: Vec<MatchStatus>) -> Self {
        Self {
            snapshots: Mutex::new(snapshots.into()),
            push: Mutex::new(None),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Serve `script` over the push channel once. With `hold_open` the
    /// stream stays open after the script instead of ending.
    pub fn with_push(self, script: Vec<Result<MatchStatus, LobbyError>>, hold_open: bool) -> Self {
        *self.push.lock() = Some((script, hold_open));
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LobbyService for ScriptedLobby {
    async fn fetch_status(&self) -> Result<MatchStatus, LobbyError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut snapshots = self.snapshots.lock();
        let status = if snapshots.len() > 1 {
            snapshots.pop_front()
        } else {
            snapshots.front().cloned()
        };
        status.ok_or_else(|| LobbyError::Status(404))
    }

    async fn open_updates(&self) -> Result<StatusUpdates, LobbyError> {
        let Some((script, hold_open)) = self.push.lock().take() else {
            return Err(LobbyError::Stream("push disabled".into()));
        };
        let items = futures::stream::iter(script);
        if hold_open {
            Ok(items.chain(futures::stream::pending()).boxed())
        } else {
            Ok(items.boxed())
        }
    }
}

pub fn waiting_status(a: &Pubkey, b: &Pubkey) -> MatchStatus {
    MatchStatus {
        all_ready: false,
        participants: vec![*a, *b],
        ready_participants: vec![*a],
        settlement_address_lower: None,
        settlement_address_higher: None,
    }
}

pub fn complete_status(a: &Pubkey, b: &Pubkey) -> MatchStatus {
    let (lower, higher) = if a < b { (a, b) } else { (b, a) };
    MatchStatus {
        all_ready: true,
        participants: vec![*a, *b],
        ready_participants: vec![*a, *b],
        settlement_address_lower: Some(lower.to_string()),
        settlement_address_higher: Some(higher.to_string()),
    }
}

/// Two keys with a known order
pub fn ordered_keys() -> (Pubkey, Pubkey) {
    let mut low = [0xaau8; 32];
    let mut high = [0xaau8; 32];
    low[0] = 0x01;
    high[0] = 0x02;
    (Pubkey::new_from_array(low), Pubkey::new_from_array(high))
}
