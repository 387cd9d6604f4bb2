//! JSON-RPC ledger client
//!
//! Reads and transaction submission go over HTTP; account subscriptions go
//! over a single WebSocket connection that is opened on first use and shared
//! by every subscription.

use crate::client::{AccountUpdate, AccountUpdates, LedgerReader, LedgerWriter};
use crate::connection::LazyConnection;
use crate::error::LedgerError;
use crate::instructions::InstructionBuilder;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::StreamExt;
use jsonrpsee::{
    core::client::{ClientT, Subscription, SubscriptionClientT},
    http_client::{HttpClient, HttpClientBuilder},
    rpc_params,
    ws_client::{WsClient, WsClientBuilder},
};
use ledger_types::{addresses::TOKEN_PROGRAM_ID, MatchIdentity, ParticipantPair};
use serde_json::{json, Value};
use solana_sdk::{
    hash::Hash,
    instruction::Instruction,
    message::Message,
    pubkey::Pubkey,
    signature::Signature,
    signer::Signer,
    transaction::Transaction,
};
use std::{str::FromStr, sync::Arc, time::Duration};

/// Connection and deployment settings for the ledger
#[derive(Clone, Debug)]
pub struct LedgerConfig {
    /// HTTP JSON-RPC endpoint
    pub rpc_url: String,
    /// WebSocket endpoint for subscriptions
    pub ws_url: String,
    /// Game program id
    pub program_id: Pubkey,
    /// Stake token mint
    pub mint: Pubkey,
    /// Token program owning the mint
    pub token_program: Pubkey,
    /// Commitment used for reads and confirmation
    pub commitment: String,
    /// Delay between signature status polls
    pub confirm_poll_interval: Duration,
    /// Signature status polls before giving up
    pub confirm_max_polls: u32,
}

impl LedgerConfig {
    /// Create a new config with confirmed commitment and the SPL token program
    pub fn new(rpc_url: &str, ws_url: &str, program_id: Pubkey, mint: Pubkey) -> Self {
        Self {
            rpc_url: rpc_url.to_string(),
            ws_url: ws_url.to_string(),
            program_id,
            mint,
            token_program: TOKEN_PROGRAM_ID,
            commitment: "confirmed".to_string(),
            confirm_poll_interval: Duration::from_millis(500),
            confirm_max_polls: 60,
        }
    }
}

/// Ledger access over Solana JSON-RPC
pub struct RpcLedger {
    config: LedgerConfig,
    http: HttpClient,
    ws: LazyConnection<WsClient>,
    signer: Arc<dyn Signer + Send + Sync>,
    builder: InstructionBuilder,
}

impl RpcLedger {
    /// Create a ledger client. The signer is only used to sign transactions
    /// this client submits.
    pub fn new(
        config: LedgerConfig,
        signer: Arc<dyn Signer + Send + Sync>,
    ) -> Result<Self, LedgerError> {
        let http = HttpClientBuilder::default()
            .build(&config.rpc_url)
            .map_err(LedgerError::from)?;
        let builder = InstructionBuilder::new(config.program_id, config.mint, config.token_program);

        Ok(Self {
            config,
            http,
            ws: LazyConnection::new(),
            signer,
            builder,
        })
    }

    /// Public key of the local wallet
    pub fn wallet(&self) -> Pubkey {
        self.signer.pubkey()
    }

    async fn ws_client(&self) -> Result<Arc<WsClient>, LedgerError> {
        let url = self.config.ws_url.clone();
        self.ws
            .get_or_connect(
                |client| client.is_connected(),
                || async move {
                    tracing::debug!("Opening ledger WebSocket to {}", url);
                    WsClientBuilder::default()
                        .build(&url)
                        .await
                        .map_err(LedgerError::from)
                },
            )
            .await
    }

    async fn latest_blockhash(&self) -> Result<Hash, LedgerError> {
        let response: Value = self
            .http
            .request(
                "getLatestBlockhash",
                rpc_params![json!({ "commitment": self.config.commitment })],
            )
            .await?;

        let blockhash = response["value"]["blockhash"]
            .as_str()
            .ok_or_else(|| LedgerError::Transport("getLatestBlockhash: missing blockhash".into()))?;
        Hash::from_str(blockhash)
            .map_err(|e| LedgerError::Transport(format!("getLatestBlockhash: {e}")))
    }

    /// Sign, submit and confirm a single-instruction transaction
    async fn send_instruction(&self, label: &str, ix: Instruction) -> Result<Signature, LedgerError> {
        let blockhash = self.latest_blockhash().await?;
        let payer = self.signer.pubkey();

        let mut tx = Transaction::new_unsigned(Message::new(&[ix], Some(&payer)));
        tx.message.recent_blockhash = blockhash;
        let signature = self
            .signer
            .try_sign_message(&tx.message_data())
            .map_err(|e| LedgerError::Signing(e.to_string()))?;
        tx.signatures = vec![signature];

        let wire = bincode::serialize(&tx)
            .map_err(|e| LedgerError::Transport(format!("transaction encoding: {e}")))?;

        tracing::debug!("Submitting {} ({})", label, signature);
        let _: String = self
            .http
            .request(
                "sendTransaction",
                rpc_params![
                    BASE64.encode(wire),
                    json!({
                        "encoding": "base64",
                        "preflightCommitment": self.config.commitment,
                    })
                ],
            )
            .await?;

        self.confirm(signature).await?;
        tracing::info!("{} confirmed: {}", label, signature);
        Ok(signature)
    }

    async fn confirm(&self, signature: Signature) -> Result<(), LedgerError> {
        for _ in 0..self.config.confirm_max_polls {
            let response: Value = self
                .http
                .request(
                    "getSignatureStatuses",
                    rpc_params![vec![signature.to_string()]],
                )
                .await?;

            let status = &response["value"][0];
            if !status.is_null() {
                if !status["err"].is_null() {
                    return Err(classify_transaction_error(&status["err"]));
                }
                let level = status["confirmationStatus"].as_str().unwrap_or_default();
                if level == "confirmed" || level == "finalized" {
                    return Ok(());
                }
            }

            tokio::time::sleep(self.config.confirm_poll_interval).await;
        }

        Err(LedgerError::Unconfirmed(signature))
    }
}

/// Map an on-chain transaction error from a single-instruction transaction.
/// Custom error 0 on that instruction is the system program's allocate
/// reporting "account already in use".
fn classify_transaction_error(err: &Value) -> LedgerError {
    let text = err.to_string();
    let failed = &err["InstructionError"];
    if failed[0].as_u64() == Some(0) && failed[1]["Custom"].as_u64() == Some(0) {
        LedgerError::AlreadyExists(text)
    } else {
        LedgerError::Rejected(text)
    }
}

/// Decode `{"data": ["<b64>", "base64"], ...}` account payloads
fn decode_account_value(value: &Value) -> Result<Option<Vec<u8>>, LedgerError> {
    if value.is_null() {
        return Ok(None);
    }
    let encoded = value["data"][0]
        .as_str()
        .ok_or_else(|| LedgerError::Transport("account payload without base64 data".into()))?;
    BASE64
        .decode(encoded)
        .map(Some)
        .map_err(|e| LedgerError::Transport(format!("account data: {e}")))
}

fn decode_notification(address: Pubkey, notification: &Value) -> Option<AccountUpdate> {
    let slot = notification["context"]["slot"].as_u64().unwrap_or_default();
    match decode_account_value(&notification["value"]) {
        Ok(data) => Some(AccountUpdate {
            address,
            slot,
            data,
        }),
        Err(e) => {
            tracing::warn!("Dropping undecodable notification for {}: {}", address, e);
            None
        }
    }
}

#[async_trait]
impl LedgerReader for RpcLedger {
    async fn get_account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, LedgerError> {
        let response: Value = self
            .http
            .request(
                "getAccountInfo",
                rpc_params![
                    address.to_string(),
                    json!({ "encoding": "base64", "commitment": self.config.commitment })
                ],
            )
            .await?;

        decode_account_value(&response["value"])
    }

    async fn subscribe_account(&self, address: &Pubkey) -> Result<AccountUpdates, LedgerError> {
        let ws = self.ws_client().await?;
        let subscription: Subscription<Value> = ws
            .subscribe(
                "accountSubscribe",
                rpc_params![
                    address.to_string(),
                    json!({ "encoding": "base64", "commitment": self.config.commitment })
                ],
                "accountUnsubscribe",
            )
            .await?;

        tracing::debug!("Subscribed to account {}", address);

        let address = *address;
        let updates = subscription.filter_map(move |item| async move {
            match item {
                Ok(notification) => decode_notification(address, &notification),
                Err(e) => {
                    tracing::warn!("Account subscription error for {}: {}", address, e);
                    None
                }
            }
        });
        Ok(updates.boxed())
    }
}

#[async_trait]
impl LedgerWriter for RpcLedger {
    async fn init_match(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
        start_ts: i64,
    ) -> Result<Signature, LedgerError> {
        let ix = self.builder.init_match(identity, pair, start_ts);
        self.send_instruction("init_match", ix).await
    }

    async fn init_grow_state(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
    ) -> Result<Signature, LedgerError> {
        let ix = self.builder.init_grow_state(identity, pair, &self.wallet());
        self.send_instruction("init_grow_state", ix).await
    }

    async fn init_delivery_state(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
    ) -> Result<Signature, LedgerError> {
        let ix = self.builder.init_delivery_state(identity, pair, &self.wallet());
        self.send_instruction("init_delivery_state", ix).await
    }

    async fn join_match_with_stake(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
    ) -> Result<Signature, LedgerError> {
        let ix = self.builder.join_match_with_stake(identity, pair);
        self.send_instruction("join_match_with_stake", ix).await
    }
}
