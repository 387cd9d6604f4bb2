//! Game program instruction builders
//!
//! Instruction data is the 8-byte instruction discriminator followed by the
//! Borsh-encoded arguments. Account order matches the program's account
//! structs exactly.

use borsh::BorshSerialize;
use ledger_types::accounts::instruction_discriminator;
use ledger_types::addresses::{associated_token_address, ASSOCIATED_TOKEN_PROGRAM_ID};
use ledger_types::{MatchAddresses, MatchIdentity, ParticipantPair};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    system_program,
};

#[derive(BorshSerialize)]
struct InitMatchArgs {
    match_id_hash: [u8; 32],
    match_id: Option<u64>,
    start_ts: i64,
}

#[derive(BorshSerialize)]
struct InitDependentArgs {
    match_id_hash: [u8; 32],
    match_id: u64,
}

/// Builds instructions against one deployment of the game program
#[derive(Clone, Debug)]
pub struct InstructionBuilder {
    program_id: Pubkey,
    mint: Pubkey,
    token_program: Pubkey,
}

impl InstructionBuilder {
    /// Create a new builder for one deployment
    pub fn new(program_id: Pubkey, mint: Pubkey, token_program: Pubkey) -> Self {
        Self {
            program_id,
            mint,
            token_program,
        }
    }

    /// Game program id
    pub fn program_id(&self) -> &Pubkey {
        &self.program_id
    }

    /// All record addresses for a match
    pub fn addresses(&self, identity: &MatchIdentity, pair: &ParticipantPair) -> MatchAddresses {
        MatchAddresses::derive(&self.program_id, identity, pair)
    }

    /// init_match, signed by the lower participant
    pub fn init_match(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
        start_ts: i64,
    ) -> Instruction {
        let addresses = self.addresses(identity, pair);
        let player_a = *pair.lower();
        let args = InitMatchArgs {
            match_id_hash: *identity.identity_hash(),
            match_id: Some(identity.numeric_id()),
            start_ts,
        };

        Instruction::new_with_bytes(
            self.program_id,
            &encode("init_match", &args),
            vec![
                AccountMeta::new(addresses.match_state, false),
                AccountMeta::new(addresses.stake_state, false),
                AccountMeta::new(self.mint, false),
                AccountMeta::new(
                    associated_token_address(&player_a, &self.mint, &self.token_program),
                    false,
                ),
                AccountMeta::new(addresses.escrow, false),
                AccountMeta::new_readonly(addresses.escrow_authority, false),
                AccountMeta::new(player_a, true),
                AccountMeta::new_readonly(*pair.higher(), false),
                AccountMeta::new_readonly(self.token_program, false),
                AccountMeta::new_readonly(ASSOCIATED_TOKEN_PROGRAM_ID, false),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
        )
    }

    /// init_grow_state, payable by either participant
    pub fn init_grow_state(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
        payer: &Pubkey,
    ) -> Instruction {
        let addresses = self.addresses(identity, pair);
        self.dependent("init_grow_state", identity, addresses.grow_state, addresses.match_state, payer)
    }

    /// init_delivery_state, payable by either participant
    pub fn init_delivery_state(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
        payer: &Pubkey,
    ) -> Instruction {
        let addresses = self.addresses(identity, pair);
        self.dependent(
            "init_delivery_state",
            identity,
            addresses.delivery_state,
            addresses.match_state,
            payer,
        )
    }

    /// join_match_with_stake, signed by the higher participant
    pub fn join_match_with_stake(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
    ) -> Instruction {
        let addresses = self.addresses(identity, pair);
        let player_b = *pair.higher();

        Instruction::new_with_bytes(
            self.program_id,
            &instruction_discriminator("join_match_with_stake"),
            vec![
                AccountMeta::new(addresses.stake_state, false),
                AccountMeta::new(self.mint, false),
                AccountMeta::new(
                    associated_token_address(&player_b, &self.mint, &self.token_program),
                    false,
                ),
                AccountMeta::new(addresses.escrow, false),
                AccountMeta::new_readonly(addresses.escrow_authority, false),
                AccountMeta::new(player_b, true),
                AccountMeta::new_readonly(self.token_program, false),
                AccountMeta::new_readonly(ASSOCIATED_TOKEN_PROGRAM_ID, false),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
        )
    }

    fn dependent(
        &self,
        name: &str,
        identity: &MatchIdentity,
        record: Pubkey,
        match_state: Pubkey,
        payer: &Pubkey,
    ) -> Instruction {
        let args = InitDependentArgs {
            match_id_hash: *identity.identity_hash(),
            match_id: identity.numeric_id(),
        };

        Instruction::new_with_bytes(
            self.program_id,
            &encode(name, &args),
            vec![
                AccountMeta::new(record, false),
                AccountMeta::new_readonly(match_state, false),
                AccountMeta::new(*payer, true),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
        )
    }
}

fn encode(name: &str, args: &impl BorshSerialize) -> Vec<u8> {
    let mut data = instruction_discriminator(name).to_vec();
    // Writing into a Vec cannot fail
    let _ = args.serialize(&mut data);
    data
}
