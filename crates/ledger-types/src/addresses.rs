//! Deterministic record addresses for a match

use crate::identity::{MatchIdentity, ParticipantPair};
use crate::seeds;
use solana_sdk::{pubkey, pubkey::Pubkey};

/// SPL token program
pub const TOKEN_PROGRAM_ID: Pubkey = pubkey!("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");

/// SPL associated token account program
pub const ASSOCIATED_TOKEN_PROGRAM_ID: Pubkey =
    pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

/// Every address the coordinator touches for one match
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchAddresses {
    /// Primary match record
    pub match_state: Pubkey,
    /// Stake record, created alongside the match record
    pub stake_state: Pubkey,
    /// Escrow token account holding both stakes
    pub escrow: Pubkey,
    /// PDA that signs for the escrow
    pub escrow_authority: Pubkey,
    /// First dependent record
    pub grow_state: Pubkey,
    /// Second dependent record
    pub delivery_state: Pubkey,
}

impl MatchAddresses {
    /// Derive all addresses for a match
    pub fn derive(program_id: &Pubkey, identity: &MatchIdentity, pair: &ParticipantPair) -> Self {
        Self {
            match_state: derive_match_pda(identity, pair, program_id).0,
            stake_state: derive_hash_pda(seeds::STAKE, identity, program_id).0,
            escrow: derive_hash_pda(seeds::ESCROW, identity, program_id).0,
            escrow_authority: derive_hash_pda(seeds::ESCROW_AUTHORITY, identity, program_id).0,
            grow_state: derive_numeric_pda(seeds::GROW, identity, program_id).0,
            delivery_state: derive_numeric_pda(seeds::DELIVERY, identity, program_id).0,
        }
    }
}

/// Derive the match record PDA: ["match", hash, lower, higher]
pub fn derive_match_pda(
    identity: &MatchIdentity,
    pair: &ParticipantPair,
    program_id: &Pubkey,
) -> (Pubkey, u8) {
    Pubkey::find_program_address(
        &[
            seeds::MATCH,
            identity.identity_hash().as_ref(),
            pair.lower().as_ref(),
            pair.higher().as_ref(),
        ],
        program_id,
    )
}

/// Derive a PDA seeded by the identity hash
pub fn derive_hash_pda(seed: &[u8], identity: &MatchIdentity, program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[seed, identity.identity_hash().as_ref()], program_id)
}

/// Derive a PDA seeded by the little-endian numeric id
pub fn derive_numeric_pda(
    seed: &[u8],
    identity: &MatchIdentity,
    program_id: &Pubkey,
) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[seed, identity.numeric_seed().as_ref()], program_id)
}

/// Associated token account for `owner` holding `mint`
pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey, token_program: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[owner.as_ref(), token_program.as_ref(), mint.as_ref()],
        &ASSOCIATED_TOKEN_PROGRAM_ID,
    )
    .0
}
