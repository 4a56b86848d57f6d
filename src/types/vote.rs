use crate::codec::{CodecError, Decoder, Encoder};
use crate::crypto::hash::sha256;
use crate::crypto::Signature;
use crate::types::{Address, Hash, PartSetHeader};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum VoteType {
    Prevote = 0x01,
    Precommit = 0x02,
    /// A precommit promoted to persist in the next block's validation.
    /// Carries the round it was cast in, which may lag the current round.
    Commit = 0x03,
}

impl VoteType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(VoteType::Prevote),
            0x02 => Some(VoteType::Precommit),
            0x03 => Some(VoteType::Commit),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vote {
    pub height: u64,
    pub round: u32,
    pub vote_type: VoteType,
    /// None votes nil.
    pub block_hash: Option<Hash>,
    pub block_parts: PartSetHeader,
    pub signer: Address,
    pub signature: Signature,
}

impl Vote {
    /// Canonical signed payload: everything but the signer identity.
    pub fn sign_doc(
        chain_id: &str,
        height: u64,
        round: u32,
        vote_type: VoteType,
        block_hash: &Option<Hash>,
        block_parts: &PartSetHeader,
    ) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_string(chain_id);
        e.put_u64(height);
        e.put_u32(round);
        e.put_u8(vote_type as u8);
        e.put_opt_hash(block_hash);
        block_parts.encode(&mut e);
        e.into_bytes()
    }

    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        Vote::sign_doc(
            chain_id,
            self.height,
            self.round,
            self.vote_type,
            &self.block_hash,
            &self.block_parts,
        )
    }

    pub fn encode(&self, e: &mut Encoder) {
        e.put_u64(self.height);
        e.put_u32(self.round);
        e.put_u8(self.vote_type as u8);
        e.put_opt_hash(&self.block_hash);
        self.block_parts.encode(e);
        e.put_address(&self.signer);
        e.put_signature(&self.signature);
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<Vote, CodecError> {
        let height = d.get_u64()?;
        let round = d.get_u32()?;
        let vote_type =
            VoteType::from_u8(d.get_u8()?).ok_or(CodecError::Invalid("unknown vote type"))?;
        let block_hash = d.get_opt_hash()?;
        let block_parts = PartSetHeader::decode(d)?;
        let signer = d.get_address()?;
        let signature = d.get_signature()?;
        Ok(Vote {
            height,
            round,
            vote_type,
            block_hash,
            block_parts,
            signer,
            signature,
        })
    }

    pub fn hash(&self) -> Hash {
        let mut e = Encoder::new();
        self.encode(&mut e);
        sha256(&e.into_bytes())
    }
}
