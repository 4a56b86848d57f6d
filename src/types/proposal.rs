use crate::codec::{CodecError, Decoder, Encoder};
use crate::crypto::Signature;
use crate::types::PartSetHeader;

/// Proposal for (height, round): the part set headers of the proposed block
/// and, when re-proposing a locked block, of the justifying proof of lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    pub block_parts: PartSetHeader,
    pub pol_parts: PartSetHeader,
    pub signature: Signature,
}

impl Proposal {
    pub fn sign_doc(
        chain_id: &str,
        height: u64,
        round: u32,
        block_parts: &PartSetHeader,
        pol_parts: &PartSetHeader,
    ) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_string(chain_id);
        e.put_u64(height);
        e.put_u32(round);
        block_parts.encode(&mut e);
        pol_parts.encode(&mut e);
        e.into_bytes()
    }

    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        Proposal::sign_doc(
            chain_id,
            self.height,
            self.round,
            &self.block_parts,
            &self.pol_parts,
        )
    }

    pub fn encode(&self, e: &mut Encoder) {
        e.put_u64(self.height);
        e.put_u32(self.round);
        self.block_parts.encode(e);
        self.pol_parts.encode(e);
        e.put_signature(&self.signature);
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<Proposal, CodecError> {
        Ok(Proposal {
            height: d.get_u64()?,
            round: d.get_u32()?,
            block_parts: PartSetHeader::decode(d)?,
            pol_parts: PartSetHeader::decode(d)?,
            signature: d.get_signature()?,
        })
    }
}
