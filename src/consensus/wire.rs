//! Wire messages of the consensus reactor, one closed variant per channel,
//! tagged by a leading type byte.

use crate::codec::{CodecError, Decoder, Encoder};
use crate::consensus::round_state::RoundStep;
use crate::types::{BitArray, Part, Proposal, Vote};

const MSG_TYPE_NEW_ROUND_STEP: u8 = 0x01;
const MSG_TYPE_HAS_VOTES: u8 = 0x02;
const MSG_TYPE_PROPOSAL: u8 = 0x11;
const MSG_TYPE_PART: u8 = 0x12;
const MSG_TYPE_VOTE: u8 = 0x13;

pub const PART_TYPE_PROPOSAL_BLOCK: u8 = 0x01;
pub const PART_TYPE_PROPOSAL_POL: u8 = 0x02;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartKind {
    ProposalBlock,
    ProposalPol,
}

impl PartKind {
    fn to_u8(self) -> u8 {
        match self {
            PartKind::ProposalBlock => PART_TYPE_PROPOSAL_BLOCK,
            PartKind::ProposalPol => PART_TYPE_PROPOSAL_POL,
        }
    }

    fn from_u8(b: u8) -> Option<PartKind> {
        match b {
            PART_TYPE_PROPOSAL_BLOCK => Some(PartKind::ProposalBlock),
            PART_TYPE_PROPOSAL_POL => Some(PartKind::ProposalPol),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ConsensusMessage {
    NewRoundStep {
        height: u64,
        round: u32,
        step: RoundStep,
        seconds_since_start_time: u32,
    },
    HasVotes {
        height: u64,
        round: u32,
        prevotes: BitArray,
        precommits: BitArray,
        commits: BitArray,
    },
    Proposal(Proposal),
    Part {
        height: u64,
        round: u32,
        kind: PartKind,
        part: Part,
    },
    Vote(Vote),
}

impl ConsensusMessage {
    pub fn encode_to_bytes(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        match self {
            ConsensusMessage::NewRoundStep {
                height,
                round,
                step,
                seconds_since_start_time,
            } => {
                e.put_u8(MSG_TYPE_NEW_ROUND_STEP);
                e.put_u64(*height);
                e.put_u32(*round);
                e.put_u8(*step as u8);
                e.put_u32(*seconds_since_start_time);
            }
            ConsensusMessage::HasVotes {
                height,
                round,
                prevotes,
                precommits,
                commits,
            } => {
                e.put_u8(MSG_TYPE_HAS_VOTES);
                e.put_u64(*height);
                e.put_u32(*round);
                prevotes.encode(&mut e);
                precommits.encode(&mut e);
                commits.encode(&mut e);
            }
            ConsensusMessage::Proposal(proposal) => {
                e.put_u8(MSG_TYPE_PROPOSAL);
                proposal.encode(&mut e);
            }
            ConsensusMessage::Part {
                height,
                round,
                kind,
                part,
            } => {
                e.put_u8(MSG_TYPE_PART);
                e.put_u64(*height);
                e.put_u32(*round);
                e.put_u8(kind.to_u8());
                part.encode(&mut e);
            }
            ConsensusMessage::Vote(vote) => {
                e.put_u8(MSG_TYPE_VOTE);
                vote.encode(&mut e);
            }
        }
        e.into_bytes()
    }

    pub fn decode_from_bytes(bytes: &[u8]) -> Result<ConsensusMessage, CodecError> {
        let mut d = Decoder::new(bytes);
        let msg = match d.get_u8()? {
            MSG_TYPE_NEW_ROUND_STEP => ConsensusMessage::NewRoundStep {
                height: d.get_u64()?,
                round: d.get_u32()?,
                step: RoundStep::from_u8(d.get_u8()?)
                    .ok_or(CodecError::Invalid("unknown round step"))?,
                seconds_since_start_time: d.get_u32()?,
            },
            MSG_TYPE_HAS_VOTES => ConsensusMessage::HasVotes {
                height: d.get_u64()?,
                round: d.get_u32()?,
                prevotes: BitArray::decode(&mut d)?,
                precommits: BitArray::decode(&mut d)?,
                commits: BitArray::decode(&mut d)?,
            },
            MSG_TYPE_PROPOSAL => ConsensusMessage::Proposal(Proposal::decode(&mut d)?),
            MSG_TYPE_PART => ConsensusMessage::Part {
                height: d.get_u64()?,
                round: d.get_u32()?,
                kind: PartKind::from_u8(d.get_u8()?)
                    .ok_or(CodecError::Invalid("unknown part kind"))?,
                part: Part::decode(&mut d)?,
            },
            MSG_TYPE_VOTE => ConsensusMessage::Vote(Vote::decode(&mut d)?),
            _ => return Err(CodecError::Invalid("unknown consensus message")),
        };
        d.finish()?;
        Ok(msg)
    }
}
