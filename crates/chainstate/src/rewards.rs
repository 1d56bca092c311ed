//! Coinbase allocation policies consulted when assembling and validating blocks.

use vcoin_consensus::money::Amount;
use vcoin_consensus::{block_value, MasternodeParams, Network};
use vcoin_log::log_debug;
use vcoin_primitives::{Block, PaymentVote, TxOut};

use crate::validation::ValidationError;

/// The parent block as the reward rules see it.
#[derive(Clone, Copy, Debug)]
pub struct ParentBlock<'a> {
    pub height: i32,
    pub bits: u32,
    pub votes: &'a [PaymentVote],
}

/// Extra coinbase outputs and the vote records a new block must carry.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CoinbasePlan {
    pub payees: Vec<TxOut>,
    pub votes: Vec<PaymentVote>,
}

pub trait RewardPolicy: Send + Sync {
    /// Largest coinbase value allowed for a child of `parent` collecting `fees`.
    fn coinbase_value_ceiling(&self, parent: &ParentBlock<'_>, fees: Amount) -> Amount;

    /// Payees a child of `parent` must include, given the coinbase value it pays out.
    fn mandatory_payees(&self, parent: &ParentBlock<'_>, coinbase_value: Amount) -> CoinbasePlan;

    /// Whether blocks at `height` carry vote records that `check_block` must see.
    fn validates_votes(&self, _height: i32) -> bool {
        false
    }

    /// Checks the coinbase and vote records of `block` against its parent.
    fn check_block(
        &self,
        _block: &Block,
        _parent: &ParentBlock<'_>,
        _initial_download: bool,
    ) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// The difficulty-banded block value with no extra payees.
#[derive(Clone, Copy, Debug)]
pub struct StandardReward {
    legacy_mantissa_diff: bool,
}

impl StandardReward {
    pub fn new(network: Network) -> Self {
        Self {
            legacy_mantissa_diff: network == Network::Mainnet,
        }
    }
}

impl RewardPolicy for StandardReward {
    fn coinbase_value_ceiling(&self, parent: &ParentBlock<'_>, fees: Amount) -> Amount {
        block_value(parent.bits, parent.height, fees, self.legacy_mantissa_diff)
    }

    fn mandatory_payees(&self, _parent: &ParentBlock<'_>, _coinbase_value: Amount) -> CoinbasePlan {
        CoinbasePlan::default()
    }
}

/// Masternode payments driven by vote records carried from block to block.
///
/// A vote proposed at height `h` gains one vote per block that carries it forward. Once it
/// has `min_votes - 1` votes in the parent, the next block pays the payee
/// `coinbase / payment_divisor` instead of carrying the record; records expire
/// `vote_expiration` blocks after their proposal.
#[derive(Clone, Debug)]
pub struct MasternodeVotes {
    base: StandardReward,
    params: MasternodeParams,
}

impl MasternodeVotes {
    pub fn new(network: Network, params: MasternodeParams) -> Self {
        Self {
            base: StandardReward::new(network),
            params,
        }
    }

    fn payment(&self, coinbase_value: Amount) -> Amount {
        coinbase_value / self.params.payment_divisor.max(1)
    }

    fn age(parent: &ParentBlock<'_>, vote: &PaymentVote) -> i64 {
        i64::from(parent.height) + 1 - vote.height
    }
}

impl RewardPolicy for MasternodeVotes {
    fn coinbase_value_ceiling(&self, parent: &ParentBlock<'_>, fees: Amount) -> Amount {
        self.base.coinbase_value_ceiling(parent, fees)
    }

    fn mandatory_payees(&self, parent: &ParentBlock<'_>, coinbase_value: Amount) -> CoinbasePlan {
        let expiration = i64::from(self.params.vote_expiration);
        let mut plan = CoinbasePlan::default();
        for vote in parent.votes {
            let mut vote = vote.clone();
            // The last voter must agree so nobody can withhold the payment they would fund.
            if vote.votes >= self.params.min_votes - 1 {
                vote.votes += 1;
            }
            let age = Self::age(parent, &vote);
            if age >= expiration {
                continue;
            }
            if vote.votes >= self.params.min_votes && plan.payees.len() < self.params.max_payments {
                plan.payees
                    .push(TxOut::new(self.payment(coinbase_value), vote.payee.clone()));
            } else {
                plan.votes.push(vote);
            }
        }
        plan
    }

    fn validates_votes(&self, height: i32) -> bool {
        self.params
            .enforcement_height
            .is_some_and(|start| height >= start)
    }

    fn check_block(
        &self,
        block: &Block,
        parent: &ParentBlock<'_>,
        initial_download: bool,
    ) -> Result<(), ValidationError> {
        if initial_download || !self.validates_votes(parent.height + 1) {
            return Ok(());
        }
        let Some(coinbase) = block.transactions.first() else {
            return Err(ValidationError::malformed("bad-cb-missing", 100));
        };
        let payment = self.payment(coinbase.value_out());
        let expiration = i64::from(self.params.vote_expiration);
        let next_height = i64::from(parent.height) + 1;

        let mut matching = 0usize;
        let mut found = 0usize;
        let mut removed = 0usize;
        for prior in parent.votes {
            let age = Self::age(parent, prior);
            if age > expiration {
                return Err(ValidationError::invalid("bad-mn-vote-expired", 100));
            }
            if age == expiration {
                removed += 1;
            } else if prior.votes >= self.params.min_votes - 1 && found < self.params.max_payments {
                found += coinbase
                    .vout
                    .iter()
                    .filter(|output| output.value == payment && output.script_pubkey == prior.payee)
                    .count();
            } else {
                for carried in block
                    .votes
                    .iter()
                    .filter(|carried| carried.height == prior.height && carried.payee == prior.payee)
                {
                    matching += 1;
                    if carried.votes != prior.votes && carried.votes != prior.votes + 1 {
                        log_debug!(
                            "vote for height {} changed from {} to {}",
                            prior.height,
                            prior.votes,
                            carried.votes
                        );
                        return Err(ValidationError::invalid("bad-mn-vote", 100));
                    }
                }
            }
        }

        let mut proposed_here = false;
        for vote in &block.votes {
            if vote.payee.len() != self.params.payee_script_len {
                return Err(ValidationError::invalid("bad-mn-payee-size", 100));
            }
            if !proposed_here && vote.height == next_height {
                proposed_here = true;
                continue;
            }
            let known = parent
                .votes
                .iter()
                .any(|prior| prior.height == vote.height && prior.payee == vote.payee);
            if !known {
                return Err(ValidationError::invalid("bad-mn-vote-unknown", 100));
            }
        }

        if matching + found + removed != parent.votes.len() {
            return Err(ValidationError::invalid("bad-mn-votes-missing", 100));
        }
        if (matching + found) as i64 > expiration {
            return Err(ValidationError::invalid("bad-mn-votes-excess", 100));
        }
        Ok(())
    }
}
