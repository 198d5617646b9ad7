use rand::Rng;

use justice_core::turns::Party;

/// Source of the first-speaker choice.
pub trait CoinFlip: Send + Sync {
    fn flip(&self) -> Party;
}

/// Unbiased flip backed by the thread-local RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomCoin;

impl CoinFlip for RandomCoin {
    fn flip(&self) -> Party {
        if rand::thread_rng().gen_bool(0.5) {
            Party::A
        } else {
            Party::B
        }
    }
}

/// Always lands on the same party.
#[derive(Clone, Copy, Debug)]
pub struct FixedCoin(pub Party);

impl CoinFlip for FixedCoin {
    fn flip(&self) -> Party {
        self.0
    }
}
