pub mod coin;
pub mod config;
pub mod scheduler;

pub use coin::{CoinFlip, FixedCoin, RandomCoin};
pub use config::{JudgeConfig, PartyKinds};
pub use scheduler::{TurnEvent, TurnOutcome, TurnResult, TurnScheduler};
