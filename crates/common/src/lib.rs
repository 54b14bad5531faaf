pub mod types;
pub mod utils;

pub use ethereum_types::{Address, Bloom, H256, H512, U256};
