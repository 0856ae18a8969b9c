//! Client-side orchestrator for collateralized tokenized-stock staking.
//!
//! A wallet session signs on-chain approvals, a backend ledger records the
//! borrowed balance, and the orchestrator ties the two together so that a
//! stake is either fully settled or visibly pending reconciliation.
pub mod backend;
pub mod collateral;
pub mod config;
pub mod database;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod positions;
pub mod prices;
pub mod rpc;
pub mod wallet;
