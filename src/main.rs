//! main.rs – Command-line front-end for the staking client.
//!
//! Each invocation loads settings, wires the orchestrator and runs one
//! command: price lookups, borrow quotes, stake / buy / sell / redeem, and
//! inspection or retry of stakes pending reconciliation.
use alloy_primitives::{Address, U256};
use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scos_staking_client::collateral::{display, from_base_units, SCOS_DECIMALS};
use scos_staking_client::config::Settings;
use scos_staking_client::errors::OperationError;
use scos_staking_client::models::{
    parse_address, parse_amount, short_address, OrderIntent, RedeemIntent, StakeIntent,
};
use scos_staking_client::orchestrator::Orchestrator;
use scos_staking_client::positions::fetch_stake_info;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "scos-client",
    about = "Stake tokenized stock, borrow SCOS against it, and trade on the settlement backend",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, global = true, default_value = "config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every cached reference price.
    Prices,
    /// Fetch one symbol's price.
    Price { symbol: String },
    /// Preview how much SCOS a stake would let you borrow.
    Quote {
        /// Asset symbol or token address.
        #[arg(long)]
        token: String,
        #[arg(long)]
        amount: String,
    },
    /// Show the connected account's borrowed balance.
    Balance,
    /// Approve the vault and settle a stake with the backend.
    Stake {
        #[arg(long)]
        token: String,
        #[arg(long)]
        amount: String,
        #[arg(long)]
        chain: Option<String>,
    },
    Buy {
        #[arg(long)]
        token: String,
        #[arg(long)]
        amount: String,
        #[arg(long)]
        chain: Option<String>,
    },
    Sell {
        #[arg(long)]
        token: String,
        #[arg(long)]
        amount: String,
        #[arg(long)]
        chain: Option<String>,
    },
    /// Redeem a staked position.
    Redeem {
        #[arg(long)]
        token: String,
        #[arg(long)]
        chain: Option<String>,
    },
    /// Read the vault's on-chain record of your stake.
    StakeInfo {
        #[arg(long)]
        token: String,
        #[arg(long)]
        chain: Option<String>,
    },
    /// List stakes whose settlement is unconfirmed.
    Pending,
    /// Retry the settlement of a pending stake.
    Retry { operation_id: String },
    /// Mark a pending stake as settled by other means.
    Reconciled {
        operation_id: String,
        #[arg(long)]
        note: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load settings (YAML + env override)
    let settings = Settings::load(&cli.config)?;

    // Logging – respects LOG_LEVEL / RUST_LOG; falls back to config
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(settings.client.log_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let orch = Orchestrator::from_settings(&settings)?;
    info!("Backend: {}", settings.backend.base_url);

    match cli.command {
        Command::Prices => {
            if !orch.prices().refresh_all().await {
                eprintln!("warning: price service unavailable");
            }
            let snapshot = orch.prices().snapshot();
            let mut symbols: Vec<_> = snapshot.iter().collect();
            symbols.sort_by(|a, b| a.0.cmp(b.0));
            for (symbol, price) in symbols {
                println!("{symbol:<10} {}", display(*price, 2));
            }
        }
        Command::Price { symbol } => {
            let price = orch.prices().refresh_one(&symbol).await?;
            println!("{symbol}: {}", display(price, 2));
        }
        Command::Quote { token, amount } => {
            let token = resolve_token(&orch, &token)?;
            if let Some(symbol) = orch.assets().symbol_for(&token) {
                orch.prices().refresh_one(symbol).await.ok();
            }
            println!("Borrowable: {} SCOS", display(orch.quote(&token, &amount), 2));
        }
        Command::Balance => {
            orch.connect().await?;
            match orch.balances().latest() {
                Some(s) => println!(
                    "{}: {} SCOS borrowed",
                    short_address(&s.account),
                    display(s.borrowed_total, 2)
                ),
                None => println!("Balance unavailable"),
            }
        }
        Command::Stake { token, amount, chain } => {
            let intent = StakeIntent {
                token_address: resolve_token(&orch, &token)?,
                amount: parse_amount(&amount)?,
                vault_address: vault_for(&settings, chain.as_deref())?,
                chain: chain_name(&settings, chain),
            };
            orch.connect().await?;
            orch.prices().refresh_all().await;
            println!(
                "Expected to borrow: {} SCOS",
                display(orch.quote(&intent.token_address, &amount), 2)
            );
            let result = orch.stake(intent).await.map_err(report)?;
            println!("Stake settled: approval {}", result.tx_hash);
            if let Some(tx) = result.settlement_tx {
                println!("Settlement tx: {tx}");
            }
            println!("Borrowed: {} SCOS", display(result.borrowed, 2));
        }
        Command::Buy { token, amount, chain } => {
            let intent = order_intent(&orch, &settings, &token, &amount, chain)?;
            orch.connect().await?;
            orch.buy(intent).await.map_err(report)?;
            println!("Buy order accepted");
        }
        Command::Sell { token, amount, chain } => {
            let intent = order_intent(&orch, &settings, &token, &amount, chain)?;
            orch.connect().await?;
            orch.sell(intent).await.map_err(report)?;
            println!("Sell order accepted");
        }
        Command::Redeem { token, chain } => {
            let intent = RedeemIntent {
                token_address: resolve_token(&orch, &token)?,
                vault_address: vault_for(&settings, chain.as_deref())?,
                chain: chain_name(&settings, chain),
            };
            orch.connect().await?;
            orch.redeem(intent).await.map_err(report)?;
            println!("Redeem submitted");
        }
        Command::StakeInfo { token, chain } => {
            let token = resolve_token(&orch, &token)?;
            let vault = vault_for(&settings, chain.as_deref())?;
            let session = orch.connect().await?;
            let info = fetch_stake_info(orch.wallet(), vault, session.account, token).await?;
            let staked = from_base_units(info.amount, orch.assets().decimals_for(&token));
            let borrowed = from_base_units(info.borrowed, SCOS_DECIMALS);
            let scaled = |value: Option<Decimal>, raw: U256| {
                value.map(|d| d.to_string()).unwrap_or_else(|| raw.to_string())
            };
            println!("Active:    {}", info.active);
            println!("Staked:    {}", scaled(staked, info.amount));
            println!("Borrowed:  {} SCOS", scaled(borrowed, info.borrowed));
            println!("Since:     {}", info.timestamp);
            if info.active {
                orch.prices().refresh_all().await;
                let risk = staked
                    .zip(borrowed)
                    .and_then(|(s, b)| orch.stake_at_risk(&token, s, b));
                match risk {
                    Some(true) => println!("Risk:      AT RISK of liquidation"),
                    Some(false) => println!("Risk:      ok"),
                    None => println!("Risk:      unknown (no price)"),
                }
            }
        }
        Command::Pending => {
            let pending = orch.pending_stakes()?;
            if pending.is_empty() {
                println!("No stakes pending reconciliation");
            }
            for p in pending {
                println!(
                    "{}  {} {} on {}  approval {}  ({})",
                    p.operation_id,
                    p.intent.amount,
                    short_address(&p.intent.token_address),
                    p.intent.chain,
                    p.approval_tx,
                    p.reason
                );
            }
        }
        Command::Retry { operation_id } => {
            let pending = orch
                .find_pending(&operation_id)?
                .ok_or_else(|| anyhow!("no pending stake with id {operation_id}"))?;
            orch.connect().await?;
            let result = orch.retry_settlement(&pending).await.map_err(report)?;
            println!("Stake settled: borrowed {} SCOS", display(result.borrowed, 2));
        }
        Command::Reconciled { operation_id, note } => {
            if !orch.mark_reconciled(&operation_id, note.as_deref())? {
                bail!("no pending stake with id {operation_id}");
            }
            println!("{operation_id} marked reconciled");
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn report(e: OperationError) -> anyhow::Error {
    anyhow!(e.user_message())
}

/// Asset symbol from the table, or a raw token address.
fn resolve_token(orch: &Orchestrator, input: &str) -> Result<Address> {
    if let Some(asset) = orch.assets().by_symbol(input.trim()) {
        return Ok(asset.token_address);
    }
    Ok(parse_address("token", input)?)
}

fn order_intent(
    orch: &Orchestrator,
    settings: &Settings,
    token: &str,
    amount: &str,
    chain: Option<String>,
) -> Result<OrderIntent> {
    Ok(OrderIntent {
        token_address: resolve_token(orch, token)?,
        amount: parse_amount(amount)?,
        vault_address: vault_for(settings, chain.as_deref())?,
        chain: chain_name(settings, chain),
    })
}

fn chain_name(settings: &Settings, chain: Option<String>) -> String {
    chain.unwrap_or_else(|| settings.default_chain.clone())
}

fn vault_for(settings: &Settings, chain: Option<&str>) -> Result<Address> {
    let name = chain.unwrap_or(&settings.default_chain);
    settings
        .chain(name)
        .map(|c| c.vault_address)
        .ok_or_else(|| anyhow!("chain '{name}' is not configured"))
}
