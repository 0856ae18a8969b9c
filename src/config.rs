//! config.rs – Load settings from config.yaml + environment variables.
//!
//! Environment variables always override YAML values.
use alloy_primitives::Address;
use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub log_level: String,
    /// Path to the SQLite operation journal.
    pub journal_path: String,
    /// Per-request timeout for backend and RPC calls.
    pub request_timeout_seconds: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".into(),
            journal_path: "scos-client.db".into(),
            request_timeout_seconds: 15.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WalletConfig {
    /// JSON-RPC endpoint of the signing provider. No URL means no provider.
    pub rpc_url: Option<String>,
    /// Safety margin added on top of the gas estimate, in percent.
    pub gas_buffer_pct: u64,
    /// How often the provider is polled for account / network changes.
    pub event_poll_seconds: f64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            gas_buffer_pct: 20,
            event_poll_seconds: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CollateralConfig {
    /// Collateralization ratio (1.4 = 140 %).
    pub ratio: Decimal,
    /// Decimals assumed for tokens missing from the asset table.
    pub default_decimals: u32,
    /// Price drop (fraction of the stake price) at which a position is flagged at risk.
    pub liquidation_drop_pct: Decimal,
}

impl Default for CollateralConfig {
    fn default() -> Self {
        Self {
            ratio: Decimal::new(14, 1),
            default_decimals: 6,
            liquidation_drop_pct: Decimal::new(25, 2),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// Vault contract that receives the token approval.
    pub vault_address: Address,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssetConfig {
    pub symbol: String,
    pub token_address: Address,
    pub decimals: u32,
    /// Overrides `collateral.ratio` for this asset.
    #[serde(default)]
    pub collateral_ratio: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Top-level settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub client: ClientConfig,
    pub backend: BackendConfig,
    pub wallet: WalletConfig,
    pub collateral: CollateralConfig,
    pub chains: BTreeMap<String, ChainConfig>,
    pub default_chain: String,
    pub assets: Vec<AssetConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut chains = BTreeMap::new();
        if let Ok(vault) = Address::from_str("0x0fE2B0c6177c79278A70E825581c691856E932D3") {
            chains.insert(
                "Reddio".to_string(),
                ChainConfig {
                    chain_id: 50341,
                    vault_address: vault,
                },
            );
        }
        Self {
            client: ClientConfig::default(),
            backend: BackendConfig::default(),
            wallet: WalletConfig::default(),
            collateral: CollateralConfig::default(),
            chains,
            default_chain: "Reddio".into(),
            assets: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from *config_path* YAML file, then overlay env vars.
    pub fn load(config_path: &str) -> Result<Self> {
        // Try to load .env file (ignore error if absent)
        let _ = dotenvy::dotenv();

        let mut settings = if std::path::Path::new(config_path).exists() {
            let yaml = std::fs::read_to_string(config_path).context("reading config file")?;
            serde_yaml::from_str::<Settings>(&yaml).context("parsing config YAML")?
        } else {
            Settings::default()
        };

        if let Ok(url) = std::env::var("SCOS_API_BASE") {
            settings.backend.base_url = url;
        }
        if let Ok(url) = std::env::var("SCOS_RPC_URL") {
            settings.wallet.rpc_url = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Ok(chain) = std::env::var("SCOS_CHAIN") {
            settings.default_chain = chain;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.get(name)
    }

    pub fn validate(&self) -> Result<()> {
        validate_positive("client.request_timeout_seconds", self.client.request_timeout_seconds)?;
        validate_positive("wallet.event_poll_seconds", self.wallet.event_poll_seconds)?;

        if self.backend.base_url.trim().is_empty() {
            bail!("backend.base_url must not be empty");
        }
        if self.wallet.gas_buffer_pct > 100 {
            bail!("wallet.gas_buffer_pct must be in [0, 100]");
        }
        if self.collateral.ratio <= Decimal::ZERO {
            bail!("collateral.ratio must be > 0");
        }
        if self.collateral.default_decimals > 36 {
            bail!("collateral.default_decimals must be <= 36");
        }
        if self.collateral.liquidation_drop_pct <= Decimal::ZERO
            || self.collateral.liquidation_drop_pct >= Decimal::ONE
        {
            bail!("collateral.liquidation_drop_pct must be in (0, 1)");
        }
        if !self.chains.is_empty() && !self.chains.contains_key(&self.default_chain) {
            bail!(
                "default_chain '{}' is not one of the configured chains",
                self.default_chain
            );
        }
        for (name, chain) in &self.chains {
            if chain.vault_address == Address::ZERO {
                bail!("chains.{name}.vault_address must not be the zero address");
            }
        }

        let mut symbols = HashSet::new();
        let mut tokens = HashSet::new();
        for asset in &self.assets {
            if asset.symbol.trim().is_empty() {
                bail!("assets entries must have a non-empty symbol");
            }
            if !symbols.insert(asset.symbol.as_str()) {
                bail!("assets: duplicate symbol {}", asset.symbol);
            }
            if !tokens.insert(asset.token_address) {
                bail!("assets: duplicate token_address {}", asset.token_address);
            }
            if asset.decimals > 36 {
                bail!("assets.{}.decimals must be <= 36", asset.symbol);
            }
            if matches!(asset.collateral_ratio, Some(r) if r <= Decimal::ZERO) {
                bail!("assets.{}.collateral_ratio must be > 0", asset.symbol);
            }
        }

        Ok(())
    }
}

fn validate_positive(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        bail!("{name} must be a finite number > 0");
    }
    Ok(())
}
