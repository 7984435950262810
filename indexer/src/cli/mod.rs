//! Command-line arguments and tracing setup.

use alloy_primitives::Address;
use clap::Parser;
use eyre::{Result, WrapErr};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "chainscope",
    about = "Index a contract's activity with tiered history windows and RPC failover",
    version
)]
pub struct CliArgs {
    /// Account whose subscription tier bounds the history window.
    #[arg(long)]
    pub account: String,

    /// Chain to index, by configured name.
    #[arg(long, default_value = "ethereum")]
    pub chain: String,

    /// Contract address to index.
    #[arg(long)]
    pub contract: Address,

    /// JSON config file; the built-in tables are used when absent.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Tier to assume for the account instead of looking one up.
    #[arg(long)]
    pub tier: Option<String>,

    /// Override the chain's chunk width in blocks.
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Keep following the chain head after backfill, if the tier allows it.
    #[arg(long)]
    pub follow: bool,

    /// Tail poll interval in seconds.
    #[arg(long, default_value_t = 30)]
    pub poll_secs: u64,

    /// Print the final session summary as JSON on stdout.
    #[arg(long)]
    pub json_summary: bool,

    /// Log filter, e.g. "info" or "chainscope_indexer=debug".
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}

/// Install the global tracing subscriber. Call once, before anything logs.
pub fn init_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter).wrap_err("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| eyre::eyre!("failed to install tracing subscriber: {err}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_address;

    #[test]
    fn minimal_invocation_parses() {
        let args = CliArgs::try_parse_from([
            "chainscope",
            "--account",
            "acct-1",
            "--contract",
            &test_address(0xc0).to_string(),
        ])
        .expect("minimal args parse");
        assert_eq!(args.chain, "ethereum");
        assert_eq!(args.poll_secs, 30);
        assert!(!args.follow);
        assert_eq!(args.contract, test_address(0xc0));
    }

    #[test]
    fn bad_contract_address_is_rejected() {
        let parsed = CliArgs::try_parse_from([
            "chainscope",
            "--account",
            "acct-1",
            "--contract",
            "not-an-address",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn overrides_parse() {
        let args = CliArgs::try_parse_from([
            "chainscope",
            "--account",
            "acct-1",
            "--contract",
            &test_address(0xc0).to_string(),
            "--chain",
            "polygon",
            "--tier",
            "enterprise",
            "--chunk-size",
            "50000",
            "--follow",
            "--json-summary",
        ])
        .expect("full args parse");
        assert_eq!(args.chain, "polygon");
        assert_eq!(args.tier.as_deref(), Some("enterprise"));
        assert_eq!(args.chunk_size, Some(50_000));
        assert!(args.follow);
        assert!(args.json_summary);
    }
}
