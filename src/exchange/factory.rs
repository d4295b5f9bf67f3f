use std::sync::Arc;
use tracing::info;

use crate::adapters::OkxRestClient;
use crate::config::AppConfig;
use crate::error::Result;

use super::{split_pair, ExchangeClient, FillMode, PaperExchange};

/// The runtime exchange client, plus the paper book behind it in dry-run
/// mode so the runtime can feed it prices.
#[derive(Clone)]
pub struct ExchangeHandle {
    pub client: Arc<dyn ExchangeClient>,
    pub paper: Option<Arc<PaperExchange>>,
}

/// Create the runtime exchange client from `AppConfig`.
///
/// Dry-run mode trades against an in-memory book seeded with the configured
/// starting balance; nothing is sent to the venue.
pub fn build_exchange_client(app_config: &AppConfig) -> Result<ExchangeHandle> {
    if app_config.exchange.dry_run {
        let pair = app_config.pairs.first().map(String::as_str).unwrap_or("BTC-USDT");
        let (_, quote) = split_pair(pair)?;
        let paper = Arc::new(
            PaperExchange::new(app_config.risk.starting_balance, quote)
                .with_fill_mode(FillMode::Marketable)
                .with_fee_rate(app_config.execution.taker_fee),
        );
        info!(
            balance = %app_config.risk.starting_balance,
            quote,
            "dry run: paper exchange"
        );
        return Ok(ExchangeHandle {
            client: paper.clone(),
            paper: Some(paper),
        });
    }

    let client = OkxRestClient::new(&app_config.exchange)?;
    info!(
        rest_url = %app_config.exchange.rest_url,
        simulated = app_config.exchange.simulated,
        "live exchange client"
    );
    Ok(ExchangeHandle {
        client: Arc::new(client),
        paper: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_builds_paper_exchange() {
        let config = AppConfig::default_config(true);
        let handle = build_exchange_client(&config).unwrap();
        assert_eq!(handle.client.name(), "paper");
        assert!(handle.client.is_dry_run());
        assert!(handle.paper.is_some());
    }

    #[test]
    fn live_mode_requires_credentials() {
        let config = AppConfig::default_config(false);
        assert!(build_exchange_client(&config).is_err());
    }
}
