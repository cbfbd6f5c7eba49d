use std::time::Duration;

use anyhow::Result;
use fieldgate::{Authorizer, AuthorizerConfig};

use crate::cli::{OutputFormat, WatchArgs};
use crate::output::print_stats;

pub async fn watch(
    config: AuthorizerConfig,
    args: &WatchArgs,
    format: OutputFormat,
) -> Result<()> {
    let authorizer = Authorizer::from_config(&config).await?;
    tracing::info!(site = %config.site, "Watching policy, press Ctrl-C to stop");

    let mut report = tokio::time::interval(Duration::from_secs(args.report_every.max(1)));
    // The first tick fires immediately and would report before any cycle ran.
    report.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                print_stats(authorizer.site(), authorizer.state(), &authorizer.stats(), format)?;
            }
        }
    }

    authorizer.stop().await;
    print_stats(authorizer.site(), authorizer.state(), &authorizer.stats(), format)
}
