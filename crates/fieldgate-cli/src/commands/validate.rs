use std::time::Duration;

use anyhow::{Context, Result};
use fieldgate::{Authorizer, AuthorizerConfig};

use crate::cli::ValidateArgs;
use crate::output::print_success;

pub async fn validate(mut config: AuthorizerConfig, args: &ValidateArgs) -> Result<()> {
    if args.print {
        let rendered =
            toml::to_string_pretty(&config).context("Failed to render configuration")?;
        println!("{rendered}");
    }

    config.startup_timeout = Some(Duration::from_secs(args.timeout.max(1)));
    let authorizer = Authorizer::from_config(&config).await?;

    // Any check waits for the first cycle; the answer itself is irrelevant.
    let _ = authorizer.read_access("", "").await;
    let ready = authorizer.is_ready();
    let stats = authorizer.stats();
    authorizer.stop().await;

    if !ready {
        anyhow::bail!(
            "policy for {} failed to compile: {}",
            config.site,
            stats.last_error.as_deref().unwrap_or("timed out")
        );
    }

    print_success(&format!(
        "Policy for {} compiled (version {})",
        config.site, stats.version
    ));
    Ok(())
}
