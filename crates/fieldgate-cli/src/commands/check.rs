use std::time::Duration;

use anyhow::Result;
use fieldgate::{AccessKind, Authorizer, AuthorizerConfig};

use crate::cli::{CheckArgs, OutputFormat};
use crate::output::print_access;

pub async fn check(
    mut config: AuthorizerConfig,
    args: &CheckArgs,
    format: OutputFormat,
) -> Result<()> {
    config.startup_timeout = Some(Duration::from_secs(args.timeout.max(1)));
    let authorizer = Authorizer::from_config(&config).await?;

    let kind = if args.write {
        AccessKind::Write
    } else {
        AccessKind::Read
    };
    let result = authorizer.check_access(kind, &args.uid, &args.resource).await;
    let ready = authorizer.is_ready();
    let last_error = authorizer.stats().last_error;
    authorizer.stop().await;

    if !ready {
        anyhow::bail!(
            "policy for {} did not load: {}",
            config.site,
            last_error.as_deref().unwrap_or("timed out")
        );
    }

    print_access(&kind.to_string(), &result, format)
}
