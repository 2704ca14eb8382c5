use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use venc_app::session::{build_encoder, run_session, SessionPlan};
use venc_app::settings::Settings;

/// Parse `venc [frames] [loss_percent...]`.
fn parse_plan(args: &[String]) -> Result<SessionPlan> {
    let mut plan = SessionPlan::default();
    if let Some(frames) = args.first() {
        plan.frames = frames
            .parse()
            .with_context(|| format!("invalid frame count: {frames}"))?;
    }
    if args.len() > 1 {
        plan.loss_pattern = args[1..]
            .iter()
            .map(|s| {
                s.parse()
                    .with_context(|| format!("invalid loss percentage: {s}"))
            })
            .collect::<Result<_>>()?;
    }
    Ok(plan)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("venc starting");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let plan = parse_plan(&args)?;
    let settings = Settings::load();

    let report = run_session(&settings, &plan, build_encoder()).await?;
    println!("{report:#?}");
    Ok(())
}
