use std::{path::PathBuf, sync::Arc};

use cache::hash_args;
use clap::Parser;
use runtime::{ScriptContext, ScriptError, ScriptFn};
use serde_json::{json, Value};
use shared::domain::FunctionKey;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "streamboard-demo", about = "Serves the streamboard demo app")]
struct Args {
    /// Listen address, overriding the config file.
    #[arg(long)]
    bind: Option<String>,
    /// Path to a streamboard.toml config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args = Args::parse();
    let mut settings = match &args.config {
        Some(path) => server::load_settings_from(path),
        None => server::load_settings(),
    };
    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }

    info!(bind_addr = %settings.bind_addr, "starting demo app");
    let script: ScriptFn = Arc::new(demo_app);
    server::serve(settings, script).await
}

/// A small linear app: two widgets, a cached table build, and a table that
/// grows after its first render.
fn demo_app(ctx: &mut ScriptContext<'_>) -> Result<(), ScriptError> {
    ctx.text("Streamboard demo")?;
    let enabled = ctx.checkbox("Show table", true, Some("enabled"))?;
    let rows_wanted = ctx.number_input("Rows", 3.0, Some("rows"))?;

    if !enabled {
        ctx.text("Table hidden")?;
        return Ok(());
    }

    let count = rows_wanted.max(0.0) as usize;
    let function_key = FunctionKey::derive("demo::build_rows", "v1");
    let arg_hash = hash_args("demo::build_rows", &[("count", &json!(count))])?;
    let rows: Vec<Value> = ctx.cached(&function_key, &arg_hash, || Ok(build_rows(count)))?;

    let table = ctx.table(rows)?;
    ctx.add_rows(&table, vec![json!({"index": "total", "value": count})])?;
    Ok(())
}

fn build_rows(count: usize) -> Vec<Value> {
    (0..count)
        .map(|index| json!({"index": index, "value": index * index}))
        .collect()
}
