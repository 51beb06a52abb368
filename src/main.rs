//! Hive 命令行入口
//!
//! 用法：`hive "问题"`，或 `hive --config path/to/config.toml "问题"`。
//! 加载配置、组装系统、运行一次会话并打印结果。

use std::path::PathBuf;

use anyhow::{bail, Context};
use hive::config::load_config_or_default;
use hive::{HiveBuilder, SessionOutcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    let mut query_parts = Vec::new();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().context("--config needs a path")?;
            config_path = Some(PathBuf::from(path));
        } else {
            query_parts.push(arg);
        }
    }
    let query = query_parts.join(" ");
    if query.trim().is_empty() {
        bail!("usage: hive [--config <file>] \"<query>\"");
    }

    let config = load_config_or_default(config_path);
    let hive = HiveBuilder::new(config).build().context("Failed to build hive")?;

    let result = hive.run(&query).await;
    tracing::info!(
        session = %result.session_id,
        iterations = result.total_iterations,
        total_tokens = result.token_usage.2,
        "session finished"
    );

    match result.outcome {
        SessionOutcome::Completed => {
            println!("{}", result.answer.unwrap_or_default());
        }
        SessionOutcome::Exhausted => {
            eprintln!("iteration limit reached, best available answer:");
            println!("{}", result.answer.unwrap_or_default());
        }
        SessionOutcome::Failed => {
            bail!("session failed: {}", result.error.unwrap_or_default());
        }
    }
    Ok(())
}
