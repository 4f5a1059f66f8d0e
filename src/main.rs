//! Auto-Continue CLI
//!
//! 在伪终端中运行 Claude CLI，空闲时按 A → B → C 轮换注入下一条 prompt

use auto_continue::cli::{handle_run, RunArgs, EXIT_FAILURE};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "auto-continue")]
#[command(about = "Auto-Continue - 监管 Claude 会话，空闲时自动续接下一阶段")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    run: RunArgs,
}

fn main() {
    // 日志输出到 stderr，stdout 留给过滤后的 agent 输出
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("auto_continue=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();

    let code = match handle_run(cli.run) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("错误: {:#}", e);
            EXIT_FAILURE
        }
    };

    std::process::exit(code);
}
