mod tcprelay;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "tcprelay",
    version,
    about = "tcprelay - expose services behind NAT through a public TCP relay"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses TCPRELAY_CONFIG; then auto-detects tcprelay.toml > tcprelay.yaml > tcprelay.yml from CWD; then falls back to the OS default path (Linux: /etc/tcprelay/tcprelay.toml; others: user config dir).
    #[arg(long, env = "TCPRELAY_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tcprelay::run(cli.config).await
}
