use nodeup::config::Config;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"));
    if let Err(e) = run(config) {
        error!(error = %format!("{:#}", e), "nodeup failed");
        std::process::exit(1);
    }
}

fn run(config: Config) -> anyhow::Result<()> {
    // Only network-bound tasks await; one thread is enough.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let node = nodeup::prepare(&config).await?;
        if config.plan {
            for id in node.plan.ids() {
                println!("{}", id);
            }
            return Ok(());
        }
        nodeup::apply(&config, node).await?;
        Ok(())
    })
}
