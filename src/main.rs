#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let requests: Vec<_> = rust_swarm::app::parse_get_args(&args)?.into_iter().collect();

    let cfg: rust_swarm::config::Config =
        rust_swarm::config_io::load_or_create_config("config.toml").await?;

    rust_swarm::config::init_tracing(&cfg);
    tracing::info!("rust-swarm booted");

    rust_swarm::app::run(cfg, requests).await?;
    Ok(())
}
