use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = vigil::cli::Cli::load_config().unwrap_or_else(|e| {
        eprintln!("Error loading config: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = vigil::logging::init_logging(&config.loglevel, &config.logfile) {
        eprintln!("Warning: failed to initialize logging: {}", e);
        env_logger::init();
    }

    if config.primaries.is_empty() {
        log::warn!("No masters configured; monitoring nothing until told otherwise.");
    }

    vigil::supervisor::run_supervisor(config).await?;
    Ok(())
}
