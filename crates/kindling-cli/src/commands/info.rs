//! Info command - show host facts, paths and launch parameters.

use kindling_local_ai::{
    locate_server_binary, paths, resolve, HostFacts, ServerSettings, SupervisorOptions,
    DEFAULT_PORT,
};

use super::resolve_model;

pub(crate) fn run(model: Option<&str>, json: bool) -> miette::Result<()> {
    let options = SupervisorOptions::from_env();
    let host = options.host_facts.clone().unwrap_or_else(HostFacts::detect);
    let settings = options
        .settings_path
        .as_deref()
        .map(ServerSettings::load)
        .unwrap_or_default();
    let binary = locate_server_binary(options.server_binary.as_deref()).ok();

    let config = match model {
        Some(reference) => {
            let mut config = resolve(&resolve_model(reference)?, &host);
            settings.apply(&mut config);
            Some(config)
        }
        None => None,
    };

    if json {
        let report = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "host": host,
            "data_dir": paths::kindling_data_dir(),
            "models_dir": paths::models_dir(),
            "settings_path": options.settings_path,
            "server_binary": binary,
            "config": config,
        });
        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| miette::miette!("Failed to serialize report: {}", e))?;
        println!("{}", text);
        return Ok(());
    }

    println!("Kindling {}", env!("CARGO_PKG_VERSION"));
    println!("================");
    println!();
    println!("Host:");
    println!("  CPUs:             {}", host.cpu_count);
    println!("  Performance cores (est.): {}", host.performance_core_estimate);
    println!("  Total memory:     {} MiB", host.total_memory_bytes >> 20);
    println!("  Available memory: {} MiB", host.available_memory_bytes >> 20);
    println!();
    println!("Paths:");
    println!("  Data directory:   {}", paths::kindling_data_dir().display());
    println!("  Models directory: {}", paths::models_dir().display());
    if let Some(path) = &options.settings_path {
        println!("  Settings:         {}", path.display());
    }
    match &binary {
        Some(path) => println!("  Server binary:    {}", path.display()),
        None => println!("  Server binary:    not found (set KINDLING_SERVER_BIN)"),
    }
    println!();
    println!("Settings:");
    println!("  Port:             {} (default {})", settings.port, DEFAULT_PORT);
    if let Some(path) = &settings.last_model_path {
        println!("  Last model:       {}", path.display());
    }

    if let Some(config) = config {
        println!();
        println!("Launch parameters for {}:", config.model_path.display());
        println!("  Threads:          {}", config.thread_count);
        println!("  Context size:     {}", config.context_size);
        println!("  GPU layers:       {}", config.gpu_layers);
        println!("  Flash attention:  {}", config.flash_attention);
        println!("  Warmup:           {}", config.warmup_enabled);
        println!("  URL:              {}", config.base_url());
    }

    Ok(())
}
