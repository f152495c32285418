use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use medialloc::config::MediallocConfig;
use medialloc::PluginLoader;

#[derive(Parser)]
#[command(
    name = "medialloc",
    about = "Compute-unit allocation for accelerator decode plugins",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $MEDIALLOC_CONFIG, then /etc/medialloc/medialloc.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the configured devices and compute units
    Inventory {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Load a decoder plugin library and check its ABI version
    ProbePlugin {
        /// Path to the plugin shared library
        #[arg(long)]
        lib: PathBuf,

        /// Shared runtime to load first (overrides the config file)
        #[arg(long)]
        runtime_lib: Option<PathBuf>,

        /// Skip loading the shared runtime
        #[arg(long, conflicts_with = "runtime_lib")]
        no_runtime: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = MediallocConfig::resolve(cli.config.as_deref())?;
    medialloc::init_tracing(&config.logging);

    match cli.command {
        Commands::Inventory { json } => {
            tracing::info!("Reading hardware inventory");
            let inventory = config.build_inventory()?;
            let snapshot = inventory.snapshot()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("\nmedialloc Hardware Inventory");
                println!(
                    "Devices present: {}   loaded: {}",
                    snapshot.num_devices,
                    snapshot.devices.len()
                );
                println!(
                    "{:<6} | {:<4} | {:<32} | {:<12} | {:<7} | {:<5} | Channels",
                    "Device", "CU", "Name", "Banks", "Default", "Soft"
                );
                println!(
                    "{:-<6}-|-{:-<4}-|-{:-<32}-|-{:-<12}-|-{:-<7}-|-{:-<5}-|-{:-<8}",
                    "", "", "", "", "", "", ""
                );
                for dev in &snapshot.devices {
                    for cu in &dev.cus {
                        let channels = cu
                            .max_channel_id
                            .map(|c| format!("0..={}", c))
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<6} | {:<4} | {:<32} | {:<12} | {:<7} | {:<5} | {}",
                            dev.dev_index,
                            cu.cu_index,
                            cu.name,
                            format!("{:?}", cu.banks),
                            cu.default_bank,
                            if cu.soft_kernel { "yes" } else { "no" },
                            channels
                        );
                    }
                }
                println!();
            }
        }
        Commands::ProbePlugin {
            lib,
            runtime_lib,
            no_runtime,
            json,
        } => {
            tracing::info!(lib = %lib.display(), "Probing decoder plugin");
            let loader = if no_runtime {
                PluginLoader::new(None)
            } else if let Some(runtime) = runtime_lib {
                PluginLoader::new(Some(runtime))
            } else {
                config.plugin_loader()
            };

            let probe = loader.probe(&lib)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&probe)?);
            } else {
                println!("\n=== Decoder Plugin ===");
                println!("Name:             {}", probe.name);
                println!("Version:          {}", probe.version);
                println!("Required:         {}", probe.required);
                println!("Plugin data size: {} bytes", probe.plugin_data_size);
                let verdict = if probe.compatible {
                    "COMPATIBLE"
                } else {
                    "INCOMPATIBLE"
                };
                println!("Verdict:          {}", verdict);
                println!("======================\n");
            }
            if !probe.compatible {
                anyhow::bail!(
                    "plugin version {} is older than required {}",
                    probe.version,
                    probe.required
                );
            }
        }
    }

    Ok(())
}
