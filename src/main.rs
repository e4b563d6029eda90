use clap::{Arg, Command};
use log::LevelFilter;
use milter_fanout::condition::ConditionSet;
use milter_fanout::config::{Config, RuntimeFlavor, StatisticsConfig};
use milter_fanout::server::{self, ManagerContext};
use milter_fanout::socket::ConnectionSpec;
use milter_fanout::statistics::StatisticsCollector;
use std::process;
use std::sync::Arc;

fn main() {
    let matches = Command::new("milter-fanout")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Milter that fans MTA events out to several child milters")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/milter-fanout.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Check the configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show the last statistics snapshot")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats-reset")
                .long("stats-reset")
                .help("Reset all statistics and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("connection-spec")
                .short('s')
                .long("connection-spec")
                .value_name("SPEC")
                .help("Listen on SPEC (unix:/path, inet:PORT@HOST, inet6:PORT@HOST)")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/milter-fanout.yaml");
    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if let Some(spec) = matches.get_one::<String>("connection-spec") {
        match spec.parse::<ConnectionSpec>() {
            Ok(spec) => config.manager.connection_spec = spec,
            Err(e) => {
                eprintln!("Invalid connection spec: {e}");
                process::exit(1);
            }
        }
    }

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        process::exit(1);
    }

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if matches.get_flag("stats") || matches.get_flag("stats-reset") {
        let Some(stats_config) = config.statistics.as_ref().filter(|s| s.enabled) else {
            println!("Statistics are not enabled in configuration");
            process::exit(1);
        };
        if matches.get_flag("stats-reset") {
            match StatisticsCollector::reset_stats(&stats_config.path) {
                Ok(()) => println!("Statistics reset successfully"),
                Err(e) => {
                    println!("Failed to reset statistics: {e}");
                    process::exit(1);
                }
            }
        } else {
            show_stats(stats_config);
        }
        return;
    }

    let runtime = match build_runtime(&config) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(config)) {
        log::error!("milter-fanout error: {e:#}");
        process::exit(1);
    }
}

fn build_runtime(config: &Config) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = match config.manager.runtime {
        RuntimeFlavor::CurrentThread => tokio::runtime::Builder::new_current_thread(),
        RuntimeFlavor::MultiThread => {
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            if let Some(threads) = config.manager.worker_threads {
                builder.worker_threads(threads);
            }
            builder
        }
    };
    builder.enable_all().build()
}

async fn run(config: Config) -> anyhow::Result<()> {
    let spec = config.manager.connection_spec.clone();
    let statistics = match config.statistics.as_ref().filter(|s| s.enabled) {
        Some(stats) => Some(Arc::new(StatisticsCollector::new(
            stats.path.clone(),
            stats.flush_interval_seconds,
        )?)),
        None => None,
    };

    let mut manager = ManagerContext::new(config)?;
    if let Some(statistics) = statistics {
        manager = manager.with_statistics(statistics);
    }
    log::info!(
        "Starting milter-fanout {} with {} children",
        env!("CARGO_PKG_VERSION"),
        manager.config().children.iter().filter(|c| c.enabled).count()
    );

    let listener = spec.bind().await?;
    server::run(listener, Arc::new(manager), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {e}");
        }
    })
    .await
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    println!("Listening on: {}", config.manager.connection_spec);
    println!(
        "Fallback: {} (at disconnect: {})",
        config.manager.fallback_status, config.manager.fallback_status_at_disconnect
    );
    println!("Number of children: {}", config.children.len());
    for (i, child) in config.children.iter().enumerate() {
        let mut notes = Vec::new();
        if !child.enabled {
            notes.push("disabled");
        }
        if child.evaluation_mode {
            notes.push("evaluation");
        }
        println!(
            "  Child {}: {} -> {}{}",
            i + 1,
            child.name,
            child.connection_spec,
            if notes.is_empty() {
                String::new()
            } else {
                format!(" ({})", notes.join(", "))
            }
        );
    }
    match ConditionSet::compile(&config.applicable_conditions) {
        Ok(conditions) => println!("Applicable conditions compiled: {}", conditions.len()),
        Err(e) => {
            println!("Configuration validation failed:");
            println!("Error: {e}");
            process::exit(1);
        }
    }
    println!("Configuration is valid");
}

fn show_stats(stats_config: &StatisticsConfig) {
    let snapshot = match StatisticsCollector::read_snapshot(&stats_config.path) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            println!("Failed to read statistics: {e}");
            process::exit(1);
        }
    };
    let global = &snapshot.global;
    println!("milter-fanout statistics");
    println!("═══════════════════════════════════════");
    println!("  Sessions: {} ({} failed)", global.total_sessions, global.failed_sessions);
    if global.total_sessions > 0 {
        println!(
            "  Average session time: {:.1}ms",
            global.total_processing_time_ms as f64 / global.total_sessions as f64
        );
    }
    println!("  Messages: {}", global.total_messages);
    for (status, count) in &global.message_statuses {
        println!("  ├─ {status}: {count}");
    }
    println!(
        "  Recipients: {} ({} rejected)",
        global.total_recipients, global.rejected_recipients
    );
    println!("  Body bytes: {}", global.total_body_bytes);
    println!("  Started: {}", global.start_time.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Last Updated: {}", global.last_updated.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();

    if snapshot.children.is_empty() {
        println!("No child verdicts recorded yet");
        return;
    }
    println!("Children:");
    for stats in snapshot.children.values() {
        let verdicts: Vec<String> = stats
            .verdicts
            .iter()
            .map(|(status, count)| format!("{status}={count}"))
            .collect();
        println!(
            "  {:<24} {} | evaluation {} | failures {}",
            stats.child_name,
            if verdicts.is_empty() {
                "-".to_string()
            } else {
                verdicts.join(" ")
            },
            stats.evaluation_verdicts,
            stats.failures
        );
        if let Some(reason) = &stats.last_failure {
            println!("  {:<24} last failure: {}", "", reason);
        }
    }
}
