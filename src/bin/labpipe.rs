//! labpipe CLI: operator interface to a pipeline daemon's files and cache.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use labpipe::cache::{CacheFolder, WorkCache};
use labpipe::config::Config;
use labpipe::daemon::{CommandWorker, WorkContext, Worker};
use labpipe::files::{FileToken, FileTokenFactory, ReceiverTranslator, SenderTranslator};
use labpipe::grid::GridServiceRegistry;
use labpipe::log::{LogRouter, LoggerFactory};
use labpipe::model::{Cacheable, WorkPacket};
use labpipe::progress::{self, ProgressEvent, ProgressInfo};
use labpipe::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "labpipe", about = "Work cache, file tokens and logs for lab pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the wire token for a local path
    Token { path: PathBuf },
    /// Resolve a wire token into a local path
    Resolve { token: String },
    /// Print the qsub line for a configured grid service
    GridCommand {
        /// Directory containing grid service TOML configs
        #[arg(long, default_value = "services")]
        services: PathBuf,
        service: String,
        /// Arguments passed to the application
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Wipe every data folder of the configured cache
    CacheClean,
    /// Print the fingerprint and cache slot of a work packet
    Fingerprint {
        #[command(flatten)]
        packet: PacketArgs,
    },
    /// Run one packet through the cache and an external program
    Run {
        /// Program invoked for cache misses
        #[arg(long)]
        program: PathBuf,
        #[command(flatten)]
        packet: PacketArgs,
        /// Ignore any cached result
        #[arg(long)]
        from_scratch: bool,
    },
}

#[derive(clap::Args)]
struct PacketArgs {
    /// Work type
    #[arg(long = "type")]
    work_type: String,
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long)]
    database: Option<PathBuf>,
    /// File holding the parameter text
    #[arg(long)]
    params: Option<PathBuf>,
    /// Copy results to the requested output location
    #[arg(long)]
    publish: bool,
}

impl PacketArgs {
    fn packet(&self) -> anyhow::Result<WorkPacket> {
        let mut packet = WorkPacket::new(
            uuid::Uuid::new_v4().to_string(),
            &self.work_type,
            &self.input,
            &self.output,
        )
        .with_publish(self.publish);
        if let Some(database) = &self.database {
            packet = packet.with_database(database);
        }
        if let Some(params) = &self.params {
            packet = packet.with_params(std::fs::read_to_string(params)?);
        }
        Ok(packet)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Token { path } => {
            let config = Config::from_env()?;
            let factory = FileTokenFactory::new(config.daemon_info());
            println!("{}", factory.translate_before_transfer(&path)?.to_wire());
            Ok(())
        }
        Command::Resolve { token } => {
            let config = Config::from_env()?;
            let factory = FileTokenFactory::new(config.daemon_info());
            let token = FileToken::parse_wire(&token)?;
            println!("{}", factory.resolve(&token)?.display());
            Ok(())
        }
        Command::GridCommand {
            services,
            service,
            args,
        } => {
            let registry = GridServiceRegistry::load_from_dir(&services)?;
            let service = registry
                .get(&service)
                .ok_or_else(|| anyhow::anyhow!("no grid service named {service}"))?;
            println!("{}", service.job(args).qsub_command());
            Ok(())
        }
        Command::CacheClean => {
            let config = Config::from_env()?;
            let removed = CacheFolder::new(&config.cache_folder).cleanup()?;
            println!("Removed {removed} cache folder(s) from {}", config.cache_folder.display());
            Ok(())
        }
        Command::Fingerprint { packet } => {
            let packet = packet.packet()?;
            let fingerprint = packet.fingerprint();
            println!("fingerprint: {fingerprint}");
            if let Ok(config) = Config::from_env() {
                let slot = CacheFolder::new(&config.cache_folder).slot_for(&fingerprint);
                println!("slot: {}", slot.display());
            }
            print!("{}", packet.task_description());
            Ok(())
        }
        Command::Run {
            program,
            packet,
            from_scratch,
        } => cmd_run(program, packet.packet()?.with_from_scratch(from_scratch)).await,
    }
}

async fn cmd_run(program: PathBuf, packet: WorkPacket) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let router = LogRouter::new();

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "labpipe".to_string(),
        log_level: config.log_level.clone(),
        router: Some(router.clone()),
    })?;

    let worker = CommandWorker::new(program, config.temp_folder.join("scratch"));
    let cache: WorkCache<WorkPacket> = WorkCache::new(
        CacheFolder::new(&config.cache_folder),
        Arc::new(worker),
        config.file_wait,
    );
    let loggers = LoggerFactory::new(&config.log_folder, router);

    let (reporter, mut events) = progress::channel();
    let ctx = WorkContext {
        log: Arc::new(loggers.request_log(reporter.clone())),
        reporter,
    };
    let task_id = packet.task_id.clone();
    tokio::spawn(async move { cache.process_request(packet, ctx).await });

    while let Some(event) = events.recv().await {
        match event {
            ProgressEvent::Start { host } => println!("[{task_id}] started on {host}"),
            ProgressEvent::Progress(ProgressInfo::CachedResult { output_path }) => {
                println!("[{task_id}] result: {}", output_path.display())
            }
            ProgressEvent::Progress(ProgressInfo::NewLogFiles {
                output_path,
                error_path,
                ..
            }) => println!(
                "[{task_id}] logs: {} {}",
                output_path.display(),
                error_path.display()
            ),
            ProgressEvent::Progress(info) => println!("[{task_id}] {info:?}"),
            ProgressEvent::Success => println!("[{task_id}] done"),
            ProgressEvent::Failure(error) => anyhow::bail!("[{task_id}] failed: {error}"),
        }
    }
    Ok(())
}
