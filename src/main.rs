use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::{info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

mod cli;

use cli::Cli;
use cli::commands::{Commands, MountCommands, ServeArgs};
use diskjockey_ipc::config::Config;
use diskjockey_ipc::handlers::{BackendHandlerFactory, HelperHandlerFactory, MountRegistry};
use diskjockey_ipc::ipc::messages::{
    Announce, CreateMountRequest, DeleteMountRequest, ListDiskTypesRequest, ListMountsRequest, MountRequest,
    UnmountRequest,
};
use diskjockey_ipc::ipc::{
    Connection, ConnectionConfig, ConnectionPool, ControlServer, Endpoint, MessageServer, Role, ServerConfig,
    TransportListener, redial_hook, request_shutdown,
};
use diskjockey_ipc::supervisor::{ProcessSpec, Supervisor, SupervisorConfig, announce};

const HELPER: &str = "helper";
const BACKEND: &str = "backend";

/// Where log records go
enum LogTarget {
    /// Managed processes log to stderr, which the supervisor drains.
    Stderr,
    File,
}

fn setup_logging(level: &str, target: LogTarget) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    match target {
        LogTarget::Stderr => {
            builder.target(env_logger::Target::Stderr);
            builder.init();
            info!("Logging initialized, writing to stderr");
        }
        LogTarget::File => {
            let log_dir = dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("diskjockey")
                .join("logs");

            fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

            let log_file = log_dir.join("diskjockey.log");
            let target = Box::new(
                fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&log_file)
                    .context("Failed to open log file")?,
            );

            builder.target(env_logger::Target::Pipe(target)).init();
            info!("Logging initialized, writing to: {}", log_file.display());
        }
    }
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        eprintln!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Helper { serve } => run_helper(serve, config).await,
        Commands::Backend { serve, helper_port } => run_backend(serve, *helper_port, config).await,
        Commands::Supervise => run_supervise(cli.config.as_ref(), config).await,
        Commands::Mounts { port, command } => handle_mounts_command(*port, command, config).await,
        Commands::DiskTypes { port } => handle_disk_types_command(*port, config).await,
        Commands::Shutdown { control_socket } => handle_shutdown_command(control_socket, config).await,
    }
}

async fn run_helper(serve: &ServeArgs, config: &Config) -> Result<()> {
    let server = MessageServer::new(ServerConfig::from(config), HelperHandlerFactory::default());
    serve_until_shutdown(HELPER, server, serve).await
}

async fn run_backend(serve: &ServeArgs, helper_port: Option<u16>, config: &Config) -> Result<()> {
    let mut factory = BackendHandlerFactory::new(MountRegistry::new());

    if let Some(port) = helper_port {
        let helper = Arc::new(Connection::new(ConnectionConfig::from(config)));
        helper.set_reconnect_hook(redial_hook(&helper)).await;
        let endpoint = Endpoint::tcp_loopback(port);
        match helper.connect_as(&endpoint, Role::Backend).await {
            Ok(()) => info!("Connected to helper at {}", endpoint),
            Err(e) => warn!("Helper at {} not reachable yet: {}", endpoint, e),
        }
        factory = factory.with_helper(helper);
    }

    let server = MessageServer::new(ServerConfig::from(config), factory);
    serve_until_shutdown(BACKEND, server, serve).await
}

/// Bind an ephemeral loopback port, report it, and serve clients until a
/// shutdown request, a control command or Ctrl-C.
async fn serve_until_shutdown(name: &str, server: MessageServer, serve: &ServeArgs) -> Result<()> {
    if let Some(dir) = &serve.config_dir {
        info!("{} using config directory {}", name, dir.display());
    }

    let listener = TransportListener::bind(&Endpoint::tcp_loopback(0))
        .await
        .context("Failed to bind listener")?;
    let port = listener.local_port().ok_or_else(|| eyre!("listener has no port"))?;

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "PORT={}", port).context("Failed to report port")?;
        stdout.flush().context("Failed to report port")?;
    }

    if let (Some(path), Some(process_name)) = (&serve.announce_socket, &serve.process_name) {
        let message = Announce {
            name: process_name.clone(),
            port,
            pid: std::process::id(),
        };
        announce(path, &message)
            .await
            .context(format!("Failed to announce to {}", path.display()))?;
    }

    let control = match &serve.control_socket {
        Some(path) => Some(ControlServer::bind(path).await.context("Failed to bind control socket")?),
        None => None,
    };
    let control_stop = control.as_ref().map(|c| c.shutdown_token()).unwrap_or_default();
    let control_task = control.map(|c| tokio::spawn(c.run()));

    let requested = server.shutdown_requested();
    let running = server.clone();
    let serving = tokio::spawn(async move { running.run(listener).await });
    info!("{} serving on port {}", name, port);

    tokio::select! {
        _ = requested.cancelled() => info!("{} shutting down on request", name),
        _ = control_stop.cancelled() => info!("{} shutting down on control command", name),
        _ = tokio::signal::ctrl_c() => info!("{} interrupted", name),
    }

    server.stop().await;
    control_stop.cancel();
    if let Some(task) = control_task {
        if let Ok(Err(e)) = task.await {
            warn!("Control socket failed: {}", e);
        }
    }
    if let Ok(Err(e)) = serving.await {
        warn!("Message server failed: {}", e);
    }
    info!("{} stopped", name);
    Ok(())
}

async fn run_supervise(config_path: Option<&PathBuf>, config: &Config) -> Result<()> {
    let settings = &config.supervisor;
    let exe = std::env::current_exe().context("Failed to locate own executable")?;
    fs::create_dir_all(&settings.control_socket_dir).context("Failed to create control socket directory")?;

    let args = |command: &str| {
        let mut args = vec![command.to_string()];
        if let Some(path) = config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        args
    };

    let supervisor = Supervisor::new(SupervisorConfig::from(config));
    supervisor
        .register(
            ProcessSpec::new(HELPER, &exe)
                .with_args(args(HELPER))
                .with_config_dir(settings.config_dir.join(HELPER))
                .with_control_socket(settings.control_socket(HELPER))
                .with_restart(settings.restart_policy()),
        )
        .await?;
    supervisor
        .register(
            ProcessSpec::new(BACKEND, &exe)
                .with_args(args(BACKEND))
                .with_config_dir(settings.config_dir.join(BACKEND))
                .with_control_socket(settings.control_socket(BACKEND))
                .depends_on(HELPER)
                .with_restart(settings.restart_policy()),
        )
        .await?;

    for name in [HELPER, BACKEND] {
        match supervisor.start(name).await {
            Ok(info) => println!("{} {} on port {} (pid {})", "Started".green(), name, info.port, info.pid),
            Err(e) => {
                println!("{} {}: {}", "Failed".red(), name, e);
                supervisor.shutdown().await?;
                return Err(e).context(format!("Failed to start {}", name));
            }
        }
    }

    println!("{}", "Press Ctrl-C to stop".cyan());
    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;

    println!("{}", "Shutting down...".cyan());
    supervisor.shutdown().await.context("Shutdown failed")?;
    for name in supervisor.names().await {
        if let Some(state) = supervisor.state(&name).await {
            println!("  {}: {}", name, state);
        }
    }
    Ok(())
}

fn app_pool(port: u16, config: &Config) -> ConnectionPool {
    ConnectionPool::new(
        Endpoint::tcp_loopback(port),
        config.pool_size(),
        ConnectionConfig::from(config),
    )
    .with_role(Role::App)
}

fn check(error: String) -> Result<()> {
    if error.is_empty() {
        Ok(())
    } else {
        Err(eyre!(error))
    }
}

async fn handle_mounts_command(port: u16, command: &MountCommands, config: &Config) -> Result<()> {
    info!("Handling mounts command: {:?}", command);
    let pool = app_pool(port, config);
    let connection = pool.acquire().await.context("Failed to reach backend")?;

    let result = run_mounts_command(&connection, command).await;
    pool.release(connection);
    result
}

async fn run_mounts_command(connection: &Connection, command: &MountCommands) -> Result<()> {
    match command {
        MountCommands::List => {
            let response = connection.request(&ListMountsRequest {}).await?;
            check(response.error)?;
            if response.mounts.is_empty() {
                println!("{}", "No mounts".yellow());
            }
            for mount in response.mounts {
                let state = if mount.mounted { "mounted".green() } else { "unmounted".normal() };
                println!("{:>4}  {:<20} {:<16} {}", mount.mount_id, mount.name, mount.disk_type, state);
            }
        }
        MountCommands::Create {
            name,
            disk_type,
            options,
        } => {
            let request = CreateMountRequest {
                name: name.clone(),
                disk_type: disk_type.clone(),
                config: options.iter().cloned().collect::<BTreeMap<_, _>>(),
            };
            let response = connection.request(&request).await?;
            check(response.error)?;
            println!("{} {} (id {})", "Created:".green(), name, response.mount_id);
        }
        MountCommands::Delete { id } => {
            let response = connection.request(&DeleteMountRequest { mount_id: *id }).await?;
            check(response.error)?;
            println!("{} {}", "Deleted:".red(), id);
        }
        MountCommands::Mount { id } => {
            let response = connection.request(&MountRequest { mount_id: *id }).await?;
            check(response.error)?;
            println!("{} {}", "Mounted:".green(), id);
        }
        MountCommands::Unmount { id } => {
            let response = connection.request(&UnmountRequest { mount_id: *id }).await?;
            check(response.error)?;
            println!("{} {}", "Unmounted:".yellow(), id);
        }
    }
    Ok(())
}

async fn handle_disk_types_command(port: u16, config: &Config) -> Result<()> {
    let pool = app_pool(port, config);
    let connection = pool.acquire().await.context("Failed to reach backend")?;
    let response = connection.request(&ListDiskTypesRequest {}).await;
    pool.release(connection);

    let response = response?;
    check(response.error)?;
    for disk_type in response.disk_types {
        println!("{:<16} {}", disk_type.name.cyan(), disk_type.description);
    }
    Ok(())
}

async fn handle_shutdown_command(control_socket: &Path, config: &Config) -> Result<()> {
    let timeout = Duration::from_millis(config.connection.request_timeout_ms);
    let response = request_shutdown(control_socket, timeout)
        .await
        .context(format!("Failed to reach {}", control_socket.display()))?;
    if response.success {
        println!("{} {}", "Shutdown:".green(), response.message);
        Ok(())
    } else {
        Err(eyre!("shutdown refused: {}", response.message))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    let level = if cli.is_verbose() {
        "debug"
    } else {
        config.log_level.as_deref().unwrap_or("info")
    };
    let target = match cli.command {
        Commands::Helper { .. } | Commands::Backend { .. } => LogTarget::Stderr,
        _ => LogTarget::File,
    };
    setup_logging(level, target).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
