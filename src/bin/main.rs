use std::{
    error::Error,
    path::Path,
    process,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use workbench::{
    cli::{Cli, Commands, parse_args},
    config::{Manifest, load_manifest, locate},
    coordinator::{Coordinator, RunOptions, ShutdownReason, ShutdownToken, install_signal_handler},
    error::WorkbenchError,
    logs::spawn_printer,
    output::Console,
    pid::PidRegistry,
    service::{HealthProbe, HealthSettings, HealthStatus, LaunchDescriptor},
    status::render_services,
};

/// Upper bound on waiting for the printer to drain once services are down.
const PRINTER_DRAIN: Duration = Duration::from_secs(2);

fn main() {
    let args = parse_args();
    init_logging(&args);
    let console = Console::new(args.quiet, args.verbose);

    if let Err(err) = run(args, console) {
        console.fail(&err);
        if let Some(source) = err.source() {
            debug!("Caused by: {source}");
        }
        process::exit(1);
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = if args.verbose {
                "debug"
            } else if args.quiet {
                "error"
            } else {
                "warn"
            };
            EnvFilter::new(level)
        })
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(args: Cli, console: Console) -> Result<(), WorkbenchError> {
    let (manifest_path, root) = locate(args.manifest.as_deref())?;
    debug!("Using manifest {}", manifest_path.display());
    let manifest = load_manifest(&manifest_path)?;
    let registry = PidRegistry::new(&root);

    match args.command {
        Commands::Up {
            service,
            health_timeout,
            stop_timeout,
        } => {
            let options = RunOptions {
                health: HealthSettings {
                    timeout: Duration::from_secs(health_timeout),
                    ..HealthSettings::default()
                },
                stop_timeout: Duration::from_secs(stop_timeout),
                ..RunOptions::default()
            };
            up(&manifest, &root, registry, service.as_deref(), options, console)
        }
        Commands::Down { service } => down(&manifest, &registry, service.as_deref(), console),
        Commands::Status => {
            console.print(render_services(&manifest, &registry.read_all()));
            Ok(())
        }
    }
}

fn up(
    manifest: &Manifest,
    root: &Path,
    registry: PidRegistry,
    only: Option<&str>,
    options: RunOptions,
    console: Console,
) -> Result<(), WorkbenchError> {
    let descriptors = manifest.launch_descriptors(root, only)?;

    let running = registry.read_all();
    for descriptor in &descriptors {
        if let Some(record) = running.get(&descriptor.name) {
            warn!(
                "Service '{}' already has a live record (pid {}); it will be replaced",
                descriptor.name, record.pid
            );
        }
    }

    let token = ShutdownToken::new();
    install_signal_handler(&token)?;

    console.banner(format!("Starting {}", manifest.workbench.name));
    for descriptor in &descriptors {
        console.step(format!("starting {}", descriptor.name));
        if console.is_verbose() {
            console.detail(format!(
                "{} (in {}, health: {})",
                descriptor.command,
                descriptor.working_dir.display(),
                HealthProbe::resolve(descriptor.health_check.as_deref(), descriptor.port)
            ));
        }
    }

    let mut coordinator = Coordinator::new(descriptors.clone(), registry, options, token)?;
    let started = coordinator.start();
    if started.is_ok() && coordinator.token().is_requested() {
        coordinator.shutdown();
        console.warn("Interrupted during startup");
        console.step("All services stopped.");
        return Ok(());
    }
    report_health(&descriptors, coordinator.report().results(), console);

    if let Err(err) = started {
        if let WorkbenchError::StartupFailed { services } = &err {
            for name in services {
                if let Some(descriptor) = descriptors.iter().find(|d| &d.name == name) {
                    failure_hint(descriptor, console);
                }
            }
            console.step("All services stopped.");
        }
        return Err(err);
    }

    console.banner("Streaming output (Ctrl+C to stop)");
    let (sender, receiver) = mpsc::channel();
    let printer = spawn_printer(receiver);
    let streams = coordinator.stream(sender);

    let reason = coordinator.wait_for_shutdown();
    coordinator.shutdown();

    // Streams end once their pipes close; the printer once every sender is gone.
    let deadline = Instant::now() + PRINTER_DRAIN;
    for stream in streams.into_iter().chain(std::iter::once(printer)) {
        while !stream.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        if stream.is_finished() {
            let _ = stream.join();
        }
    }

    match reason {
        ShutdownReason::Signal => console.step("All services stopped."),
        ShutdownReason::AllExited => console.step("All services exited."),
        ShutdownReason::Crashed(services) => {
            console.step("All services stopped.");
            return Err(WorkbenchError::ServicesCrashed { services });
        }
    }
    Ok(())
}

fn report_health(
    descriptors: &[LaunchDescriptor],
    results: &[(String, HealthStatus)],
    console: Console,
) {
    for descriptor in descriptors {
        let status = results
            .iter()
            .find(|(name, _)| name == &descriptor.name)
            .map(|(_, status)| *status);
        match status {
            Some(HealthStatus::Healthy) => console.ok(format!("{} healthy", descriptor.name)),
            Some(HealthStatus::InconclusiveButAlive) => console.warn(format!(
                "{} running (health check inconclusive)",
                descriptor.name
            )),
            Some(HealthStatus::Failed) => {
                console.fail(format!("{} failed to start", descriptor.name))
            }
            None => {}
        }
    }
}

fn failure_hint(descriptor: &LaunchDescriptor, console: Console) {
    match descriptor.port {
        Some(port) => console.hint(format!(
            "{}: port {port} may already be in use; check with `lsof -i :{port}`",
            descriptor.name
        )),
        None => console.hint(format!(
            "{}: `{}` exited; run it in {} to see why",
            descriptor.name,
            descriptor.command,
            descriptor.working_dir.display()
        )),
    }
}

fn down(
    manifest: &Manifest,
    registry: &PidRegistry,
    only: Option<&str>,
    console: Console,
) -> Result<(), WorkbenchError> {
    if let Some(name) = only
        && manifest.repo(name).is_none()
    {
        return Err(WorkbenchError::UnknownService {
            service: name.to_string(),
            available: manifest.repo_names(),
        });
    }

    let running = registry.read_all();
    if only.is_none() && running.is_empty() {
        console.step("No services are currently running");
        return Ok(());
    }

    let targets: Vec<String> = match only {
        Some(name) => vec![name.to_string()],
        None => running.keys().cloned().collect(),
    };

    for name in targets {
        if registry.kill_by_record(&name)? {
            console.ok(format!("{name} stopped"));
        } else {
            console.step(format!("{name} already stopped"));
        }
    }
    Ok(())
}
