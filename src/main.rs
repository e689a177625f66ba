use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use tokio::{net::TcpListener, sync::watch};
use tracing::{error, info, warn};

use nut_relay::{
    logging::{self, LoggingMode},
    mailer::Mailer,
    server,
    settings::{self, Settings},
    error, EventHub, Fanout, Fetcher, NutClient, UpsMonitor,
};

#[derive(Parser, Debug)]
#[clap(name = "nut-relay", version, about)]
struct Args {
    /// Settings file, missing files are ignored.
    #[clap(short, long, default_value = settings::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Seconds between polls, overrides the settings file.
    #[clap(short = 'i', long)]
    poll_interval: Option<u64>,

    /// Address for the HTTP server, overrides the settings file.
    #[clap(short, long)]
    listen: Option<String>,

    /// Log every poll cycle.
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mode = if args.verbose {
        LoggingMode::Verbose
    } else {
        LoggingMode::Normal
    };
    if let Err(e) = logging::init_logging(mode) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "nut-relay failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> error::Result<()> {
    let mut settings = Settings::load(&args.config)?;
    if let Some(poll_interval) = args.poll_interval {
        settings.poll_interval = poll_interval;
    }
    if let Some(listen) = args.listen {
        settings.listen = listen;
    }
    settings.validate()?;

    info!(
        host = %settings.nut.host,
        port = settings.nut.port,
        ups = settings.nut.ups.as_deref().unwrap_or("<first listed>"),
        poll_interval = settings.poll_interval,
        "Starting UPS monitor"
    );

    let client = NutClient::new(settings.nut.clone());
    let fetcher = match &settings.nut.ups {
        Some(unit) => Fetcher::for_unit(client, unit.clone()),
        None => Fetcher::new(client),
    };

    let hub = EventHub::new(settings.event_buffer);
    let mut fanout = Fanout::new().with(Arc::new(hub.clone()));
    if let Some(mailer_settings) = settings.mailer.clone() {
        fanout = fanout.with(Arc::new(Mailer::new(mailer_settings)?));
        info!("Mailing status changes");
    }

    let monitor = Arc::new(UpsMonitor::new(fetcher, Arc::new(fanout), settings.interval()));
    monitor.on_event_registered(settings.event_name.clone());
    monitor.start()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down.");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "Can't listen for ctrl-c, running until killed");
                // Holding the sender keeps the server up.
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    let listener = TcpListener::bind(settings.listen_addr()?)
        .await
        .map_err(error::Error::Server)?;
    let app = server::build_router(monitor.clone(), hub, shutdown_rx.clone());
    let result = server::serve(listener, app, server::stopped(shutdown_rx)).await;

    // Stopping joins the poller thread, which may be mid-fetch.
    let poller = monitor.clone();
    let _ = tokio::task::spawn_blocking(move || poller.stop()).await;

    result
}
