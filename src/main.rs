use std::{sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use epicars_client::{
    client::{Channel, ReadOutcome, Registry, StateChange},
    config::ClientConfig,
    dbr::{ControlInfo, DbrValue, Limits, ValueAccessMode},
    transport::loopback::LoopbackTransport,
};
use tracing::{error, info, level_filters::LevelFilter};

#[derive(Parser)]
#[command(about = "Read, write and monitor PVs served by an in-process demo database")]
struct Options {
    #[command(subcommand)]
    command: Command,
    /// How much metadata to request: value, status, time or control
    #[arg(short, long, global = true)]
    mode: Option<ValueAccessMode>,
    /// Show debug output
    #[clap(short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Read the current value of one or more PVs
    Get {
        #[clap(required = true, id = "PV_NAME")]
        names: Vec<String>,
    },
    /// Write a value and wait for the update that follows
    Put {
        #[clap(id = "PV_NAME")]
        name: String,
        #[clap(required = true)]
        values: Vec<String>,
    },
    /// Print every value update
    Monitor {
        #[clap(id = "PV_NAME")]
        name: String,
        /// Stop after this many updates
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
    /// List the PVs in the demo database
    List,
}

const DEMO_PVS: &[&str] = &["DEMO:COUNTER", "DEMO:TEMPERATURE", "DEMO:SHUTTER", "DEMO:LABEL"];

fn demo_database() -> Arc<LoopbackTransport> {
    let transport = Arc::new(LoopbackTransport::new());
    let seeded = transport
        .add_pv("DEMO:COUNTER", 0i32)
        .and_then(|_| transport.add_pv("DEMO:TEMPERATURE", 21.5f64))
        .and_then(|_| {
            transport.set_control_info(
                "DEMO:TEMPERATURE",
                ControlInfo {
                    units: "degC".into(),
                    precision: Some(1),
                    display_limits: Limits::new(-20.0, 80.0),
                    alarm_limits: Limits::new(-10.0, 60.0),
                    ..Default::default()
                },
            )
        })
        .and_then(|_| transport.add_pv("DEMO:SHUTTER", DbrValue::Enum(vec![0])))
        .and_then(|_| transport.set_enum_strings("DEMO:SHUTTER", &["Closed", "Open"]))
        .and_then(|_| transport.add_pv("DEMO:LABEL", "beamline"));
    if let Err(e) = seeded {
        error!("Could not build demo database: {e}");
    }
    transport
}

async fn get(registry: &Registry, names: Vec<String>, mode: ValueAccessMode) {
    for name in names {
        let channel = registry.get_or_create_with(&name, mode);
        match channel.connect_and_acquire_value().await {
            ReadOutcome::Success(value) => println!("{name} {value}"),
            other => println!("{name} *** {other:?}"),
        }
    }
}

async fn put(registry: &Registry, name: String, values: Vec<String>) {
    let channel = registry.get_or_create(&name);
    if let Some(old) = channel.connect_and_acquire_value().await.value() {
        println!("Old : {name} {old}");
    }
    let outcome = channel.put_ack(DbrValue::String(values)).await;
    match channel.snapshot().value.as_ref() {
        Some(new) => println!("New : {name} {new} ({outcome:?})"),
        None => println!("{name} *** {outcome:?}"),
    }
}

async fn monitor(
    registry: &Registry,
    transport: Arc<LoopbackTransport>,
    name: String,
    count: usize,
    mode: ValueAccessMode,
) {
    let channel: Channel = registry.get_or_create_with(&name, mode);
    let mut updates = channel.watch();
    channel.subscribe();
    if channel.connect().await != epicars_client::client::ConnectOutcome::Connected {
        println!("{name} *** not connected");
        return;
    }

    // Something to watch
    let ticker = tokio::spawn(async move {
        for tick in 1.. {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = transport.set_value("DEMO:COUNTER", tick);
            let _ = transport.set_value("DEMO:TEMPERATURE", 21.5 + f64::from(tick % 7) * 0.3);
            let _ = transport.set_value("DEMO:SHUTTER", DbrValue::Enum(vec![(tick % 2) as u16]));
        }
    });

    let mut seen = 0;
    while seen < count && updates.changed().await.is_ok() {
        let record = updates.borrow_and_update().clone();
        match &record.change {
            Some(StateChange::ValueAcquired(value) | StateChange::ValueChanged(value)) => {
                seen += 1;
                println!("{name} {value}");
            }
            Some(StateChange::ConnectionLost) => println!("{name} *** disconnected"),
            _ => (),
        }
    }
    ticker.abort();
}

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();

    tracing_subscriber::fmt()
        .with_max_level(match opts.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        })
        .init();

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    let mode = opts.mode.unwrap_or(config.default_access_mode);
    let transport = demo_database();
    let registry = Registry::new(config, transport.clone());

    match opts.command {
        Command::Get { names } => get(&registry, names, mode).await,
        Command::Put { name, values } => put(&registry, name, values).await,
        Command::Monitor { name, count } => {
            monitor(&registry, transport, name, count, mode).await
        }
        Command::List => DEMO_PVS.iter().for_each(|pv| println!("{pv}")),
    }
    registry.deregister_all();
    info!("Done.");
}
