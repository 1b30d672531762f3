mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wasteink_core::{
    format_byte_sequence, targets, waste, BruteForceOutcome, EepromSession, Error, ExpectedPattern,
    ModelEntry, ModelRegistry, Password, PrinterFacade, SnmpAddress, StorageAction, ToolConfig,
    UdpSnmpClient, WasteGroup,
};

use crate::logging::{init_logging, LogLevel};

const DEFAULT_CONFIG: &str = "wasteink.ron";

/// Epson waste-ink counter tool over SNMP.
#[derive(Parser, Debug)]
#[command(name = "wasteink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// RON configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Printer host name or address
    #[arg(long, global = true)]
    host: Option<String>,

    /// Model name as catalogued in the registry
    #[arg(long, global = true)]
    model: Option<String>,

    /// JSON model registry replacing the bundled one
    #[arg(long, global = true, value_name = "FILE")]
    registry: Option<PathBuf>,

    /// Password override in `first.second` form
    #[arg(long, global = true)]
    password: Option<Password>,

    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List catalogued models, or print one entry with --model
    Models,
    /// Read ink levels, waste counters and maintenance levels
    Stats {
        /// Skip sysName, device description and serial number
        #[arg(long)]
        no_identity: bool,
    },
    /// Search the two-byte password space
    BruteForce {
        /// EEPROM address probed for each candidate
        #[arg(long, default_value_t = 0)]
        test_oid: u8,
        #[arg(long)]
        workers: Option<usize>,
        /// Accept responses matching this expression instead of an EE record
        #[arg(long)]
        pattern: Option<String>,
    },
    /// Read EEPROM addresses
    Read {
        #[arg(required = true)]
        oids: Vec<u8>,
    },
    /// Write one EEPROM address
    Write { oid: u8, value: u8 },
    /// Read a range of EEPROM addresses
    Dump {
        #[arg(long, default_value_t = 0)]
        start: u8,
        #[arg(long, default_value_t = 255)]
        end: u8,
    },
    /// Zero waste counters and set maintenance levels to the threshold
    ResetWaste,
    /// Derive a waste group total from an observed percentage
    Calibrate {
        /// Index into the model's waste groups
        #[arg(long, default_value_t = 0)]
        group: usize,
        /// Percentage shown by the printer for the current counter
        #[arg(long, default_value_t = 80.0)]
        percentage: f64,
        /// Use this raw counter instead of reading the printer
        #[arg(long)]
        raw: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let logging = init_logging(cli.log_level);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = match ToolConfig::load_or_default(&config_path) {
        Ok(config) => config,
        Err(error) => return fail(&error),
    };
    if let Err(details) = logging.apply_configured(config.log_filter.as_deref()) {
        warn!(target: targets::APP, details = %details, "Ignoring configured log filter");
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: targets::APP, "Interrupt received, cancelling");
            interrupt.cancel();
        }
    });

    match run(cli, config, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => fail(&error),
    }
}

fn fail(error: &Error) -> ExitCode {
    error!(target: targets::APP, error = %error.technical_detail(), "Command failed");
    eprintln!("Error: {}", error.user_summary());
    ExitCode::FAILURE
}

async fn run(cli: Cli, config: ToolConfig, cancel: &CancellationToken) -> Result<(), Error> {
    let registry = load_registry(cli.registry.as_ref().or(config.registry_path.as_ref()))?;

    match cli.command {
        Command::Models => match cli.model.as_deref() {
            Some(name) => emit(&registry.lookup(name)?.to_record()),
            None => emit(&registry.names().collect::<Vec<_>>()),
        },
        Command::Calibrate {
            group,
            percentage,
            raw: Some(raw),
        } => {
            let model = select_model(&registry, cli.model.as_deref(), cli.password)?;
            let oids = waste_group(&model, group)?.oids().to_vec();
            let total = waste::calibrate(raw, percentage)?;
            emit(&json!({ "oids": oids, "raw": raw, "percentage": percentage, "total": total }))
        }
        command => {
            let host = cli
                .host
                .ok_or_else(|| Error::invalid_parameter("host", "required for this command"))?;
            let model = select_model(&registry, cli.model.as_deref(), cli.password)?;
            let session = connect(&config, &host, &model);
            drive(command, session, model, &config, cancel).await
        }
    }
}

async fn drive(
    command: Command,
    mut session: EepromSession<UdpSnmpClient>,
    model: ModelEntry,
    config: &ToolConfig,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    match command {
        Command::Stats { no_identity } => {
            let mut printer = PrinterFacade::new(session, model);
            if no_identity {
                printer = printer.without_identity();
            }
            let snapshot = printer.stats(cancel).await?;
            for warning in &snapshot.warnings {
                warn!(target: targets::APP, warning = %warning, "Snapshot warning");
            }
            emit(&snapshot)
        }
        Command::BruteForce {
            test_oid,
            workers,
            pattern,
        } => {
            let pattern = match pattern {
                Some(pattern) => ExpectedPattern::Regex(
                    Regex::new(&pattern)
                        .map_err(|error| Error::invalid_parameter("pattern", error.to_string()))?,
                ),
                None => ExpectedPattern::EepromEcho,
            };
            let mut brute_force = config.brute_force;
            if let Some(workers) = workers {
                brute_force.workers = workers;
            }
            let outcome = session
                .brute_force(test_oid, &pattern, &brute_force, cancel)
                .await;
            let status = match outcome {
                BruteForceOutcome::Found { .. } => "found",
                BruteForceOutcome::NotFound { .. } => "not_found",
                BruteForceOutcome::Cancelled { .. } => "cancelled",
            };
            emit(&json!({
                "model": model.name,
                "status": status,
                "password": outcome.password().map(|password| password.to_string()),
                "attempts": outcome.attempts(),
            }))?;
            if let BruteForceOutcome::Cancelled { .. } = outcome {
                return Err(Error::Cancelled);
            }
            Ok(())
        }
        Command::Read { oids } => {
            let values = session.read_many(&oids).await?;
            let values: Vec<_> = oids
                .iter()
                .zip(values)
                .map(|(oid, value)| json!({ "oid": oid, "value": value }))
                .collect();
            emit(&values)
        }
        Command::Write { oid, value } => {
            session.write(oid, value).await?;
            info!(target: targets::APP, oid, value, "EEPROM write accepted");
            emit(&json!({ "oid": oid, "value": value, "written": true }))
        }
        Command::Dump { start, end } => {
            if start > end {
                return Err(Error::invalid_parameter(
                    "start",
                    format!("{start} is past end {end}"),
                ));
            }
            let values = session.dump(start..=end).await;
            emit(&values)
        }
        Command::ResetWaste => {
            let mut printer = PrinterFacade::new(session, model);
            let report = printer.reset_waste_ink(cancel).await?;
            emit(&report)
        }
        Command::Calibrate {
            group, percentage, ..
        } => {
            let oids = waste_group(&model, group)?.oids().to_vec();
            let values = session.read_many(&oids).await?;
            let calibrated = WasteGroup::calibrated(oids.clone(), &values, percentage)?;
            emit(&json!({
                "oids": oids,
                "registers": values,
                "raw": calibrated.counter(&values)?.effective(),
                "percentage": percentage,
                "total": calibrated.total(),
            }))
        }
        Command::Models => Ok(()),
    }
}

fn load_registry(path: Option<&PathBuf>) -> Result<ModelRegistry, Error> {
    let Some(path) = path else {
        return ModelRegistry::builtin();
    };
    let loaded = ModelRegistry::load_from_path(path)?;
    for error in &loaded.errors {
        warn!(
            target: targets::APP,
            path = %path.display(),
            error = %error.technical_detail(),
            "Registry entry skipped"
        );
    }
    Ok(loaded.registry)
}

fn select_model(
    registry: &ModelRegistry,
    name: Option<&str>,
    password: Option<Password>,
) -> Result<ModelEntry, Error> {
    let name = name.ok_or_else(|| Error::invalid_parameter("model", "required for this command"))?;
    let model = registry.lookup(name)?;
    Ok(match password {
        Some(password) => model.with_password(password),
        None => model.clone(),
    })
}

fn waste_group(model: &ModelEntry, index: usize) -> Result<&WasteGroup, Error> {
    model.waste_inks.get(index).ok_or_else(|| {
        Error::invalid_parameter(
            "group",
            format!("{} has {} waste groups", model.name, model.waste_inks.len()),
        )
    })
}

fn connect(config: &ToolConfig, host: &str, model: &ModelEntry) -> EepromSession<UdpSnmpClient> {
    let client = Arc::new(UdpSnmpClient::new(config.snmp.clone()));
    let address = SnmpAddress::new(host, config.snmp.port);
    info!(
        target: targets::APP,
        address = %address,
        model = %model.name,
        password = %model.password,
        write_suffix = %format_byte_sequence(&model.eeprom_write),
        "Session opened"
    );
    EepromSession::new(client, address, model)
        .with_retry(config.retry)
        .with_community(config.snmp.community.clone())
        .with_timeout(config.snmp.timeout())
}

fn emit(value: &impl Serialize) -> Result<(), Error> {
    let rendered = serde_json::to_string_pretty(value).map_err(|source| Error::Json {
        action: StorageAction::Save,
        path: None,
        source,
    })?;
    println!("{rendered}");
    Ok(())
}
