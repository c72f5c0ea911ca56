//! Command-line front end for [`flasher_core`]: parses arguments, opens the
//! serial transport, drives the core's probe/flash/write-ieee/dump-metadata
//! operations, and maps its `Error` to the exit codes described in §6. The
//! core itself knows nothing about argument parsing or process exit codes;
//! that glue lives entirely here, the way `packager`/`cfpa-update` keep
//! their `main.rs` a thin wrapper around a typed library.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};

use flasher_core::{
    evaluate_policy, ApplicationType, Error as CoreError, Flasher, FlashPolicy, GblImage,
    PolicyOutcome, ProbeConfig, ProbeMethod, ResetHook, SerialTransport,
};

const DEFAULT_COMMAND_DEADLINE: Duration = Duration::from_secs(5);
const DEFAULT_FLASH_DEADLINE: Duration = Duration::from_secs(30);

/// Probe and flash Silicon Labs radio coprocessors running EZSP, CPC,
/// Spinel, or the Gecko bootloader.
#[derive(Parser)]
#[command(name = "slz-flash", version, about)]
struct Cli {
    /// Serial device path or URL the radio coprocessor is attached to.
    /// Required for every subcommand except `dump-gbl-metadata`, which
    /// never touches the transport; checked by hand in [`device_path`]
    /// rather than via `required = true` since clap rejects a required
    /// global argument outright.
    #[arg(long, global = true)]
    device: Option<String>,

    /// Increase log verbosity; repeat for more detail (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Baud rate the Gecko bootloader's menu runs at once entered.
    #[arg(long, default_value_t = 115_200, global = true)]
    bootloader_baudrate: u32,

    /// Candidate baud rates to try while probing for a CPC application.
    #[arg(long, value_delimiter = ',', default_value = "460800,115200,230400", global = true)]
    cpc_baudrate: Vec<u32>,

    /// Candidate baud rates to try while probing for an EZSP application.
    #[arg(long, value_delimiter = ',', default_value = "115200", global = true)]
    ezsp_baudrate: Vec<u32>,

    /// Candidate baud rates to try while probing for a Spinel application.
    #[arg(long, value_delimiter = ',', default_value = "460800", global = true)]
    spinel_baudrate: Vec<u32>,

    /// Which application kinds to probe for, and in what order.
    #[arg(long, value_delimiter = ',', default_value = "bootloader,cpc,ezsp,spinel", global = true)]
    probe_method: Vec<ProbeMethodArg>,

    /// External hardware reset hook to invoke before entering the
    /// bootloader, for boards whose reset pin isn't wired through the
    /// application protocol itself.
    #[arg(long, global = true)]
    bootloader_reset: Option<ResetHookArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProbeMethodArg {
    Bootloader,
    Cpc,
    Ezsp,
    Spinel,
}

impl From<ProbeMethodArg> for ProbeMethod {
    fn from(v: ProbeMethodArg) -> Self {
        match v {
            ProbeMethodArg::Bootloader => ProbeMethod::Bootloader,
            ProbeMethodArg::Cpc => ProbeMethod::Cpc,
            ProbeMethodArg::Ezsp => ProbeMethod::Ezsp,
            ProbeMethodArg::Spinel => ProbeMethod::Spinel,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ResetHookArg {
    Yellow,
    Ihost,
    Sonoff,
}

impl From<ResetHookArg> for ResetHook {
    fn from(v: ResetHookArg) -> Self {
        match v {
            ResetHookArg::Yellow => ResetHook::Yellow,
            ResetHookArg::Ihost => ResetHook::Ihost,
            ResetHookArg::Sonoff => ResetHook::Sonoff,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Identify the application currently running on the device.
    Probe,
    /// Validate and upload a GBL image, booting the result.
    Flash {
        /// Path to the GBL image to flash.
        #[arg(long)]
        firmware: PathBuf,
        /// Flash even if the image targets a different firmware personality
        /// than the one currently running.
        #[arg(long)]
        allow_cross_flashing: bool,
        /// Flash even if the image's version is older than the running one.
        #[arg(long)]
        allow_downgrades: bool,
        /// Exit successfully without flashing if the image's version
        /// already matches the running one.
        #[arg(long)]
        ensure_exact_version: bool,
        /// Bypass every policy check (cross-flash, downgrade, exact-version).
        #[arg(long)]
        force: bool,
    },
    /// Write (and verify) the device's custom IEEE EUI-64 address.
    WriteIeee {
        /// EUI-64 as 16 hex digits, with or without colons.
        #[arg(long)]
        ieee: String,
    },
    /// Parse a GBL image and print its NabuCasa metadata as JSON.
    DumpGblMetadata {
        /// Path to the GBL image.
        #[arg(long)]
        firmware: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_time().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            return ExitCode::from(3);
        }
    };
    rt.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> ExitCode {
    let result = match &cli.command {
        Command::Probe => run_probe(&cli).await,
        Command::Flash { .. } => run_flash(&cli).await,
        Command::WriteIeee { ieee } => run_write_ieee(&cli, ieee).await,
        Command::DumpGblMetadata { firmware } => run_dump_metadata(firmware),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(3)
        }
    }
}

fn probe_config(cli: &Cli) -> ProbeConfig {
    ProbeConfig {
        methods: cli.probe_method.iter().copied().map(Into::into).collect(),
        bootloader_bauds: vec![cli.bootloader_baudrate],
        cpc_bauds: cli.cpc_baudrate.clone(),
        ezsp_bauds: cli.ezsp_baudrate.clone(),
        spinel_bauds: cli.spinel_baudrate.clone(),
        ..ProbeConfig::default()
    }
}

fn flash_policy(cli: &Cli) -> FlashPolicy {
    FlashPolicy {
        bootloader_baudrate: cli.bootloader_baudrate,
        bootloader_reset: cli.bootloader_reset.map(Into::into),
        ..FlashPolicy::default()
    }
}

/// Maps a core error to the exit code its subcommand is specified to use.
/// `probe` and `write-ieee` don't have the fine-grained codes `flash` does —
/// they collapse everything to a flat 1/3.
fn exit_code_for_flash_error(err: &CoreError) -> ExitCode {
    match err {
        CoreError::ImageInvalid(_) => ExitCode::from(4),
        CoreError::CrossFlashRefused { .. } | CoreError::DowngradeRefused { .. } => ExitCode::from(2),
        _ => ExitCode::from(3),
    }
}

/// Validates that `--device` was given. It can't be a required global
/// clap argument (clap panics on that combination), so every subcommand
/// that needs the transport checks here instead.
fn device_path(cli: &Cli) -> Result<&str> {
    cli.device.as_deref().ok_or_else(|| anyhow::anyhow!("--device is required"))
}

async fn open_transport(cli: &Cli) -> Result<SerialTransport> {
    let device = device_path(cli)?;
    let initial_baud = cli.ezsp_baudrate.first().copied().unwrap_or(115_200);
    SerialTransport::open(device, initial_baud).with_context(|| format!("failed to open serial device '{device}'"))
}

async fn run_probe(cli: &Cli) -> Result<ExitCode> {
    let transport = open_transport(cli).await?;
    let mut flasher = Flasher::new(Box::new(transport));
    match flasher.probe(&probe_config(cli)).await {
        Ok(result) => {
            println!("{{\"app_type\": \"{}\", \"app_version\": \"{}\"}}", result.app_type, result.app_version);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            warn!("probe failed: {e}");
            Ok(ExitCode::from(1))
        }
    }
}

async fn run_flash(cli: &Cli) -> Result<ExitCode> {
    let Command::Flash { firmware, allow_cross_flashing, allow_downgrades, ensure_exact_version, force } =
        &cli.command
    else {
        unreachable!("dispatch only calls run_flash for Command::Flash")
    };

    let bytes = std::fs::read(firmware).with_context(|| format!("failed to read '{}'", firmware.display()))?;
    let image = match GblImage::parse(&bytes) {
        Ok(image) => image,
        Err(CoreError::ImageInvalid(reason)) => {
            error!("image invalid: {reason}");
            return Ok(ExitCode::from(4));
        }
        Err(e) => return Err(e.into()),
    };

    let transport = open_transport(cli).await?;
    let mut flasher = Flasher::new(Box::new(transport));

    let probe = match flasher.probe(&probe_config(cli)).await {
        Ok(probe) => probe,
        Err(e) => {
            error!("could not identify the running application: {e}");
            return Ok(ExitCode::from(3));
        }
    };
    info!("identified {} {} at {} baud", probe.app_type, probe.app_version, probe.baudrate_used);

    let policy = FlashPolicy {
        allow_cross_flashing: *allow_cross_flashing,
        allow_downgrades: *allow_downgrades,
        ensure_exact_version: *ensure_exact_version,
        force: *force,
        ..flash_policy(cli)
    };

    match evaluate_policy(&probe, &image, &policy) {
        Ok(PolicyOutcome::NothingToDo) => {
            info!("image version already matches the running version; nothing to do");
            return Ok(ExitCode::SUCCESS);
        }
        Ok(PolicyOutcome::Proceed) => {}
        Err(e) => {
            error!("{e}");
            return Ok(exit_code_for_flash_error(&e));
        }
    }

    if let Err(e) = flasher.enter_bootloader(&probe, &policy, DEFAULT_COMMAND_DEADLINE).await {
        error!("failed to enter the bootloader: {e}");
        return Ok(exit_code_for_flash_error(&e));
    }

    let mut last_reported = 0usize;
    let mut progress = |sent: usize, total: usize| {
        if sent != last_reported {
            last_reported = sent;
            info!("flashing block {sent}/{total}");
        }
    };

    if let Err(e) = flasher.flash(&image, Some(&mut progress), DEFAULT_FLASH_DEADLINE).await {
        error!("flash failed: {e}");
        return Ok(exit_code_for_flash_error(&e));
    }

    info!("flash complete");
    Ok(ExitCode::SUCCESS)
}

async fn run_write_ieee(cli: &Cli, ieee: &str) -> Result<ExitCode> {
    let eui = parse_eui64(ieee)?;

    let transport = open_transport(cli).await?;
    let mut flasher = Flasher::new(Box::new(transport));

    let probe = flasher
        .probe(&probe_config(cli))
        .await
        .context("could not identify the running application")?;
    if probe.app_type != ApplicationType::Ezsp {
        bail!("write-ieee requires an EZSP application to be running, found {}", probe.app_type);
    }

    let current = flasher.read_eui64(DEFAULT_COMMAND_DEADLINE).await.context("failed to read current EUI-64")?;
    if current == eui {
        info!("EUI-64 already matches {}", format_eui64(&current));
        return Ok(ExitCode::SUCCESS);
    }

    flasher.write_eui64(eui, DEFAULT_COMMAND_DEADLINE).await.context("failed to write EUI-64")?;
    let verified = flasher.read_eui64(DEFAULT_COMMAND_DEADLINE).await.context("failed to read back EUI-64")?;
    if verified != eui {
        bail!("EUI-64 read back as {} after writing {}", format_eui64(&verified), format_eui64(&eui));
    }

    info!("wrote EUI-64 {}", format_eui64(&eui));
    Ok(ExitCode::SUCCESS)
}

fn run_dump_metadata(firmware: &PathBuf) -> Result<ExitCode> {
    let bytes = std::fs::read(firmware).with_context(|| format!("failed to read '{}'", firmware.display()))?;
    let image = GblImage::parse(&bytes).context("failed to parse GBL image")?;
    let metadata = image.get_metadata().context("GBL image carries no NabuCasa metadata")?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(ExitCode::SUCCESS)
}

/// Parses an EUI-64 given as 16 hex digits, with or without colon
/// separators (§6).
fn parse_eui64(s: &str) -> Result<[u8; 8]> {
    let cleaned: String = s.chars().filter(|c| *c != ':').collect();
    if cleaned.len() != 16 {
        bail!("EUI-64 '{s}' must be 16 hex digits (colons optional)");
    }
    let mut eui = [0u8; 8];
    for (i, byte) in eui.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&cleaned[i * 2..i * 2 + 2], 16)
            .with_context(|| format!("EUI-64 '{s}' contains a non-hex digit"))?;
    }
    Ok(eui)
}

fn format_eui64(eui: &[u8; 8]) -> String {
    eui.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_eui64_without_colons() {
        assert_eq!(parse_eui64("00124B0001020304").unwrap(), [0x00, 0x12, 0x4B, 0x00, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn parses_eui64_with_colons() {
        assert_eq!(
            parse_eui64("00:12:4b:00:01:02:03:04").unwrap(),
            [0x00, 0x12, 0x4B, 0x00, 0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(parse_eui64("00124B00010203").is_err());
    }

    #[test]
    fn round_trips_through_format_eui64() {
        let eui = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11];
        assert_eq!(parse_eui64(&format_eui64(&eui)).unwrap(), eui);
    }
}
