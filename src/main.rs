use std::path::PathBuf;
use std::sync::Arc;

use fastboot_flasher_lib::app::config::{load_config, load_config_from_path, FlasherConfig};
use fastboot_flasher_lib::app::error::FlashError;
use fastboot_flasher_lib::app::fastboot::locator::{
    resolve_adb_program, resolve_fastboot_program, validate_program,
};
use fastboot_flasher_lib::app::fastboot::HostDeviceController;
use fastboot_flasher_lib::app::flasher::hooks::VendorImagesHook;
use fastboot_flasher_lib::app::flasher::{FlashOrchestrator, FlashReport};
use fastboot_flasher_lib::app::interrupt::InterruptGate;
use fastboot_flasher_lib::app::logging::init_logging;
use fastboot_flasher_lib::app::models::{BuildArtifact, UserDataFlashOption};
use fastboot_flasher_lib::app::resources::{
    DirectoryResources, FlashingResourceProvider, NoResources,
};
use fastboot_flasher_lib::app::scheduler::FlashPermitCoordinator;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

const USAGE: &str = "Usage: fastboot_flasher --build BUILD.json [--serial SERIAL] [--config PATH] \
[--userdata-flash OPTION] [--force-system-flash] [--wipe-skip-list a,b] \
[--fastboot-flash-option OPT]... [--resources DIR] [--skip-post-flash] [--json]

Ctrl-C or SIGTERM stops the flash at the next point where the device is safe to leave.";

const EXIT_USAGE: i32 = 1;
const EXIT_SETUP: i32 = 2;
const EXIT_BUILD: i32 = 3;
const EXIT_UNAVAILABLE: i32 = 4;
const EXIT_INTERRUPTED: i32 = 5;

#[derive(Debug, Clone)]
struct Args {
    serial: Option<String>,
    build: PathBuf,
    config: Option<PathBuf>,
    userdata_flash: Option<UserDataFlashOption>,
    force_system_flash: bool,
    wipe_skip_list: Option<Vec<String>>,
    fastboot_flash_options: Vec<String>,
    resources: Option<PathBuf>,
    skip_post_flash: bool,
    json: bool,
}

#[derive(Serialize)]
struct FlashSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<FlashReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<FlashError>,
}

fn parse_args() -> Result<Args, String> {
    let mut serial = std::env::var("ANDROID_SERIAL")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let mut build: Option<PathBuf> = None;
    let mut config: Option<PathBuf> = None;
    let mut userdata_flash: Option<UserDataFlashOption> = None;
    let mut force_system_flash = false;
    let mut wipe_skip_list: Option<Vec<String>> = None;
    let mut fastboot_flash_options = Vec::new();
    let mut resources: Option<PathBuf> = None;
    let mut skip_post_flash = false;
    let mut json = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => {
                serial = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--build" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--build requires a value".to_string())?;
                build = Some(PathBuf::from(value));
            }
            "--config" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--config requires a value".to_string())?;
                config = Some(PathBuf::from(value));
            }
            "--userdata-flash" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--userdata-flash requires a value".to_string())?;
                userdata_flash = Some(value.parse()?);
            }
            "--force-system-flash" => {
                force_system_flash = true;
            }
            "--wipe-skip-list" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--wipe-skip-list requires a value".to_string())?;
                wipe_skip_list = Some(
                    value
                        .split(',')
                        .map(|item| item.trim().to_string())
                        .filter(|item| !item.is_empty())
                        .collect(),
                );
            }
            "--fastboot-flash-option" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--fastboot-flash-option requires a value".to_string())?;
                fastboot_flash_options.push(value);
            }
            "--resources" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--resources requires a value".to_string())?;
                resources = Some(PathBuf::from(value));
            }
            "--skip-post-flash" => {
                skip_post_flash = true;
            }
            "--json" => {
                json = true;
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("Unknown arg: {other}\n{USAGE}")),
        }
    }

    let build = build.ok_or_else(|| format!("--build is required\n{USAGE}"))?;
    Ok(Args {
        serial,
        build,
        config,
        userdata_flash,
        force_system_flash,
        wipe_skip_list,
        fastboot_flash_options,
        resources,
        skip_post_flash,
        json,
    })
}

fn apply_args(config: &mut FlasherConfig, args: &Args) {
    if let Some(option) = args.userdata_flash {
        config.flash.userdata_flash = option;
    }
    if args.force_system_flash {
        config.flash.force_system_flash = true;
    }
    if let Some(skip) = &args.wipe_skip_list {
        config.flash.wipe_skip_list = skip.clone();
    }
    if !args.fastboot_flash_options.is_empty() {
        config.flash.fastboot_flash_options = args.fastboot_flash_options.clone();
    }
    if args.skip_post_flash {
        config.flash.skip_post_flash_setup = true;
    }
}

fn exit_code(err: &FlashError) -> i32 {
    match err {
        FlashError::Setup { .. } => EXIT_SETUP,
        FlashError::Build { .. } => EXIT_BUILD,
        FlashError::DeviceUnavailable { .. } => EXIT_UNAVAILABLE,
        FlashError::Interrupted { .. } => EXIT_INTERRUPTED,
    }
}

fn finish(args: &Args, summary: FlashSummary, code: i32) -> ! {
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).unwrap_or_default()
        );
    } else if let Some(report) = &summary.report {
        println!(
            "{}: flashed {} ({}) in {} ms, system {:?}, partitions [{}]",
            report.serial,
            report.build_id,
            report.build_flavor,
            report.flash_duration_ms,
            report.system_flash_status,
            report.partitions_flashed.join(", ")
        );
    } else if let Some(err) = &summary.error {
        eprintln!("[{}] {err}", err.code());
    }
    std::process::exit(code);
}

fn fail(args: &Args, trace_id: &str, serial: &str, err: FlashError) -> ! {
    let code = exit_code(&err);
    finish(
        args,
        FlashSummary {
            tool: "fastboot_flasher",
            status: "fail",
            trace_id: trace_id.to_string(),
            serial: Some(serial.to_string()),
            report: None,
            error_code: Some(err.code()),
            error: Some(err),
        },
        code,
    )
}

/// Signals only raise a request; the flasher decides when it is safe to stop.
fn signal_handler(interrupts: Arc<InterruptGate>) -> impl Fn() + Send + 'static {
    move || interrupts.request_interrupt("interrupted by signal")
}

fn install_signal_handler(interrupts: Arc<InterruptGate>) {
    if let Err(err) = ctrlc::set_handler(signal_handler(interrupts)) {
        warn!(error = %err, "failed to install signal handler, flash cannot be cancelled");
    }
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(EXIT_USAGE);
        }
    };

    let loaded = match &args.config {
        Some(path) => load_config_from_path(path),
        None => load_config(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(EXIT_USAGE);
        }
    };
    apply_args(&mut config, &args);
    init_logging(&config.logging.log_level);

    let trace_id = Uuid::new_v4().to_string();

    let Some(serial) = args.serial.clone() else {
        eprintln!("--serial or ANDROID_SERIAL is required\n{USAGE}");
        std::process::exit(EXIT_USAGE);
    };
    let build = match BuildArtifact::load(&args.build) {
        Ok(build) => build,
        Err(err) => fail(&args, &trace_id, &serial, FlashError::setup(&serial, err)),
    };

    let adb_program = resolve_adb_program(&config.host.adb_path);
    let fastboot_program = resolve_fastboot_program(&config.host.fastboot_path);
    for (program, label) in [(&adb_program, "adb"), (&fastboot_program, "fastboot")] {
        if let Err(err) = validate_program(program, label) {
            fail(&args, &trace_id, &serial, FlashError::setup(&serial, err));
        }
    }

    let interrupts = Arc::new(InterruptGate::new());
    install_signal_handler(interrupts.clone());
    let device = Arc::new(HostDeviceController::new(
        serial.clone(),
        config.host_options(adb_program, fastboot_program),
        interrupts.clone(),
        trace_id.clone(),
    ));
    let resources: Arc<dyn FlashingResourceProvider> = match &args.resources {
        Some(dir) => Arc::new(DirectoryResources::new(dir)),
        None => Arc::new(NoResources),
    };
    let permits = Arc::new(FlashPermitCoordinator::new(
        config.host.concurrent_flasher_limit,
    ));
    let orchestrator = FlashOrchestrator::builder(device, permits)
        .resources(resources)
        .hooks(Arc::new(VendorImagesHook))
        .interrupts(interrupts)
        .options(config.flash_options())
        .build();

    info!(
        trace_id = %trace_id,
        serial = %serial,
        build = %args.build.display(),
        "starting flash"
    );
    match orchestrator.flash_with_trace(&build, &trace_id) {
        Ok(report) => finish(
            &args,
            FlashSummary {
                tool: "fastboot_flasher",
                status: "pass",
                trace_id: trace_id.clone(),
                serial: Some(serial),
                report: Some(report),
                error_code: None,
                error: None,
            },
            0,
        ),
        Err(err) => fail(&args, &trace_id, &serial, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_requests_interrupt_without_forcing_it() {
        let interrupts = Arc::new(InterruptGate::new());
        let handler = signal_handler(interrupts.clone());
        let guard = interrupts.uninterruptible();

        handler();

        assert!(interrupts.is_requested());
        assert!(!interrupts.should_interrupt());
        drop(guard);
        assert!(interrupts.should_interrupt());
    }

    #[test]
    fn failures_map_to_distinct_exit_codes() {
        let codes = [
            exit_code(&FlashError::setup("s", "x")),
            exit_code(&FlashError::build("s", "x")),
            exit_code(&FlashError::unavailable("s", "x")),
            exit_code(&FlashError::interrupted("s", "x")),
        ];
        assert_eq!(codes, [EXIT_SETUP, EXIT_BUILD, EXIT_UNAVAILABLE, EXIT_INTERRUPTED]);
    }
}
