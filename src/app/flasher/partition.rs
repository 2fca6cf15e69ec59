use std::path::Path;

use tracing::{info, warn};

use crate::app::error::FlashError;
use crate::app::fastboot::parse::{fastboot_reported_failure, parse_fastboot_var};
use crate::app::fastboot::DeviceController;
use crate::app::flasher::session::FlashSession;
use crate::app::models::{CommandResult, CommandStatus};

/// Extra flags go before the subcommand, where fastboot expects them.
pub fn fastboot_args(extra_options: &[String], args: &[&str]) -> Vec<String> {
    extra_options
        .iter()
        .cloned()
        .chain(args.iter().map(|arg| arg.to_string()))
        .collect()
}

/// Records the command status on the session and turns failures into setup errors.
pub fn check_fastboot_result(
    session: &mut FlashSession<'_>,
    result: CommandResult,
    description: &str,
) -> Result<CommandResult, FlashError> {
    let reported_failure = fastboot_reported_failure(&result);
    let status = if reported_failure {
        CommandStatus::Failed
    } else {
        result.status
    };
    session.last_command_status = Some(status);
    if status == CommandStatus::Success {
        return Ok(result);
    }
    warn!(
        trace_id = %session.trace_id,
        serial = %session.serial,
        command = %description,
        status = ?status,
        stderr = %result.stderr.trim(),
        "fastboot command failed"
    );
    Err(FlashError::setup(
        &session.serial,
        format!(
            "fastboot {description} failed ({status:?}). stdout: '{}', stderr: '{}'",
            result.stdout.trim(),
            result.stderr.trim()
        ),
    ))
}

pub fn flash_partition(
    device: &dyn DeviceController,
    session: &mut FlashSession<'_>,
    extra_options: &[String],
    partition: &str,
    image: &Path,
) -> Result<(), FlashError> {
    info!(
        trace_id = %session.trace_id,
        serial = %session.serial,
        partition = %partition,
        image = %image.display(),
        "flashing partition"
    );
    let path = image.to_string_lossy();
    let args = fastboot_args(extra_options, &["flash", partition, path.as_ref()]);
    let result = device.execute_long_fastboot_command(&args)?;
    check_fastboot_result(session, result, &format!("flash {partition}"))?;
    session.flashed_partitions.push(partition.to_string());
    Ok(())
}

pub fn wipe_partition(
    device: &dyn DeviceController,
    session: &mut FlashSession<'_>,
    partition: &str,
) -> Result<(), FlashError> {
    let verb = if device.use_fastboot_erase() {
        "erase"
    } else {
        "format"
    };
    info!(
        trace_id = %session.trace_id,
        serial = %session.serial,
        partition = %partition,
        verb,
        "wiping partition"
    );
    let result = device.fastboot_wipe_partition(partition)?;
    check_fastboot_result(session, result, &format!("{verb} {partition}"))?;
    Ok(())
}

/// Whether the board reports a partition with this name.
pub fn has_partition(device: &dyn DeviceController, partition: &str) -> Result<bool, FlashError> {
    let var = format!("partition-type:{partition}");
    let result = device.execute_fastboot_command(&["getvar".to_string(), var.clone()])?;
    if fastboot_reported_failure(&result) {
        return Ok(false);
    }
    Ok(parse_fastboot_var(&result.combined_output(), &var).is_some())
}
