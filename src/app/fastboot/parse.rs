use regex::Regex;

use crate::app::models::{CommandResult, CommandStatus};

/// Value of `name` in `fastboot getvar` output. fastboot may print it on either stream.
pub fn parse_fastboot_var(output: &str, name: &str) -> Option<String> {
    let pattern = format!(r"(?m){}:[ \t]*(\S.*?)\s*$", regex::escape(name));
    let re = Regex::new(&pattern).ok()?;
    re.captures(output)
        .map(|caps| caps[1].trim().to_string())
        .filter(|value| !value.is_empty())
}

/// fastboot often exits 0 and only reports the failure in its text.
pub fn fastboot_reported_failure(result: &CommandResult) -> bool {
    result.stderr.contains("FAILED") || result.stdout.contains("FAILED")
}

const TRANSPORT_ERRORS: [&str; 2] = [
    "data transfer failure (Protocol error)",
    "status read failed (No such device)",
];

/// Whether the result points at lost device communication rather than a command failure.
pub fn needs_transport_recovery(result: &CommandResult) -> bool {
    if result.status == CommandStatus::TimedOut {
        return true;
    }
    TRANSPORT_ERRORS
        .iter()
        .any(|marker| result.stderr.contains(marker))
}

pub fn parse_getprop_value(output: &str) -> Option<String> {
    output
        .lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())
        .map(|line| line.to_string())
}

/// Serials listed by `fastboot devices`.
pub fn parse_fastboot_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let serial = tokens.next()?;
            match tokens.next() {
                Some("fastboot") | Some("fastbootd") => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Entry names printed by `ls -1 <dir>`, one per line. Names may contain spaces.
pub fn parse_ls_entries(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.contains("No such file") && !line.contains("Permission denied"))
        .map(|line| line.trim_end_matches(['\r', '/']).to_string())
        .filter(|name| !name.trim().is_empty() && name != "." && name != "..")
        .collect()
}

/// Single-quotes `value` for `adb shell`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
