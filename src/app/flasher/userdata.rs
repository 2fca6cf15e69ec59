use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::app::error::FlashError;
use crate::app::fastboot::parse::{parse_ls_entries, shell_quote};
use crate::app::fastboot::DeviceController;
use crate::app::flasher::partition::{
    check_fastboot_result, flash_partition, has_partition, wipe_partition,
};
use crate::app::flasher::session::FlashSession;
use crate::app::models::{BuildArtifact, UserDataFlashOption};
use crate::app::retry::{run_with_retry, Attempt, RetryOutcome, RetryPolicy, Sleeper};
use crate::app::scheduler::PermitSlot;

pub const DEFAULT_DATA_WIPE_SKIP_LIST: [&str; 1] = ["media"];
pub const USERDATA_PARTITION: &str = "userdata";
pub const CACHE_PARTITION: &str = "cache";
const USERDATA_IMAGE_ENTRY: &str = "userdata.img";
const TESTS_DATA_DIR: &str = "DATA";
const DEVICE_DATA_DIR: &str = "/data";

/// One device-side action taken while handling userdata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionStep {
    FlashUserdataImage(PathBuf),
    FlashUserdataFromArchive(PathBuf),
    BulkWipe,
    WipeUserdataPartition,
    RebootOnline,
    DeleteData,
    SyncTestsData(PathBuf),
    RebootBootloader,
    WipeCache,
}

pub struct UserDataPolicy {
    option: UserDataFlashOption,
    skip_list: BTreeSet<String>,
    wipe_timeout: Duration,
    delete_retry: RetryPolicy,
}

impl UserDataPolicy {
    pub fn new(
        option: UserDataFlashOption,
        skip_list: impl IntoIterator<Item = String>,
        wipe_timeout: Duration,
        delete_retry: RetryPolicy,
    ) -> Self {
        let mut skip_list = skip_list
            .into_iter()
            .map(|entry| entry.trim().trim_matches('/').to_string())
            .filter(|entry| !entry.is_empty())
            .collect::<BTreeSet<_>>();
        if skip_list.is_empty() {
            skip_list = DEFAULT_DATA_WIPE_SKIP_LIST
                .iter()
                .map(|entry| entry.to_string())
                .collect();
        }
        Self {
            option,
            skip_list,
            wipe_timeout,
            delete_retry,
        }
    }

    pub fn option(&self) -> UserDataFlashOption {
        self.option
    }

    pub fn skip_list(&self) -> &BTreeSet<String> {
        &self.skip_list
    }

    pub fn wipes_cache(&self) -> bool {
        self.option != UserDataFlashOption::Retain
    }

    /// Ordered device actions for this option. Fails when the build lacks an
    /// input the option needs.
    pub fn plan(&self, build: &BuildArtifact) -> Result<Vec<PartitionStep>, String> {
        use PartitionStep::*;
        let mut steps = match self.option {
            UserDataFlashOption::Flash => {
                let image = build.userdata_image.clone().ok_or_else(|| {
                    format!("build {} has no userdata image to flash", build.build_id)
                })?;
                vec![FlashUserdataImage(image)]
            }
            UserDataFlashOption::FlashImgZip => {
                vec![FlashUserdataFromArchive(build.device_image_zip.clone())]
            }
            UserDataFlashOption::Wipe => vec![BulkWipe],
            UserDataFlashOption::ForceWipe => vec![BulkWipe, WipeUserdataPartition],
            UserDataFlashOption::WipeRm => vec![RebootOnline, DeleteData, RebootBootloader],
            UserDataFlashOption::TestsZip => {
                let tests = build.tests_zip.clone().ok_or_else(|| {
                    format!("build {} has no tests archive to sync", build.build_id)
                })?;
                vec![RebootOnline, DeleteData, SyncTestsData(tests), RebootBootloader]
            }
            UserDataFlashOption::Retain => Vec::new(),
        };
        if self.wipes_cache() {
            steps.push(WipeCache);
        }
        Ok(steps)
    }

    /// Runs the plan. The flashing permit is handed back from `RebootOnline`
    /// until the device is in the bootloader again.
    pub fn apply(
        &self,
        device: &dyn DeviceController,
        session: &mut FlashSession<'_>,
        permit: &mut PermitSlot,
        extra_options: &[String],
        sleeper: &dyn Sleeper,
    ) -> Result<(), FlashError> {
        let steps = self
            .plan(session.build)
            .map_err(|message| FlashError::setup(&session.serial, message))?;
        if steps.is_empty() {
            info!(
                trace_id = %session.trace_id,
                serial = %session.serial,
                "retaining userdata"
            );
            return Ok(());
        }
        info!(
            trace_id = %session.trace_id,
            serial = %session.serial,
            option = %self.option,
            steps = steps.len(),
            "handling userdata"
        );
        for step in steps {
            debug!(serial = %session.serial, step = ?step, "userdata step");
            self.run_step(device, session, permit, extra_options, sleeper, step)?;
        }
        Ok(())
    }

    fn run_step(
        &self,
        device: &dyn DeviceController,
        session: &mut FlashSession<'_>,
        permit: &mut PermitSlot,
        extra_options: &[String],
        sleeper: &dyn Sleeper,
        step: PartitionStep,
    ) -> Result<(), FlashError> {
        match step {
            PartitionStep::FlashUserdataImage(image) => {
                flash_partition(device, session, extra_options, USERDATA_PARTITION, &image)
            }
            PartitionStep::FlashUserdataFromArchive(archive) => {
                let extracted = extract_entry(&archive, USERDATA_IMAGE_ENTRY).map_err(|err| {
                    FlashError::setup(
                        &session.serial,
                        format!(
                            "failed to extract {USERDATA_IMAGE_ENTRY} from {}: {err}",
                            archive.display()
                        ),
                    )
                })?;
                flash_partition(
                    device,
                    session,
                    extra_options,
                    USERDATA_PARTITION,
                    &extracted.path().join(USERDATA_IMAGE_ENTRY),
                )
            }
            PartitionStep::BulkWipe => {
                let result = device
                    .execute_fastboot_command_with_timeout(self.wipe_timeout, &["-w".to_string()])?;
                check_fastboot_result(session, result, "-w")?;
                Ok(())
            }
            PartitionStep::WipeUserdataPartition => {
                wipe_partition(device, session, USERDATA_PARTITION)
            }
            PartitionStep::RebootOnline => {
                permit.release();
                device.reboot()
            }
            PartitionStep::DeleteData => self.delete_data(device, &session.serial, sleeper),
            PartitionStep::SyncTestsData(archive) => sync_tests_data(device, &session.serial, &archive),
            PartitionStep::RebootBootloader => {
                device.reboot_into_bootloader()?;
                permit.reacquire();
                Ok(())
            }
            PartitionStep::WipeCache => {
                if has_partition(device, CACHE_PARTITION)? {
                    wipe_partition(device, session, CACHE_PARTITION)
                } else {
                    info!(serial = %session.serial, "device has no cache partition");
                    Ok(())
                }
            }
        }
    }

    /// Removes every top-level `/data` entry not on the skip list.
    fn delete_data(
        &self,
        device: &dyn DeviceController,
        serial: &str,
        sleeper: &dyn Sleeper,
    ) -> Result<(), FlashError> {
        let listing = device.execute_shell_command(&format!("ls -1 {DEVICE_DATA_DIR}"))?;
        for entry in parse_ls_entries(&listing) {
            if self.skip_list.contains(&entry) {
                debug!(serial = %serial, entry = %entry, "keeping /data entry");
                continue;
            }
            self.delete_with_retry(device, serial, &format!("{DEVICE_DATA_DIR}/{entry}"), sleeper)?;
        }
        Ok(())
    }

    fn delete_with_retry(
        &self,
        device: &dyn DeviceController,
        serial: &str,
        path: &str,
        sleeper: &dyn Sleeper,
    ) -> Result<(), FlashError> {
        let outcome = run_with_retry(&self.delete_retry, sleeper, |attempt| {
            let output = device.execute_shell_command(&format!("rm -r {}", shell_quote(path)))?;
            if !device.does_file_exist(path)? {
                return Ok(Attempt::Done(()));
            }
            warn!(serial = %serial, path = %path, attempt, "failed to delete, retrying");
            Ok::<_, FlashError>(Attempt::Retry(output.trim().to_string()))
        })?;
        match outcome {
            RetryOutcome::Succeeded(()) => Ok(()),
            RetryOutcome::Exhausted {
                attempts,
                last_reason,
            } => Err(FlashError::setup(
                serial,
                format!("failed to delete {path} after {attempts} attempts: '{last_reason}'"),
            )),
        }
    }
}

/// Copies the archive's `DATA/` tree onto `/data` and hands it to the system user.
fn sync_tests_data(
    device: &dyn DeviceController,
    serial: &str,
    archive: &Path,
) -> Result<(), FlashError> {
    let extracted = extract_prefix(archive, TESTS_DATA_DIR).map_err(|err| {
        FlashError::setup(
            serial,
            format!("failed to extract tests from {}: {err}", archive.display()),
        )
    })?;
    let data_root = extracted.path().join(TESTS_DATA_DIR);
    let mut entries = fs::read_dir(&data_root)
        .map_err(|err| FlashError::setup(serial, format!("tests archive has no {TESTS_DATA_DIR} dir: {err}")))?
        .flatten()
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    entries.sort();
    for local in entries {
        let Some(name) = local.file_name().map(|name| name.to_string_lossy().to_string()) else {
            continue;
        };
        info!(serial = %serial, entry = %name, "syncing test data");
        if !device.sync_files(&local, DEVICE_DATA_DIR)? {
            return Err(FlashError::setup(
                serial,
                format!("failed to sync {} to {DEVICE_DATA_DIR}", local.display()),
            ));
        }
        if local.is_dir() {
            let remote = format!("{DEVICE_DATA_DIR}/{name}");
            device.execute_shell_command(&format!("chown -R system.system {}", shell_quote(&remote)))?;
        }
    }
    Ok(())
}

/// Extracts a single named entry into a fresh temp dir.
fn extract_entry(archive: &Path, name: &str) -> Result<TempDir, String> {
    let file = File::open(archive).map_err(|err| format!("Failed to open archive: {err}"))?;
    let mut zip = ZipArchive::new(file).map_err(|err| format!("Invalid archive: {err}"))?;
    let temp_dir = TempDir::new().map_err(|err| format!("Failed to create temp dir: {err}"))?;
    let mut entry = zip
        .by_name(name)
        .map_err(|err| format!("Missing {name}: {err}"))?;
    let mut output = File::create(temp_dir.path().join(name))
        .map_err(|err| format!("Failed to create {name}: {err}"))?;
    io::copy(&mut entry, &mut output).map_err(|err| format!("Failed to extract {name}: {err}"))?;
    Ok(temp_dir)
}

/// Extracts every entry under `prefix/`, rejecting paths that escape the temp dir.
fn extract_prefix(archive: &Path, prefix: &str) -> Result<TempDir, String> {
    let file = File::open(archive).map_err(|err| format!("Failed to open archive: {err}"))?;
    let mut zip = ZipArchive::new(file).map_err(|err| format!("Invalid archive: {err}"))?;
    let temp_dir = TempDir::new().map_err(|err| format!("Failed to create temp dir: {err}"))?;
    fs::create_dir_all(temp_dir.path().join(prefix))
        .map_err(|err| format!("Failed to create temp dir: {err}"))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|err| format!("Failed to read archive: {err}"))?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        if !relative.starts_with(prefix) {
            continue;
        }
        let target = temp_dir.path().join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|err| format!("Failed to create dir: {err}"))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| format!("Failed to create dir: {err}"))?;
        }
        let mut output =
            File::create(&target).map_err(|err| format!("Failed to extract entry: {err}"))?;
        io::copy(&mut entry, &mut output)
            .map_err(|err| format!("Failed to extract entry: {err}"))?;
    }
    Ok(temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(option: UserDataFlashOption) -> UserDataPolicy {
        UserDataPolicy::new(
            option,
            Vec::new(),
            Duration::from_secs(60),
            RetryPolicy::quadratic(3, Duration::from_millis(10)),
        )
    }

    fn build() -> BuildArtifact {
        BuildArtifact::new("4815162", "walleye-userdebug", "/builds/img.zip")
            .with_userdata_image("/builds/userdata.img")
            .with_tests_zip("/builds/tests.zip")
    }

    #[test]
    fn skip_list_defaults_to_media() {
        let policy = policy(UserDataFlashOption::WipeRm);
        assert_eq!(
            policy.skip_list().iter().cloned().collect::<Vec<_>>(),
            vec!["media".to_string()]
        );
    }

    #[test]
    fn skip_list_entries_are_normalised() {
        let policy = UserDataPolicy::new(
            UserDataFlashOption::WipeRm,
            vec!["/local/".to_string(), " ".to_string(), "misc".to_string()],
            Duration::from_secs(1),
            RetryPolicy::quadratic(1, Duration::ZERO),
        );
        assert!(policy.skip_list().contains("local"));
        assert!(policy.skip_list().contains("misc"));
        assert!(!policy.skip_list().contains("media"));
    }

    #[test]
    fn every_option_but_retain_ends_with_cache_wipe() {
        for option in UserDataFlashOption::ALL {
            let steps = policy(option).plan(&build()).expect("plan");
            if option == UserDataFlashOption::Retain {
                assert!(steps.is_empty());
            } else {
                assert_eq!(steps.last(), Some(&PartitionStep::WipeCache), "{option}");
            }
        }
    }

    #[test]
    fn plans_are_distinct_and_wipes_never_flash_userdata() {
        let plans = UserDataFlashOption::ALL
            .iter()
            .map(|option| (*option, policy(*option).plan(&build()).expect("plan")))
            .collect::<Vec<_>>();
        for (i, (left, left_plan)) in plans.iter().enumerate() {
            for (right, right_plan) in &plans[i + 1..] {
                assert_ne!(left_plan, right_plan, "{left} vs {right}");
            }
        }
        for (option, plan) in &plans {
            if matches!(option, UserDataFlashOption::Wipe | UserDataFlashOption::ForceWipe) {
                assert!(!plan.iter().any(|step| matches!(
                    step,
                    PartitionStep::FlashUserdataImage(_) | PartitionStep::FlashUserdataFromArchive(_)
                )));
            }
        }
    }

    #[test]
    fn force_wipe_explicitly_wipes_userdata_after_bulk_wipe() {
        let steps = policy(UserDataFlashOption::ForceWipe)
            .plan(&build())
            .expect("plan");
        assert_eq!(
            steps,
            vec![
                PartitionStep::BulkWipe,
                PartitionStep::WipeUserdataPartition,
                PartitionStep::WipeCache
            ]
        );
    }

    #[test]
    fn tests_zip_clears_data_before_sync() {
        let steps = policy(UserDataFlashOption::TestsZip)
            .plan(&build())
            .expect("plan");
        assert_eq!(
            steps,
            vec![
                PartitionStep::RebootOnline,
                PartitionStep::DeleteData,
                PartitionStep::SyncTestsData(PathBuf::from("/builds/tests.zip")),
                PartitionStep::RebootBootloader,
                PartitionStep::WipeCache,
            ]
        );
    }

    #[test]
    fn missing_inputs_fail_planning() {
        let bare = BuildArtifact::new("1", "x-user", "/builds/img.zip");
        assert!(policy(UserDataFlashOption::Flash).plan(&bare).is_err());
        assert!(policy(UserDataFlashOption::TestsZip).plan(&bare).is_err());
        assert!(policy(UserDataFlashOption::FlashImgZip).plan(&bare).is_ok());
    }

    #[test]
    fn extract_prefix_only_keeps_matching_entries() {
        use std::io::Write;
        use zip::write::FileOptions;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tests.zip");
        let mut writer = zip::ZipWriter::new(File::create(&path).expect("create"));
        writer
            .start_file("DATA/app/Foo.apk", FileOptions::<()>::default())
            .expect("start");
        writer.write_all(b"apk").expect("write");
        writer
            .start_file("host/tool.jar", FileOptions::<()>::default())
            .expect("start");
        writer.write_all(b"jar").expect("write");
        writer.finish().expect("finish");

        let extracted = extract_prefix(&path, TESTS_DATA_DIR).expect("extract");
        assert!(extracted.path().join("DATA/app/Foo.apk").is_file());
        assert!(!extracted.path().join("host").exists());
    }
}
