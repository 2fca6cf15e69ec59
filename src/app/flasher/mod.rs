pub mod hooks;
pub mod partition;
pub mod session;
pub mod userdata;


use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app::error::FlashError;
use crate::app::fastboot::parse::parse_fastboot_var;
use crate::app::fastboot::DeviceController;
use crate::app::interrupt::InterruptGate;
use crate::app::models::{BuildArtifact, DeviceImage, SystemFlashStatus, UserDataFlashOption};
use crate::app::requirements::{self, Constraints};
use crate::app::resources::{FlashingResourceProvider, NoResources};
use crate::app::retry::{run_with_retry, Attempt, RetryOutcome, RetryPolicy, Sleeper, ThreadSleeper};
use crate::app::scheduler::{FlashPermitCoordinator, PermitSlot};

use hooks::{FlashHooks, StandardHooks};
use partition::{check_fastboot_result, fastboot_args, flash_partition};
pub use session::{FlashReport, FlashSession, FlashStage};
use userdata::UserDataPolicy;

/// Image and partition name used for the baseband.
pub const BASEBAND_IMAGE_NAME: &str = "radio";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashOptions {
    pub userdata_flash_option: UserDataFlashOption,
    pub force_system_flash: bool,
    /// Top-level `/data` entries kept by WIPE_RM and TESTS_ZIP. Empty means `media`.
    pub data_wipe_skip_list: Vec<String>,
    pub wipe_timeout: Duration,
    /// Passed to fastboot ahead of every `flash` and `update`.
    pub fastboot_flash_extra_options: Vec<String>,
    pub skip_post_flash_setup: bool,
    pub device_boot_timeout: Duration,
    pub version_query_retry: RetryPolicy,
    pub data_delete_retry: RetryPolicy,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            userdata_flash_option: UserDataFlashOption::Flash,
            force_system_flash: false,
            data_wipe_skip_list: Vec::new(),
            wipe_timeout: Duration::from_secs(4 * 60),
            fastboot_flash_extra_options: Vec::new(),
            skip_post_flash_setup: false,
            device_boot_timeout: Duration::from_secs(5 * 60),
            version_query_retry: RetryPolicy::jittered(3, Duration::from_secs(2)),
            data_delete_retry: RetryPolicy::quadratic(3, Duration::from_secs(1)),
        }
    }
}

/// Brings one device to a target build.
pub struct FlashOrchestrator {
    device: Arc<dyn DeviceController>,
    permits: Arc<FlashPermitCoordinator>,
    resources: Arc<dyn FlashingResourceProvider>,
    hooks: Arc<dyn FlashHooks>,
    interrupts: Arc<InterruptGate>,
    sleeper: Arc<dyn Sleeper>,
    options: FlashOptions,
    userdata: UserDataPolicy,
    last_system_status: Mutex<Option<SystemFlashStatus>>,
}

pub struct FlashOrchestratorBuilder {
    device: Arc<dyn DeviceController>,
    permits: Arc<FlashPermitCoordinator>,
    resources: Option<Arc<dyn FlashingResourceProvider>>,
    hooks: Option<Arc<dyn FlashHooks>>,
    interrupts: Option<Arc<InterruptGate>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    options: FlashOptions,
}

impl FlashOrchestratorBuilder {
    pub fn resources(mut self, resources: Arc<dyn FlashingResourceProvider>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn FlashHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn interrupts(mut self, interrupts: Arc<InterruptGate>) -> Self {
        self.interrupts = Some(interrupts);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn options(mut self, options: FlashOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> FlashOrchestrator {
        let userdata = UserDataPolicy::new(
            self.options.userdata_flash_option,
            self.options.data_wipe_skip_list.clone(),
            self.options.wipe_timeout,
            self.options.data_delete_retry,
        );
        FlashOrchestrator {
            device: self.device,
            permits: self.permits,
            resources: self.resources.unwrap_or_else(|| Arc::new(NoResources)),
            hooks: self.hooks.unwrap_or_else(|| Arc::new(StandardHooks)),
            interrupts: self.interrupts.unwrap_or_default(),
            sleeper: self.sleeper.unwrap_or_else(|| Arc::new(ThreadSleeper)),
            options: self.options,
            userdata,
            last_system_status: Mutex::new(None),
        }
    }
}

impl FlashOrchestrator {
    pub fn builder(
        device: Arc<dyn DeviceController>,
        permits: Arc<FlashPermitCoordinator>,
    ) -> FlashOrchestratorBuilder {
        FlashOrchestratorBuilder {
            device,
            permits,
            resources: None,
            hooks: None,
            interrupts: None,
            sleeper: None,
            options: FlashOptions::default(),
        }
    }

    pub fn options(&self) -> &FlashOptions {
        &self.options
    }

    /// Outcome of the system step of the last flash, `None` before any flash ran.
    pub fn system_flashing_status(&self) -> Option<SystemFlashStatus> {
        *self
            .last_system_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn flash(&self, build: &BuildArtifact) -> Result<FlashReport, FlashError> {
        self.flash_with_trace(build, &Uuid::new_v4().to_string())
    }

    pub fn flash_with_trace(
        &self,
        build: &BuildArtifact,
        trace_id: &str,
    ) -> Result<FlashReport, FlashError> {
        let serial = self.device.serial().to_string();
        let device_lock = self.permits.device_lock(&serial);
        let _device_guard = device_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut session = FlashSession::new(
            &serial,
            trace_id,
            build,
            self.options.userdata_flash_option,
        );
        info!(
            trace_id = %trace_id,
            serial = %serial,
            build_id = %build.build_id,
            build_flavor = %build.build_flavor,
            userdata = %self.options.userdata_flash_option,
            "flashing device"
        );

        let result = self.run_session(&mut session);
        *self
            .last_system_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(session.system_flash_status);

        match result {
            Ok(()) => {
                info!(
                    trace_id = %trace_id,
                    serial = %serial,
                    build_id = %build.build_id,
                    system = ?session.system_flash_status,
                    duration_ms = session.flash_duration.as_millis() as u64,
                    "flash complete"
                );
                Ok(session.report())
            }
            Err(err) => {
                error!(
                    trace_id = %trace_id,
                    serial = %serial,
                    code = err.code(),
                    stage = ?session.stage,
                    error = %err,
                    "flash failed"
                );
                Err(err)
            }
        }
    }

    fn run_session(&self, session: &mut FlashSession<'_>) -> Result<(), FlashError> {
        // fastboot mode exposes neither, so capture them first
        session.current_build_id = self.device.build_id()?;
        session.current_build_flavor = self.device.build_flavor()?;

        {
            let mut permit = PermitSlot::acquire(&self.permits);
            let _uninterruptible = self.interrupts.uninterruptible();
            let started = Instant::now();
            let outcome = self.run_flash_sequence(session, &mut permit);
            session.flash_duration = started.elapsed();
            session.queue_wait = permit.queue_wait();
            outcome?;
        }

        if self.options.skip_post_flash_setup {
            info!(serial = %session.serial, "skipping post-flash setup");
            session.advance(FlashStage::Online);
            return Ok(());
        }
        self.interrupts
            .safe_point(&session.serial, "post-flash setup")?;
        self.device
            .wait_for_device_available(self.options.device_boot_timeout)?;
        self.verify_build(session)?;
        session.advance(FlashStage::Online);
        Ok(())
    }

    fn run_flash_sequence(
        &self,
        session: &mut FlashSession<'_>,
        permit: &mut PermitSlot,
    ) -> Result<(), FlashError> {
        let device = self.device.as_ref();
        let extra = self.options.fastboot_flash_extra_options.as_slice();

        self.enter_bootloader(session)?;
        session.advance(FlashStage::BootloaderMode);

        self.resolve_resources(session)?;
        session.advance(FlashStage::ResourcesResolved);
        self.hooks.pre_flash_setup(device, session)?;

        if let Some(image) = session.bootloader.clone() {
            let partition = self.hooks.bootloader_partition_name(device);
            session.bootloader_flashed =
                self.check_and_flash_image(session, permit, "bootloader", &partition, &image)?;
        } else {
            info!(serial = %session.serial, "no bootloader image, skipping");
        }
        session.advance(FlashStage::BootloaderChecked);
        self.interrupts
            .safe_point(&session.serial, "bootloader checked")?;

        if let Some(image) = session.baseband.clone() {
            session.baseband_flashed = self.check_and_flash_image(
                session,
                permit,
                "baseband",
                BASEBAND_IMAGE_NAME,
                &image,
            )?;
        } else {
            info!(serial = %session.serial, "no baseband image, skipping");
        }
        session.advance(FlashStage::BasebandChecked);
        self.interrupts
            .safe_point(&session.serial, "baseband checked")?;

        self.userdata
            .apply(device, session, permit, extra, self.sleeper.as_ref())?;
        session.advance(FlashStage::UserdataHandled);
        self.interrupts
            .safe_point(&session.serial, "userdata handled")?;

        self.hooks.flash_extra_images(device, session, extra)?;
        session.advance(FlashStage::ExtraImagesFlashed);
        self.interrupts
            .safe_point(&session.serial, "extra images flashed")?;

        self.check_and_flash_system(session)?;
        session.advance(FlashStage::SystemChecked);
        Ok(())
    }

    fn enter_bootloader(&self, session: &mut FlashSession<'_>) -> Result<(), FlashError> {
        match self.device.reboot_into_bootloader() {
            Ok(()) => Ok(()),
            Err(err @ FlashError::Interrupted { .. }) => Err(err),
            Err(err) => Err(FlashError::unavailable(
                &session.serial,
                format!("failed to enter bootloader: {}", err.message()),
            )),
        }
    }

    /// Reads the build's requirements, checks the board, and fills in
    /// bootloader and baseband images the build does not carry.
    fn resolve_resources(&self, session: &mut FlashSession<'_>) -> Result<(), FlashError> {
        let build = session.build;
        let requirements = requirements::resolve_archive(&build.device_image_zip, &Constraints::new())
            .map_err(|err| {
                FlashError::setup(
                    &session.serial,
                    format!(
                        "failed to read requirements of build {}: {err}",
                        build.build_id
                    ),
                )
            })?;

        let product = self.device.product_type()?.ok_or_else(|| {
            FlashError::unavailable(&session.serial, "could not determine product type")
        })?;
        match requirements.required_boards() {
            Some(boards) => {
                if !boards.iter().any(|board| board.eq_ignore_ascii_case(&product)) {
                    return Err(FlashError::setup(
                        &session.serial,
                        format!(
                            "device is {product}, build {} expects {}",
                            build.build_id,
                            boards.join("|")
                        ),
                    ));
                }
            }
            None => warn!(
                serial = %session.serial,
                build_id = %build.build_id,
                "build declares no board requirement"
            ),
        }

        session.bootloader = match build.bootloader.clone() {
            Some(image) => Some(image),
            None => self.fetch_image(
                session,
                &self.hooks.bootloader_image_name(),
                requirements.required_bootloader_version(Some(&product)),
            )?,
        };
        session.baseband = match build.baseband.clone() {
            Some(image) => Some(image),
            None => self.fetch_image(
                session,
                BASEBAND_IMAGE_NAME,
                requirements.required_baseband_version(Some(&product)),
            )?,
        };
        session.product_type = Some(product);
        session.requirements = Some(requirements);
        Ok(())
    }

    fn fetch_image(
        &self,
        session: &FlashSession<'_>,
        image_name: &str,
        version: Option<&str>,
    ) -> Result<Option<DeviceImage>, FlashError> {
        let Some(version) = version else {
            return Ok(None);
        };
        let path = self.resources.retrieve(image_name, version).map_err(|err| {
            FlashError::setup(
                &session.serial,
                format!("failed to retrieve {image_name} {version}: {err}"),
            )
        })?;
        info!(
            serial = %session.serial,
            image = %image_name,
            version = %version,
            path = %path.display(),
            "retrieved flashing resource"
        );
        Ok(Some(DeviceImage::new(path, version)))
    }

    /// Flashes `image` unless the device already reports its version. Returns
    /// whether a flash happened.
    fn check_and_flash_image(
        &self,
        session: &mut FlashSession<'_>,
        permit: &mut PermitSlot,
        image_name: &str,
        partition: &str,
        image: &DeviceImage,
    ) -> Result<bool, FlashError> {
        let current = self.query_image_version(session, image_name)?;
        if current == image.version {
            info!(
                serial = %session.serial,
                image = %image_name,
                version = %current,
                "already at required version, skipping"
            );
            return Ok(false);
        }
        info!(
            serial = %session.serial,
            image = %image_name,
            from = %current,
            to = %image.version,
            "updating image"
        );
        flash_partition(
            self.device.as_ref(),
            session,
            &self.options.fastboot_flash_extra_options,
            partition,
            &image.path,
        )?;
        permit.release();
        self.device.reboot_into_bootloader()?;
        permit.reacquire();
        Ok(true)
    }

    fn query_image_version(
        &self,
        session: &FlashSession<'_>,
        image_name: &str,
    ) -> Result<String, FlashError> {
        let var = format!("version-{image_name}");
        let device = self.device.as_ref();
        let outcome = run_with_retry(
            &self.options.version_query_retry,
            self.sleeper.as_ref(),
            |attempt| {
                let result = device.execute_fastboot_command(&["getvar".to_string(), var.clone()])?;
                let output = result.combined_output();
                if let Some(version) = parse_fastboot_var(&output, &var) {
                    return Ok(Attempt::Done(version));
                }
                warn!(
                    serial = %session.serial,
                    var = %var,
                    attempt,
                    output = %output.trim(),
                    "could not parse version, retrying"
                );
                Ok::<_, FlashError>(Attempt::Retry(output.trim().to_string()))
            },
        )?;
        match outcome {
            RetryOutcome::Succeeded(version) => Ok(version),
            RetryOutcome::Exhausted {
                attempts,
                last_reason,
            } => Err(FlashError::setup(
                &session.serial,
                format!(
                    "could not determine {image_name} version after {attempts} attempts, last output: '{last_reason}'"
                ),
            )),
        }
    }

    fn check_and_flash_system(&self, session: &mut FlashSession<'_>) -> Result<(), FlashError> {
        let build = session.build;
        let up_to_date = session.current_build_id.as_deref() == Some(build.build_id.as_str())
            && session.current_build_flavor.as_deref() == Some(build.build_flavor.as_str());
        if up_to_date && !self.options.force_system_flash {
            info!(
                serial = %session.serial,
                build_id = %build.build_id,
                build_flavor = %build.build_flavor,
                "system already at build, skipping"
            );
            session.system_flash_status = SystemFlashStatus::NotAttempted;
            return self.device.reboot();
        }
        if up_to_date {
            info!(serial = %session.serial, "forcing system flash");
        }
        self.flash_system(session)
    }

    fn flash_system(&self, session: &mut FlashSession<'_>) -> Result<(), FlashError> {
        let archive = session.build.device_image_zip.to_string_lossy().to_string();
        info!(
            serial = %session.serial,
            from = ?session.current_build_id,
            to = %session.build.build_id,
            archive = %archive,
            "flashing system"
        );
        let args = fastboot_args(
            &self.options.fastboot_flash_extra_options,
            &["update", archive.as_str()],
        );
        let result = match self.device.execute_long_fastboot_command(&args) {
            Ok(result) => result,
            Err(err) => {
                session.system_flash_status = SystemFlashStatus::Failed;
                return Err(err);
            }
        };
        let checked = check_fastboot_result(session, result, "update");
        session.system_flash_status = session
            .last_command_status
            .map(SystemFlashStatus::from)
            .unwrap_or(SystemFlashStatus::Failed);
        checked?;
        session.flashed_partitions.push("system".to_string());
        Ok(())
    }

    fn verify_build(&self, session: &FlashSession<'_>) -> Result<(), FlashError> {
        let expected = &session.build.build_id;
        match self.device.build_id()? {
            Some(actual) if &actual == expected => {}
            Some(actual) => {
                return Err(FlashError::build(
                    &session.serial,
                    format!("device is running build {actual} after flash, expected {expected}"),
                ))
            }
            None => {
                return Err(FlashError::build(
                    &session.serial,
                    format!("could not read build id after flashing {expected}"),
                ))
            }
        }
        let expected_flavor = &session.build.build_flavor;
        match self.device.build_flavor()? {
            Some(actual) if &actual != expected_flavor => Err(FlashError::build(
                &session.serial,
                format!(
                    "device is running {expected} as {actual} after flash, expected {expected_flavor}"
                ),
            )),
            _ => Ok(()),
        }
    }
}
