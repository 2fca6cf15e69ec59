use crate::app::error::FlashError;
use crate::app::fastboot::DeviceController;
use crate::app::flasher::partition::flash_partition;
use crate::app::flasher::session::FlashSession;

/// Device-family customisation points of the flash sequence.
pub trait FlashHooks: Send + Sync {
    /// Partition the bootloader image is written to.
    fn bootloader_partition_name(&self, _device: &dyn DeviceController) -> String {
        "bootloader".to_string()
    }

    /// Name used to fetch a bootloader image from the resource provider.
    fn bootloader_image_name(&self) -> String {
        "bootloader".to_string()
    }

    /// Runs in the bootloader before anything is flashed.
    fn pre_flash_setup(
        &self,
        _device: &dyn DeviceController,
        _session: &mut FlashSession<'_>,
    ) -> Result<(), FlashError> {
        Ok(())
    }

    fn flash_extra_images(
        &self,
        _device: &dyn DeviceController,
        _session: &mut FlashSession<'_>,
        _extra_options: &[String],
    ) -> Result<(), FlashError> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StandardHooks;

impl FlashHooks for StandardHooks {}

/// Flashes every image listed in `BuildArtifact::extra_images`.
#[derive(Debug, Default, Clone, Copy)]
pub struct VendorImagesHook;

impl FlashHooks for VendorImagesHook {
    fn flash_extra_images(
        &self,
        device: &dyn DeviceController,
        session: &mut FlashSession<'_>,
        extra_options: &[String],
    ) -> Result<(), FlashError> {
        let build = session.build;
        for (partition, image) in &build.extra_images {
            flash_partition(device, session, extra_options, partition, image)?;
        }
        Ok(())
    }
}
