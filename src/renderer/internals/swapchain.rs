use std::sync::Arc;
use std::time::Duration;
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::{eyre, OptionExt};
use crate::renderer::config::VSyncMode;

/// Upper bound on presentable images the frame loop is prepared to track
pub const MAX_SWAPCHAIN_IMAGES: usize = 32;

/// Surface formats in order of preference. Frames are blitted in, so
/// linear formats come first.
pub const PREFERRED_SURFACE_FORMATS: &[vk::Format] = &[
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::A2B10G10R10_UNORM_PACK32,
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R8G8B8A8_SRGB,
];

pub const DEFAULT_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Formats negotiated with the surface and device, handed to pipeline factories
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct SwapchainFormats {
    pub color: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub depth: vk::Format,
}

pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Result<vk::SurfaceFormatKHR> {
    // A single undefined entry means the surface takes anything
    if formats.len() == 1 && formats[0].format == vk::Format::UNDEFINED {
        return Ok(DEFAULT_SURFACE_FORMAT);
    }

    PREFERRED_SURFACE_FORMATS
        .iter()
        .find_map(|preferred| {
            formats
                .iter()
                .find(|f| f.format == *preferred)
                .copied()
        })
        .ok_or_eyre("No suitable surface format found")
}

/// FIFO is the only mode every surface supports, so it is the fallback
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    vsync: VSyncMode,
) -> vk::PresentModeKHR {
    let wanted = match vsync {
        VSyncMode::Fifo => vk::PresentModeKHR::FIFO,
        VSyncMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        VSyncMode::Mailbox => vk::PresentModeKHR::MAILBOX,
    };
    if modes.contains(&wanted) {
        wanted
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(
            caps.min_image_extent.width,
            caps.max_image_extent.width,
        ),
        height: height.clamp(
            caps.min_image_extent.height,
            caps.max_image_extent.height,
        ),
    }
}

pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    // Recommended to request at least one more image than the minimum
    // to prevent having to wait on driver to complete internal operations
    // before another image can be acquired
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

/// Picks the first candidate the device can use as an optimal-tiling depth attachment
pub fn choose_depth_format<F>(mut supports_depth_attachment: F) -> Result<vk::Format>
where
    F: FnMut(vk::Format) -> bool,
{
    [
        vk::Format::D32_SFLOAT,
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D24_UNORM_S8_UINT,
    ]
        .into_iter()
        .find(|format| supports_depth_attachment(*format))
        .ok_or_eyre("No supported depth format")
}

/// Polls the window size until neither dimension is zero.
/// A minimized window reports zero and must not get a swapchain.
pub fn wait_for_window_size<F>(mut query: F) -> (u32, u32)
where
    F: FnMut() -> (u32, u32),
{
    let mut backoff = Duration::from_millis(1);
    loop {
        let (width, height) = query();
        if width != 0 && height != 0 {
            return (width, height);
        }
        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(Duration::from_millis(100));
    }
}

/// The chain of presentable images. Rebuilt as a whole on every resize.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub extent: vk::Extent2D,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,

    loader: Arc<ash::khr::swapchain::Device>,
}

impl Swapchain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
        loader: Arc<ash::khr::swapchain::Device>,
        physical: vk::PhysicalDevice,
        vsync: VSyncMode,
        width: u32,
        height: u32,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let (caps, formats, present_modes) = unsafe {
            (
                surface_loader.get_physical_device_surface_capabilities(physical, surface)?,
                surface_loader.get_physical_device_surface_formats(physical, surface)?,
                surface_loader.get_physical_device_surface_present_modes(physical, surface)?,
            )
        };

        let format = choose_surface_format(&formats)?;
        let present_mode = choose_present_mode(&present_modes, vsync);
        let extent = choose_extent(&caps, width, height);
        let min_image_count = choose_image_count(&caps);

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let swapchain_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(min_image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            // A single queue family does everything, no ownership transfers
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(old_swapchain);

        let handle = unsafe {
            loader.create_swapchain(&swapchain_info, None)?
        };

        let images = match unsafe { loader.get_swapchain_images(handle) } {
            Ok(images) if images.len() <= MAX_SWAPCHAIN_IMAGES => images,
            Ok(images) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(eyre!(
                    "Swapchain returned {} images, at most {} are supported",
                    images.len(),
                    MAX_SWAPCHAIN_IMAGES,
                ));
            }
            Err(err) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(err.into());
            }
        };

        log::info!(
            "Swapchain created: {}x{}, {} images, {:?}/{:?}, {:?}",
            extent.width,
            extent.height,
            images.len(),
            format.format,
            format.color_space,
            present_mode,
        );

        Ok(Self {
            handle,
            images,
            extent,
            format,
            present_mode,
            loader,
        })
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_swapchain(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            ..Default::default()
        }
    }

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn format_follows_preference_order() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_SRGB),
            surface_format(vk::Format::R8G8B8A8_UNORM),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn undefined_format_means_default() {
        let formats = [surface_format(vk::Format::UNDEFINED)];
        assert_eq!(choose_surface_format(&formats).unwrap(), DEFAULT_SURFACE_FORMAT);
    }

    #[test]
    fn no_known_format_fails() {
        let formats = [surface_format(vk::Format::R5G6B5_UNORM_PACK16)];
        assert!(choose_surface_format(&formats).is_err());
        assert!(choose_surface_format(&[]).is_err());
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&modes, VSyncMode::Mailbox), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, VSyncMode::Immediate), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(choose_present_mode(&modes, VSyncMode::Fifo), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_uses_current_extent_when_defined() {
        let caps = caps((800, 600), (1, 1), (4096, 4096));
        assert_eq!(choose_extent(&caps, 1920, 1080), vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn extent_is_clamped_when_undefined() {
        let caps = caps((u32::MAX, u32::MAX), (64, 64), (1600, 900));
        assert_eq!(choose_extent(&caps, 1920, 1080), vk::Extent2D { width: 1600, height: 900 });
        assert_eq!(choose_extent(&caps, 10, 10), vk::Extent2D { width: 64, height: 64 });
        assert_eq!(choose_extent(&caps, 1280, 720), vk::Extent2D { width: 1280, height: 720 });
    }

    #[test]
    fn image_count_respects_maximum() {
        let mut caps = caps((1, 1), (1, 1), (1, 1));
        assert_eq!(choose_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);
        caps.max_image_count = 0;
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn depth_format_takes_first_supported() {
        let format = choose_depth_format(|f| f == vk::Format::D24_UNORM_S8_UINT).unwrap();
        assert_eq!(format, vk::Format::D24_UNORM_S8_UINT);
        assert!(choose_depth_format(|_| false).is_err());
    }

    #[test]
    fn minimized_window_is_waited_out() {
        let sizes = [(0, 0), (1280, 0), (0, 720), (1280, 720)];
        let mut calls = 0;
        let size = wait_for_window_size(|| {
            let size = sizes[calls];
            calls += 1;
            size
        });
        assert_eq!(size, (1280, 720));
        assert_eq!(calls, 4);
    }
}
