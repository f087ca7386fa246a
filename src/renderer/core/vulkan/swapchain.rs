use ash::prelude::VkResult;
use ash::vk;
use color_eyre::eyre::OptionExt;
use color_eyre::Result;
use crate::renderer::core::vulkan::convert;
use crate::renderer::core::{Format, SwapchainDesc};

/// Swap chain images plus the binary semaphores that order acquire → render → present
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
    pub format: Format,
    pub present_mode: vk::PresentModeKHR,

    // One more acquire semaphore than images, so one is always free for the next acquire.
    acquire_semaphores: Vec<vk::Semaphore>,
    next_acquire_semaphore: usize,
    // Indexed by image.
    present_semaphores: Vec<vk::Semaphore>,
}

impl Swapchain {
    pub fn new(
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
        swapchain_loader: &ash::khr::swapchain::Device,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
        desc: &SwapchainDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let surface_capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?
        };
        let surface_formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)?
        };
        let surface_present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?
        };

        let image_format = convert::format(desc.format);
        let surface_format = surface_formats
            .iter()
            .find(|format| format.format == image_format && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .ok_or_eyre("Requested swap chain format is not supported by the surface")?;

        let present_mode = if desc.allow_tearing {
            [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]
                .into_iter()
                .find(|mode| surface_present_modes.contains(mode))
                .unwrap_or(vk::PresentModeKHR::FIFO)
        } else {
            vk::PresentModeKHR::FIFO
        };

        let image_extent = if surface_capabilities.current_extent.width != u32::MAX {
            surface_capabilities.current_extent
        } else {
            vk::Extent2D {
                width: desc.width.clamp(
                    surface_capabilities.min_image_extent.width,
                    surface_capabilities.max_image_extent.width,
                ),
                height: desc.height.clamp(
                    surface_capabilities.min_image_extent.height,
                    surface_capabilities.max_image_extent.height,
                ),
            }
        };

        let min_image_count = {
            let min = surface_capabilities.min_image_count;
            let max = surface_capabilities.max_image_count;
            let wanted = desc.buffer_count.max(min);
            if max > 0 { wanted.min(max) } else { wanted }
        };
        let pre_transform = if surface_capabilities
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            surface_capabilities.current_transform
        };

        let swapchain_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(min_image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(image_extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&swapchain_info, None)? };
        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain)? };
        let image_views = images
            .iter()
            .map(|image| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::R,
                        g: vk::ComponentSwizzle::G,
                        b: vk::ComponentSwizzle::B,
                        a: vk::ComponentSwizzle::A,
                    })
                    .subresource_range(convert::subresource_range(vk::ImageAspectFlags::COLOR))
                    .image(*image);
                unsafe { device.create_image_view(&view_info, None) }
            })
            .collect::<VkResult<Vec<vk::ImageView>>>()?;

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let acquire_semaphores = (0..=images.len())
            .map(|_| unsafe { device.create_semaphore(&semaphore_info, None) })
            .collect::<VkResult<Vec<_>>>()?;
        let present_semaphores = (0..images.len())
            .map(|_| unsafe { device.create_semaphore(&semaphore_info, None) })
            .collect::<VkResult<Vec<_>>>()?;

        log::info!(
            "Created swap chain: {} images, {}x{}, {:?}",
            images.len(),
            image_extent.width,
            image_extent.height,
            present_mode
        );

        Ok(Self {
            swapchain,
            images,
            image_views,
            extent: image_extent,
            format: desc.format,
            present_mode,
            acquire_semaphores,
            next_acquire_semaphore: 0,
            present_semaphores,
        })
    }

    /// Acquires the next image. The returned semaphore is signaled once the image may be written.
    pub fn acquire(&mut self, swapchain_loader: &ash::khr::swapchain::Device) -> VkResult<(u32, vk::Semaphore)> {
        let semaphore = self.acquire_semaphores[self.next_acquire_semaphore];
        let (index, suboptimal) = unsafe {
            swapchain_loader.acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())?
        };
        if suboptimal {
            log::warn!("Swap chain is suboptimal for the surface");
        }
        self.next_acquire_semaphore = (self.next_acquire_semaphore + 1) % self.acquire_semaphores.len();
        Ok((index, semaphore))
    }

    pub fn present_semaphore(&self, index: u32) -> vk::Semaphore {
        self.present_semaphores[index as usize]
    }

    /// Destroys everything but the swap chain handle itself, which may still be handed to a
    /// replacement as its old swap chain.
    pub fn destroy_views(&mut self, device: &ash::Device) {
        unsafe {
            for view in self.image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            for semaphore in self.acquire_semaphores.drain(..).chain(self.present_semaphores.drain(..)) {
                device.destroy_semaphore(semaphore, None);
            }
        }
    }
}
