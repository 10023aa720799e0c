use ash::vk;

/// The single queue everything is submitted to: graphics, compute,
/// transfer and present.
pub struct Queue {
    pub family_index: u32,
    pub handle: vk::Queue,
    pub properties: vk::QueueFamilyProperties,
}

impl Queue {
    pub fn new(
        family_index: u32,
        handle: vk::Queue,
        properties: vk::QueueFamilyProperties,
    ) -> Self {
        Self {
            family_index,
            handle,
            properties,
        }
    }

    pub fn supports_timestamps(&self) -> bool {
        self.properties.timestamp_valid_bits > 0
    }
}

/// First queue family that can do graphics and compute work and present to
/// the surface. Transfer support is implied by either of the first two.
pub fn find_universal_family<F>(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: F,
) -> Option<u32>
where
    F: FnMut(u32) -> bool,
{
    let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
    families
        .iter()
        .enumerate()
        .position(|(i, family)| {
            family.queue_count > 0
                && family.queue_flags.contains(required)
                && supports_present(i as u32)
        })
        .map(|i| i as u32)
}
