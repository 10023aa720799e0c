use ash::vk;

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_array_layer: 0,
        layer_count: 1,
        mip_level: 0,
    }
}

fn far_corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

/// Scales `src` onto the whole of `dst`. Expects `src` in TRANSFER_SRC_OPTIMAL
/// and `dst` in TRANSFER_DST_OPTIMAL.
pub fn blit_image_to_image(
    cmd: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    src_size: vk::Extent2D,
    dst_size: vk::Extent2D,
    device: &ash::Device,
) {
    let blit_region = vk::ImageBlit2::default()
        .src_subresource(color_layers())
        .src_offsets([vk::Offset3D::default(), far_corner(src_size)])
        .dst_subresource(color_layers())
        .dst_offsets([vk::Offset3D::default(), far_corner(dst_size)]);
    let regions = [blit_region];

    let filter = if src_size == dst_size {
        vk::Filter::NEAREST
    } else {
        vk::Filter::LINEAR
    };

    let blit_info = vk::BlitImageInfo2::default()
        .src_image(src)
        .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .dst_image(dst)
        .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .filter(filter)
        .regions(&regions);

    unsafe {
        device.cmd_blit_image2(cmd, &blit_info);
    }
}

pub fn copy_buffer_region(
    cmd: vk::CommandBuffer,
    src: vk::Buffer,
    src_offset: u64,
    dst: vk::Buffer,
    dst_offset: u64,
    size: u64,
    device: &ash::Device,
) {
    let region = vk::BufferCopy {
        src_offset,
        dst_offset,
        size,
    };
    unsafe {
        device.cmd_copy_buffer(cmd, src, dst, &[region]);
    }
}
