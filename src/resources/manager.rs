//! GPU uploads and the asset mirror cache

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::allocator::{BufferRequirements, BufferView, GpuAllocator, ImageRequirements, ImageView};
use crate::backend::{GpuDevice, ImageBarrier};
use crate::commands::CommandManager;
use crate::error::{RenderError, RenderResult, VkResultExt};
use crate::events::{AssetId, Event, EventReceiver, ResourceEvent};

use super::mesh::{Mesh, Vertex};
use super::texture::TextureData;

/// Vertex and optional index buffer of an uploaded mesh
#[derive(Debug, Clone)]
pub struct GpuMesh {
    pub vertices: BufferView,
    pub indices: Option<BufferView>,
    pub vertex_count: u32,
    pub index_count: u32,
}

#[derive(Debug)]
enum PendingFree {
    Buffer(BufferView),
    Image(ImageView),
}

/// Uploads CPU data into device-local memory through staging buffers and
/// keeps GPU mirrors of loaded assets.
///
/// Frees caused by asset events are only queued; the frame loop applies
/// them between frames via [`ResourceManager::apply_pending_frees`].
pub struct ResourceManager {
    device: Arc<dyn GpuDevice>,
    allocator: Arc<Mutex<GpuAllocator>>,
    commands: CommandManager,
    events: Option<EventReceiver>,
    meshes: HashMap<AssetId, GpuMesh>,
    textures: HashMap<AssetId, ImageView>,
    pending: Vec<PendingFree>,
}

impl ResourceManager {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        allocator: Arc<Mutex<GpuAllocator>>,
    ) -> RenderResult<Self> {
        let commands = CommandManager::new(device.clone())?;
        Ok(Self {
            device,
            allocator,
            commands,
            events: None,
            meshes: HashMap::new(),
            textures: HashMap::new(),
            pending: Vec::new(),
        })
    }

    /// Follow asset lifecycle events from `events`.
    pub fn with_events(mut self, events: EventReceiver) -> Self {
        self.events = Some(events);
        self
    }

    pub fn allocator(&self) -> &Arc<Mutex<GpuAllocator>> {
        &self.allocator
    }

    pub fn upload_vertices(&mut self, vertices: &[Vertex]) -> RenderResult<BufferView> {
        self.upload_buffer(
            "vertices",
            bytemuck::cast_slice(vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )
    }

    pub fn upload_indices(&mut self, indices: &[u32]) -> RenderResult<BufferView> {
        self.upload_buffer(
            "indices",
            bytemuck::cast_slice(indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )
    }

    /// Copy `data` into a new device-local buffer with `usage`.
    pub fn upload_buffer(
        &mut self,
        name: &str,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> RenderResult<BufferView> {
        if data.is_empty() {
            return Err(RenderError::InvalidArgument(format!("upload of empty {name} buffer")));
        }
        let size = data.len() as vk::DeviceSize;
        let staging = self.staging(data)?;
        let target = self.allocator.lock().allocate_buffer(BufferRequirements::device_local(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
        ));
        let target = match target {
            Ok(target) => target,
            Err(err) => {
                self.allocator.lock().free_buffer(&staging);
                return Err(err);
            }
        };

        let (src, dst) = (staging.raw(), target.raw());
        let copied = self.commands.one_time_exec(name, |device, cmd| {
            device.cmd_copy_buffer(cmd, src, dst, size);
        });

        let mut allocator = self.allocator.lock();
        allocator.free_buffer(&staging);
        if let Err(err) = copied {
            allocator.free_buffer(&target);
            return Err(err);
        }
        trace!(target: "resources", "Uploaded {size} bytes of {name}");
        Ok(target)
    }

    /// Upload tightly packed 4-byte texels into a sampled 2D image, leaving it
    /// in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn upload_image(
        &mut self,
        width: u32,
        height: u32,
        format: vk::Format,
        pixels: &[u8],
    ) -> RenderResult<ImageView> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(RenderError::InvalidArgument(format!(
                "{width}x{height} image needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        let requirements = ImageRequirements::new_2d(
            width,
            height,
            format,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        );
        self.upload_layers(requirements, &[pixels])
    }

    /// Upload six square faces (+X, -X, +Y, -Y, +Z, -Z) into a cube image.
    pub fn upload_cube_image(
        &mut self,
        size: u32,
        format: vk::Format,
        faces: [&[u8]; 6],
    ) -> RenderResult<ImageView> {
        let expected = size as usize * size as usize * 4;
        if size == 0 {
            return Err(RenderError::InvalidArgument("cube image with zero size".into()));
        }
        if let Some(face) = faces.iter().position(|f| f.len() != expected) {
            return Err(RenderError::InvalidArgument(format!(
                "cube face {face} needs {expected} bytes, got {}",
                faces[face].len()
            )));
        }
        let requirements = ImageRequirements::cube(
            size,
            format,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        );
        self.upload_layers(requirements, &faces)
    }

    fn upload_layers(
        &mut self,
        requirements: ImageRequirements,
        layers: &[&[u8]],
    ) -> RenderResult<ImageView> {
        let data = layers.concat();
        let staging = self.staging(&data)?;
        let image = self.allocator.lock().allocate_image(requirements);
        let image = match image {
            Ok(image) => image,
            Err(err) => {
                self.allocator.lock().free_buffer(&staging);
                return Err(err);
            }
        };

        let layer_size = layers.first().map_or(0, |l| l.len()) as vk::DeviceSize;
        let regions: Vec<vk::BufferImageCopy> = (0..layers.len() as u32)
            .map(|layer| vk::BufferImageCopy {
                buffer_offset: layer as vk::DeviceSize * layer_size,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: requirements.aspect_mask,
                    mip_level: 0,
                    base_array_layer: layer,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: requirements.width,
                    height: requirements.height,
                    depth: 1,
                },
            })
            .collect();

        let (src, dst) = (staging.raw(), image.raw_image());
        let to_transfer = ImageBarrier {
            image: dst,
            aspect_mask: requirements.aspect_mask,
            layer_count: requirements.array_layers,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        };
        let to_shader_read = ImageBarrier {
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            ..to_transfer
        };

        let copied = self.commands.one_time_exec("image upload", |device, cmd| {
            device.cmd_image_barrier(cmd, &to_transfer);
            device.cmd_copy_buffer_to_image(cmd, src, dst, &regions);
            device.cmd_image_barrier(cmd, &to_shader_read);
        });

        let mut allocator = self.allocator.lock();
        allocator.free_buffer(&staging);
        if let Err(err) = copied {
            allocator.free_image(&image);
            return Err(err);
        }
        trace!(
            target: "resources",
            "Uploaded {}x{} image with {} layer(s)",
            requirements.width,
            requirements.height,
            layers.len()
        );
        Ok(image)
    }

    fn staging(&self, data: &[u8]) -> RenderResult<BufferView> {
        let mut allocator = self.allocator.lock();
        let staging = allocator.allocate_buffer(BufferRequirements::host_visible(
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
        ))?;
        if let Err(err) = staging.write(0, data) {
            allocator.free_buffer(&staging);
            return Err(err);
        }
        Ok(staging)
    }

    /// Free a buffer right away. The caller guarantees the GPU is done with it.
    pub fn free_buffer(&mut self, buffer: &BufferView) {
        self.allocator.lock().free_buffer(buffer);
    }

    /// Free an image right away. The caller guarantees the GPU is done with it.
    pub fn free_image(&mut self, image: &ImageView) {
        self.allocator.lock().free_image(image);
    }

    /// Upload `mesh` and cache it under `asset`. A previous mirror of the same
    /// asset is queued for release.
    pub fn load_mesh(&mut self, asset: AssetId, mesh: &Mesh) -> RenderResult<GpuMesh> {
        let vertices = self.upload_vertices(&mesh.vertices)?;
        let indices = if mesh.is_indexed() {
            match self.upload_indices(&mesh.indices) {
                Ok(indices) => Some(indices),
                Err(err) => {
                    self.free_buffer(&vertices);
                    return Err(err);
                }
            }
        } else {
            None
        };
        let gpu = GpuMesh {
            vertices,
            indices,
            vertex_count: mesh.vertex_count() as u32,
            index_count: mesh.index_count() as u32,
        };
        if let Some(old) = self.meshes.insert(asset, gpu.clone()) {
            self.queue_mesh(old);
        }
        debug!(target: "resources", "Mirrored mesh '{}' as asset {asset}", mesh.name);
        Ok(gpu)
    }

    /// Upload `texture` and cache it under `asset`.
    pub fn load_texture(
        &mut self,
        asset: AssetId,
        texture: &TextureData,
    ) -> RenderResult<ImageView> {
        let image =
            self.upload_image(texture.width, texture.height, texture.format, &texture.data)?;
        if let Some(old) = self.textures.insert(asset, image.clone()) {
            self.pending.push(PendingFree::Image(old));
        }
        debug!(target: "resources", "Mirrored texture '{}' as asset {asset}", texture.name);
        Ok(image)
    }

    pub fn mesh(&self, asset: AssetId) -> Option<&GpuMesh> {
        self.meshes.get(&asset)
    }

    pub fn texture(&self, asset: AssetId) -> Option<&ImageView> {
        self.textures.get(&asset)
    }

    pub fn cached_count(&self) -> usize {
        self.meshes.len() + self.textures.len()
    }

    pub fn pending_free_count(&self) -> usize {
        self.pending.len()
    }

    /// Drain asset events. Unloaded, replaced and removed assets drop out of
    /// the cache and their GPU resources are queued for release.
    pub fn process_events(&mut self) -> usize {
        let Some(events) = &self.events else {
            return 0;
        };
        let mut handled = 0;
        for event in events.drain() {
            let Event::Resource(event) = event else {
                continue;
            };
            match event {
                ResourceEvent::Loaded(asset) => {
                    trace!(target: "resources", "Asset {asset} loaded");
                }
                ResourceEvent::Unloaded(asset)
                | ResourceEvent::Replaced(asset)
                | ResourceEvent::Removed(asset) => {
                    self.evict(asset);
                    handled += 1;
                }
            }
        }
        handled
    }

    /// Drop the GPU mirror of `asset`, queueing its resources for release.
    pub fn evict(&mut self, asset: AssetId) {
        if let Some(mesh) = self.meshes.remove(&asset) {
            self.queue_mesh(mesh);
        }
        if let Some(image) = self.textures.remove(&asset) {
            self.pending.push(PendingFree::Image(image));
        }
    }

    fn queue_mesh(&mut self, mesh: GpuMesh) {
        self.pending.push(PendingFree::Buffer(mesh.vertices));
        if let Some(indices) = mesh.indices {
            self.pending.push(PendingFree::Buffer(indices));
        }
    }

    /// Wait for the device, then release everything queued. Returns the
    /// number of released resources.
    pub fn apply_pending_frees(&mut self) -> RenderResult<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        self.device
            .device_wait_idle()
            .context(|| "wait device idle before freeing resources".to_string())?;

        let count = self.pending.len();
        let mut allocator = self.allocator.lock();
        for pending in self.pending.drain(..) {
            match pending {
                PendingFree::Buffer(buffer) => allocator.free_buffer(&buffer),
                PendingFree::Image(image) => allocator.free_image(&image),
            }
        }
        info!(target: "resources", "Released {count} resource(s) between frames");
        Ok(count)
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        for asset in self.meshes.keys().chain(self.textures.keys()).copied().collect::<Vec<_>>() {
            self.evict(asset);
        }
        if let Err(err) = self.apply_pending_frees() {
            warn!(target: "resources", "Failed to release cached resources: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceCall, DummyDevice};
    use crate::events::EventQueue;

    fn manager() -> (Arc<DummyDevice>, ResourceManager) {
        let device = Arc::new(DummyDevice::new());
        let allocator = Arc::new(Mutex::new(GpuAllocator::new(device.clone())));
        let manager = ResourceManager::new(device.clone(), allocator).unwrap();
        (device, manager)
    }

    #[test]
    fn test_upload_vertices_frees_staging() {
        let (device, mut manager) = manager();
        let quad = Mesh::quad();
        let buffer = manager.upload_vertices(&quad.vertices).unwrap();

        assert_eq!(buffer.size(), quad.vertex_bytes().len() as u64);
        assert!(!buffer.is_mapped());
        assert_eq!(manager.allocator().lock().tracked_buffers(), 1);
        assert_eq!(device.live_buffers(), 1);
        assert_eq!(
            device.count_calls(|c| {
                matches!(c, DeviceCall::CopyBuffer { size, .. } if *size == buffer.size())
            }),
            1
        );
        assert_eq!(device.count_calls(|c| matches!(c, DeviceCall::QueueWaitIdle)), 1);
    }

    #[test]
    fn test_upload_empty_is_rejected() {
        let (device, mut manager) = manager();
        let err = manager.upload_indices(&[]).unwrap_err();
        assert!(matches!(err, RenderError::InvalidArgument(_)));
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_upload_image_transitions_layouts() {
        let (device, mut manager) = manager();
        let texture = TextureData::checkerboard(16, [255; 4], [0, 0, 0, 255]);
        let image = manager
            .upload_image(16, 16, texture.format, &texture.data)
            .unwrap();

        assert!(image.is_valid());
        let layouts: Vec<(vk::ImageLayout, vk::ImageLayout)> = device
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::ImageBarrier {
                    old_layout,
                    new_layout,
                    ..
                } => Some((old_layout, new_layout)),
                _ => None,
            })
            .collect();
        assert_eq!(
            layouts,
            vec![
                (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                (
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                ),
            ]
        );
        assert_eq!(device.count_calls(|c| matches!(c, DeviceCall::CopyBufferToImage { .. })), 1);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_upload_cube_image_checks_faces() {
        let (_device, mut manager) = manager();
        let face_data = vec![0u8; 4 * 4 * 4];
        let face: &[u8] = &face_data;
        let short: &[u8] = &[0u8; 3];
        let err = manager
            .upload_cube_image(4, vk::Format::R8G8B8A8_UNORM, [face, face, short, face, face, face])
            .unwrap_err();
        assert!(matches!(err, RenderError::InvalidArgument(_)));

        let cube = manager
            .upload_cube_image(4, vk::Format::R8G8B8A8_UNORM, [face; 6])
            .unwrap();
        assert_eq!(cube.layer_count(), 6);
    }

    #[test]
    fn test_failed_copy_rolls_back() {
        let (device, mut manager) = manager();
        device.fail_next("queue_submit", vk::Result::ERROR_DEVICE_LOST);
        let err = manager.upload_vertices(&Mesh::quad().vertices).unwrap_err();
        assert!(matches!(err, RenderError::NativeApi { .. }));
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_memory(), 0);
    }

    #[test]
    fn test_events_queue_frees_until_applied() {
        let queue = EventQueue::new();
        let (device, manager) = manager();
        let mut manager = manager.with_events(queue.subscribe());

        let gpu = manager.load_mesh(7, &Mesh::cube()).unwrap();
        manager.load_texture(8, &TextureData::white()).unwrap();
        assert_eq!(manager.cached_count(), 2);

        queue.publish(ResourceEvent::Loaded(9));
        queue.publish(ResourceEvent::Removed(7));
        queue.publish(ResourceEvent::Replaced(8));
        assert_eq!(manager.process_events(), 2);
        assert_eq!(manager.cached_count(), 0);
        assert_eq!(manager.pending_free_count(), 3);
        assert!(gpu.vertices.is_valid());

        assert_eq!(manager.apply_pending_frees().unwrap(), 3);
        assert!(!gpu.vertices.is_valid());
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_images(), 0);
        assert_eq!(manager.apply_pending_frees().unwrap(), 0);
    }

    #[test]
    fn test_reload_queues_previous_mirror() {
        let (_device, mut manager) = manager();
        let first = manager.load_texture(1, &TextureData::white()).unwrap();
        let second = manager.load_texture(1, &TextureData::white()).unwrap();
        assert!(!first.same_allocation(&second));
        assert_eq!(manager.pending_free_count(), 1);
        assert!(manager.texture(1).is_some_and(|t| t.same_allocation(&second)));
    }
}
