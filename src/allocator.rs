//! GPU memory allocator
//!
//! Creates buffers and images, picks a memory type for them, binds and
//! optionally maps the memory, and hands out shared views. The allocator
//! stays the single owner of every allocation: freeing one invalidates all
//! clones of its view, and any later use of such a view returns
//! [`RenderError::StaleView`].

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;
use log::{debug, error, warn};
use parking_lot::RwLock;

use crate::backend::{aspect_for_format, BufferDesc, GpuDevice, ImageDesc, ImageViewDesc};
use crate::error::{RenderError, RenderResult};

/// Pick the lowest memory type index allowed by `type_bits` whose property
/// flags contain all of `required`.
pub fn select_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> RenderResult<u32> {
    let count = (properties.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);
    properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|(i, memory_type)| {
            type_bits & (1 << i) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(i, _)| i as u32)
        .ok_or(RenderError::NoSuitableMemory {
            type_bits,
            required,
        })
}

fn native_error(context: &str, result: vk::Result) -> RenderError {
    error!(target: "allocator", "{context} failed: {result}");
    RenderError::native(context, result)
}

#[derive(Debug, Clone, Copy)]
struct MappedPtr(NonNull<u8>);

// The pointer targets device memory owned by the allocator. Copies through it
// hold the view's access lock for reading; unmapping holds it for writing.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

/// What a buffer allocation should look like
#[derive(Debug, Clone, Copy)]
pub struct BufferRequirements {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory_flags: vk::MemoryPropertyFlags,
    /// Keep the memory persistently mapped
    pub mapped: bool,
}

impl BufferRequirements {
    pub fn device_local(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            mapped: false,
        }
    }

    /// Host-visible, coherent and persistently mapped.
    pub fn host_visible(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            mapped: true,
        }
    }
}

/// What an image allocation (and its view) should look like
#[derive(Debug, Clone, Copy)]
pub struct ImageRequirements {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub memory_flags: vk::MemoryPropertyFlags,
    pub aspect_mask: vk::ImageAspectFlags,
    pub view_type: vk::ImageViewType,
    pub array_layers: u32,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub flags: vk::ImageCreateFlags,
}

impl ImageRequirements {
    /// Single-layer 2D image in device-local memory.
    pub fn new_2d(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            width,
            height,
            format,
            usage,
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            aspect_mask: aspect_for_format(format),
            view_type: vk::ImageViewType::TYPE_2D,
            array_layers: 1,
            mip_levels: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            flags: vk::ImageCreateFlags::empty(),
        }
    }

    /// Six-layer cube-compatible image viewed as a cube.
    pub fn cube(size: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            array_layers: 6,
            view_type: vk::ImageViewType::CUBE,
            flags: vk::ImageCreateFlags::CUBE_COMPATIBLE,
            ..Self::new_2d(size, size, format, usage)
        }
    }

    pub fn array(
        width: u32,
        height: u32,
        layers: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            array_layers: layers,
            view_type: vk::ImageViewType::TYPE_2D_ARRAY,
            ..Self::new_2d(width, height, format, usage)
        }
    }

    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }
}

#[derive(Debug)]
struct BufferViewInner {
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    mapped: Option<MappedPtr>,
    valid: AtomicBool,
    access: RwLock<()>,
}

/// Shared handle to a buffer owned by [`GpuAllocator`].
#[derive(Debug, Clone)]
pub struct BufferView {
    inner: Arc<BufferViewInner>,
}

impl BufferView {
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// The raw handle, without checking validity. Only meant for identity
    /// comparisons and logging.
    pub fn raw(&self) -> vk::Buffer {
        self.inner.buffer
    }

    pub fn buffer(&self) -> RenderResult<vk::Buffer> {
        self.check()?;
        Ok(self.inner.buffer)
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }

    pub fn is_mapped(&self) -> bool {
        self.inner.mapped.is_some()
    }

    /// Whether both views refer to the same allocation.
    pub fn same_allocation(&self, other: &BufferView) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Copy bytes into the mapped memory at `offset`.
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> RenderResult<()> {
        let _access = self.inner.access.read();
        let ptr = self.mapped_range(offset, data.len())?;
        // SAFETY: the range was bounds-checked against the allocation size, and
        // the held access lock keeps the memory mapped until the copy is done.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        Ok(())
    }

    /// Copy a slice of plain-old-data values into the mapped memory.
    pub fn write_pod<T: bytemuck::Pod>(
        &self,
        offset: vk::DeviceSize,
        data: &[T],
    ) -> RenderResult<()> {
        self.write(offset, bytemuck::cast_slice(data))
    }

    /// Read `len` bytes back from the mapped memory at `offset`.
    pub fn read(&self, offset: vk::DeviceSize, len: usize) -> RenderResult<Vec<u8>> {
        let _access = self.inner.access.read();
        let ptr = self.mapped_range(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: see `write`.
        unsafe { std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), len) };
        Ok(out)
    }

    fn check(&self) -> RenderResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(RenderError::StaleView("buffer"))
        }
    }

    fn mapped_range(&self, offset: vk::DeviceSize, len: usize) -> RenderResult<*mut u8> {
        self.check()?;
        let mapped = self.inner.mapped.ok_or_else(|| {
            RenderError::InvalidArgument(format!(
                "buffer {:?} is not host mapped",
                self.inner.buffer
            ))
        })?;
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.inner.size) {
            return Err(RenderError::InvalidArgument(format!(
                "range {}..{} exceeds buffer size {}",
                offset,
                offset.saturating_add(len as u64),
                self.inner.size
            )));
        }
        // SAFETY: offset is within the mapped allocation.
        Ok(unsafe { mapped.0.as_ptr().add(offset as usize) })
    }

    fn invalidate(&self) {
        let _access = self.inner.access.write();
        self.inner.valid.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
struct ImageViewInner {
    image: vk::Image,
    view: vk::ImageView,
    format: vk::Format,
    extent: vk::Extent2D,
    aspect_mask: vk::ImageAspectFlags,
    layer_count: u32,
    valid: AtomicBool,
}

/// Shared handle to an image and its view, owned by [`GpuAllocator`].
#[derive(Debug, Clone)]
pub struct ImageView {
    inner: Arc<ImageViewInner>,
}

impl ImageView {
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// The raw image handle, without checking validity.
    pub fn raw_image(&self) -> vk::Image {
        self.inner.image
    }

    pub fn image(&self) -> RenderResult<vk::Image> {
        self.check()?;
        Ok(self.inner.image)
    }

    pub fn view(&self) -> RenderResult<vk::ImageView> {
        self.check()?;
        Ok(self.inner.view)
    }

    pub fn format(&self) -> vk::Format {
        self.inner.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.inner.extent
    }

    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        self.inner.aspect_mask
    }

    pub fn layer_count(&self) -> u32 {
        self.inner.layer_count
    }

    pub fn same_allocation(&self, other: &ImageView) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check(&self) -> RenderResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(RenderError::StaleView("image"))
        }
    }

    fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::Release);
    }
}

/// A buffer and its memory, owned by the allocator
#[derive(Debug)]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub requirements: BufferRequirements,
    pub memory_requirements: vk::MemoryRequirements,
    pub memory_type_index: u32,
    view: BufferView,
}

/// An image, its memory and its view, owned by the allocator
#[derive(Debug)]
pub struct ImageAllocation {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: vk::DeviceMemory,
    pub requirements: ImageRequirements,
    pub memory_requirements: vk::MemoryRequirements,
    pub memory_type_index: u32,
    shared: ImageView,
}

/// Allocates buffers and images and tracks every live allocation.
///
/// Not thread-safe; share it as `Arc<parking_lot::Mutex<GpuAllocator>>`.
pub struct GpuAllocator {
    device: Arc<dyn GpuDevice>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    buffers: HashMap<vk::Buffer, BufferAllocation>,
    images: HashMap<vk::Image, ImageAllocation>,
}

impl GpuAllocator {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        let memory_properties = device.memory_properties();
        Self {
            device,
            memory_properties,
            buffers: HashMap::new(),
            images: HashMap::new(),
        }
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn tracked_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn tracked_images(&self) -> usize {
        self.images.len()
    }

    pub fn buffer_allocation(&self, view: &BufferView) -> Option<&BufferAllocation> {
        self.buffers
            .get(&view.raw())
            .filter(|a| a.view.same_allocation(view))
    }

    pub fn image_allocation(&self, view: &ImageView) -> Option<&ImageAllocation> {
        self.images
            .get(&view.raw_image())
            .filter(|a| a.shared.same_allocation(view))
    }

    /// Create a buffer, back it with memory and optionally map it.
    pub fn allocate_buffer(
        &mut self,
        requirements: BufferRequirements,
    ) -> RenderResult<BufferView> {
        if requirements.size == 0 {
            return Err(RenderError::InvalidArgument(
                "buffer size must be non-zero".into(),
            ));
        }

        let buffer = self
            .device
            .create_buffer(&BufferDesc {
                size: requirements.size,
                usage: requirements.usage,
            })
            .map_err(|r| native_error("create buffer", r))?;

        let memory_requirements = self.device.buffer_memory_requirements(buffer);
        let backing = self.allocate_backing(memory_requirements, requirements.memory_flags);
        let (memory, memory_type_index) = match backing {
            Ok(backing) => backing,
            Err(err) => {
                self.device.destroy_buffer(buffer);
                return Err(err);
            }
        };

        if let Err(result) = self.device.bind_buffer_memory(buffer, memory) {
            self.device.free_memory(memory);
            self.device.destroy_buffer(buffer);
            return Err(native_error("bind buffer memory", result));
        }

        let mapped = if requirements.mapped {
            let ptr = match self.device.map_memory(memory, memory_requirements.size) {
                Ok(ptr) => ptr,
                Err(result) => {
                    self.device.destroy_buffer(buffer);
                    self.device.free_memory(memory);
                    return Err(native_error("map buffer memory", result));
                }
            };
            NonNull::new(ptr).map(MappedPtr)
        } else {
            None
        };

        let view = BufferView {
            inner: Arc::new(BufferViewInner {
                buffer,
                size: requirements.size,
                mapped,
                valid: AtomicBool::new(true),
                access: RwLock::new(()),
            }),
        };

        debug!(
            target: "allocator",
            "Allocated buffer {:?} ({} bytes, memory type {}, mapped: {})",
            buffer,
            requirements.size,
            memory_type_index,
            mapped.is_some()
        );

        self.buffers.insert(
            buffer,
            BufferAllocation {
                buffer,
                memory,
                requirements,
                memory_requirements,
                memory_type_index,
                view: view.clone(),
            },
        );
        Ok(view)
    }

    /// Create an image plus a view of it, backed by memory.
    pub fn allocate_image(&mut self, requirements: ImageRequirements) -> RenderResult<ImageView> {
        if requirements.width == 0 || requirements.height == 0 || requirements.array_layers == 0 {
            return Err(RenderError::InvalidArgument(format!(
                "image dimensions must be non-zero ({}x{}, {} layers)",
                requirements.width, requirements.height, requirements.array_layers
            )));
        }

        let image = self
            .device
            .create_image(&ImageDesc {
                extent: vk::Extent3D {
                    width: requirements.width,
                    height: requirements.height,
                    depth: 1,
                },
                format: requirements.format,
                usage: requirements.usage,
                mip_levels: requirements.mip_levels,
                array_layers: requirements.array_layers,
                samples: requirements.samples,
                flags: requirements.flags,
            })
            .map_err(|r| native_error("create image", r))?;

        let memory_requirements = self.device.image_memory_requirements(image);
        let backing = self.allocate_backing(memory_requirements, requirements.memory_flags);
        let (memory, memory_type_index) = match backing {
            Ok(backing) => backing,
            Err(err) => {
                self.device.destroy_image(image);
                return Err(err);
            }
        };

        if let Err(result) = self.device.bind_image_memory(image, memory) {
            self.device.destroy_image(image);
            self.device.free_memory(memory);
            return Err(native_error("bind image memory", result));
        }

        let view = match self.device.create_image_view(&ImageViewDesc {
            image,
            view_type: requirements.view_type,
            format: requirements.format,
            aspect_mask: requirements.aspect_mask,
            mip_levels: requirements.mip_levels,
            layer_count: requirements.array_layers,
        }) {
            Ok(view) => view,
            Err(result) => {
                self.device.destroy_image(image);
                self.device.free_memory(memory);
                return Err(native_error("create image view", result));
            }
        };

        let shared = ImageView {
            inner: Arc::new(ImageViewInner {
                image,
                view,
                format: requirements.format,
                extent: vk::Extent2D {
                    width: requirements.width,
                    height: requirements.height,
                },
                aspect_mask: requirements.aspect_mask,
                layer_count: requirements.array_layers,
                valid: AtomicBool::new(true),
            }),
        };

        debug!(
            target: "allocator",
            "Allocated image {:?} ({}x{}, {} layers, {:?}, memory type {})",
            image,
            requirements.width,
            requirements.height,
            requirements.array_layers,
            requirements.format,
            memory_type_index
        );

        self.images.insert(
            image,
            ImageAllocation {
                image,
                view,
                memory,
                requirements,
                memory_requirements,
                memory_type_index,
                shared: shared.clone(),
            },
        );
        Ok(shared)
    }

    /// Release a buffer. Unknown (or already freed) buffers are logged and
    /// ignored.
    pub fn free_buffer(&mut self, view: &BufferView) {
        let known = self
            .buffers
            .get(&view.raw())
            .is_some_and(|a| a.view.same_allocation(view));
        if !known {
            warn!(target: "allocator", "free_buffer: unknown buffer {:?}, ignoring", view.raw());
            return;
        }
        if let Some(allocation) = self.buffers.remove(&view.raw()) {
            self.release_buffer(allocation);
        }
    }

    /// Release an image and its view. Unknown (or already freed) images are
    /// logged and ignored.
    pub fn free_image(&mut self, view: &ImageView) {
        let known = self
            .images
            .get(&view.raw_image())
            .is_some_and(|a| a.shared.same_allocation(view));
        if !known {
            warn!(
                target: "allocator",
                "free_image: unknown image {:?}, ignoring",
                view.raw_image()
            );
            return;
        }
        if let Some(allocation) = self.images.remove(&view.raw_image()) {
            self.release_image(allocation);
        }
    }

    /// Invalidate every outstanding view, then release every allocation.
    pub fn free_all(&mut self) {
        for allocation in self.buffers.values() {
            allocation.view.invalidate();
        }
        for allocation in self.images.values() {
            allocation.shared.invalidate();
        }

        let buffers: Vec<BufferAllocation> = self.buffers.drain().map(|(_, a)| a).collect();
        let images: Vec<ImageAllocation> = self.images.drain().map(|(_, a)| a).collect();
        if !buffers.is_empty() || !images.is_empty() {
            debug!(
                target: "allocator",
                "Freeing {} buffers and {} images",
                buffers.len(),
                images.len()
            );
        }
        for allocation in buffers {
            self.release_buffer(allocation);
        }
        for allocation in images {
            self.release_image(allocation);
        }
    }

    fn allocate_backing(
        &self,
        memory_requirements: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> RenderResult<(vk::DeviceMemory, u32)> {
        let memory_type_index = select_memory_type(
            &self.memory_properties,
            memory_requirements.memory_type_bits,
            flags,
        )
        .inspect_err(|err| error!(target: "allocator", "{err}"))?;
        let memory = self
            .device
            .allocate_memory(memory_requirements.size, memory_type_index)
            .map_err(|r| native_error("allocate memory", r))?;
        Ok((memory, memory_type_index))
    }

    fn release_buffer(&self, allocation: BufferAllocation) {
        {
            // No copy may be in flight between invalidation and unmap.
            let _access = allocation.view.inner.access.write();
            allocation.view.inner.valid.store(false, Ordering::Release);
            if allocation.view.is_mapped() {
                self.device.unmap_memory(allocation.memory);
            }
        }
        self.device.destroy_buffer(allocation.buffer);
        self.device.free_memory(allocation.memory);
        debug!(target: "allocator", "Freed buffer {:?}", allocation.buffer);
    }

    fn release_image(&self, allocation: ImageAllocation) {
        allocation.shared.invalidate();
        self.device.destroy_image_view(allocation.view);
        self.device.destroy_image(allocation.image);
        self.device.free_memory(allocation.memory);
        debug!(target: "allocator", "Freed image {:?}", allocation.image);
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.free_all();
    }
}
