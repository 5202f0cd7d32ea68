//! Dummy GPU device for testing and development.
//!
//! This device doesn't talk to a GPU. It mints handles from a counter, keeps
//! host memory for mapped allocations, and records every call so tests can
//! assert on ordering and object lifetimes. Acquire/present results, fence
//! timeouts, memory-type tables and one-shot failures can be scripted.

use std::collections::{HashMap, HashSet, VecDeque};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;

use crate::backend::traits::GpuDevice;
use crate::backend::types::*;
use crate::swapchain::SurfaceProvider;

/// A native call observed by [`DummyDevice`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    CreateBuffer(vk::Buffer),
    DestroyBuffer(vk::Buffer),
    CreateImage(vk::Image),
    DestroyImage(vk::Image),
    AllocateMemory {
        memory: vk::DeviceMemory,
        memory_type_index: u32,
        size: vk::DeviceSize,
    },
    FreeMemory(vk::DeviceMemory),
    MapMemory(vk::DeviceMemory),
    UnmapMemory(vk::DeviceMemory),
    CreateImageView(vk::ImageView),
    DestroyImageView(vk::ImageView),
    CreateRenderPass(vk::RenderPass),
    DestroyRenderPass(vk::RenderPass),
    CreateFramebuffer(vk::Framebuffer),
    DestroyFramebuffer(vk::Framebuffer),
    CreateCommandPool(vk::CommandPool),
    DestroyCommandPool(vk::CommandPool),
    AllocateCommandBuffers(Vec<vk::CommandBuffer>),
    FreeCommandBuffers(Vec<vk::CommandBuffer>),
    ResetCommandBuffer(vk::CommandBuffer),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    BeginRenderPass {
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
    },
    NextSubpass(vk::CommandBuffer),
    EndRenderPass(vk::CommandBuffer),
    BindPipeline(vk::CommandBuffer),
    SetViewportAndScissor(vk::CommandBuffer),
    BindVertexBuffer {
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
    },
    BindIndexBuffer {
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
    },
    Draw {
        cmd: vk::CommandBuffer,
        vertex_count: u32,
    },
    DrawIndexed {
        cmd: vk::CommandBuffer,
        index_count: u32,
    },
    CopyBuffer {
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    },
    CopyBufferToImage {
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
    },
    ImageBarrier {
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    WaitForFence(vk::Fence),
    ResetFence(vk::Fence),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    QueueSubmit {
        command_buffers: Vec<vk::CommandBuffer>,
        fence: vk::Fence,
    },
    QueueWaitIdle,
    DeviceWaitIdle,
    CreateSwapchain {
        swapchain: vk::SwapchainKHR,
        old_swapchain: vk::SwapchainKHR,
        image_count: u32,
        extent: vk::Extent2D,
        present_mode: vk::PresentModeKHR,
    },
    DestroySwapchain(vk::SwapchainKHR),
    AcquireNextImage {
        swapchain: vk::SwapchainKHR,
        result: Result<u32, vk::Result>,
    },
    QueuePresent {
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    },
}

struct DummyState {
    next_handle: u64,
    calls: Vec<DeviceCall>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    memory_type_bits: u32,
    memory: HashMap<vk::DeviceMemory, Box<[u8]>>,
    buffers: HashMap<vk::Buffer, BufferDesc>,
    images: HashMap<vk::Image, ImageDesc>,
    image_views: HashSet<vk::ImageView>,
    render_passes: HashMap<vk::RenderPass, RenderPassLayout>,
    framebuffers: HashMap<vk::Framebuffer, FramebufferDesc>,
    command_pools: HashSet<vk::CommandPool>,
    command_buffers: HashSet<vk::CommandBuffer>,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashSet<vk::Semaphore>,
    swapchains: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    next_image: HashMap<vk::SwapchainKHR, u32>,
    surface_capabilities: vk::SurfaceCapabilitiesKHR,
    surface_formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
    acquire_script: VecDeque<VkResult<bool>>,
    present_script: VecDeque<VkResult<bool>>,
    fence_timeouts: usize,
    failures: HashMap<&'static str, vk::Result>,
}

impl DummyState {
    fn mint<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn take_failure(&mut self, op: &'static str) -> VkResult<()> {
        match self.failures.remove(op) {
            Some(result) => {
                log::trace!("DummyDevice: injected failure {:?} for {}", result, op);
                Err(result)
            }
            None => Ok(()),
        }
    }
}

/// In-memory [`GpuDevice`] that records every call.
pub struct DummyDevice {
    state: Mutex<DummyState>,
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyDevice {
    /// Create a dummy device with a three-entry memory table:
    /// device-local, host-visible/coherent, and device-local + host-visible.
    pub fn new() -> Self {
        let surface_capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
        };

        let device = Self {
            state: Mutex::new(DummyState {
                next_handle: 0,
                calls: Vec::new(),
                memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
                memory_type_bits: u32::MAX,
                memory: HashMap::new(),
                buffers: HashMap::new(),
                images: HashMap::new(),
                image_views: HashSet::new(),
                render_passes: HashMap::new(),
                framebuffers: HashMap::new(),
                command_pools: HashSet::new(),
                command_buffers: HashSet::new(),
                fences: HashMap::new(),
                semaphores: HashSet::new(),
                swapchains: HashMap::new(),
                next_image: HashMap::new(),
                surface_capabilities,
                surface_formats: vec![
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_UNORM,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_SRGB,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                ],
                present_modes: vec![
                    vk::PresentModeKHR::FIFO,
                    vk::PresentModeKHR::MAILBOX,
                    vk::PresentModeKHR::IMMEDIATE,
                ],
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                fence_timeouts: 0,
                failures: HashMap::new(),
            }),
        };
        device.set_memory_types(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        device
    }

    /// Replace the memory-type table. Types with `DEVICE_LOCAL` live in heap 0,
    /// everything else in heap 1.
    pub fn set_memory_types(&self, types: &[vk::MemoryPropertyFlags]) {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len().min(vk::MAX_MEMORY_TYPES) as u32,
            memory_heap_count: 2,
            ..Default::default()
        };
        for (i, flags) in types.iter().take(vk::MAX_MEMORY_TYPES).enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: if flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
                    0
                } else {
                    1
                },
            };
        }
        props.memory_heaps[0] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        props.memory_heaps[1] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::empty(),
        };
        self.state.lock().memory_properties = props;
    }

    /// Restrict `memory_type_bits` reported for every buffer and image.
    pub fn set_memory_type_bits(&self, bits: u32) {
        self.state.lock().memory_type_bits = bits;
    }

    pub fn set_surface_extent(&self, width: u32, height: u32) {
        self.state.lock().surface_capabilities.current_extent = vk::Extent2D { width, height };
    }

    pub fn set_surface_capabilities(&self, capabilities: vk::SurfaceCapabilitiesKHR) {
        self.state.lock().surface_capabilities = capabilities;
    }

    pub fn set_surface_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state.lock().surface_formats = formats;
    }

    pub fn set_present_modes(&self, modes: Vec<vk::PresentModeKHR>) {
        self.state.lock().present_modes = modes;
    }

    /// Queue the outcome of the next acquire. `Ok(suboptimal)` acquires the
    /// next image in round-robin order.
    pub fn script_acquire(&self, result: VkResult<bool>) {
        self.state.lock().acquire_script.push_back(result);
    }

    /// Queue the outcome of the next present.
    pub fn script_present(&self, result: VkResult<bool>) {
        self.state.lock().present_script.push_back(result);
    }

    /// Make the next `count` fence waits time out.
    pub fn script_fence_timeouts(&self, count: usize) {
        self.state.lock().fence_timeouts = count;
    }

    /// Fail the next call of the named operation (e.g. `"create_render_pass"`).
    pub fn fail_next(&self, op: &'static str, result: vk::Result) {
        self.state.lock().failures.insert(op, result);
    }

    /// Snapshot of every call recorded so far.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count_calls(&self, pred: impl Fn(&DeviceCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_memory(&self) -> usize {
        self.state.lock().memory.len()
    }

    pub fn live_image_views(&self) -> usize {
        self.state.lock().image_views.len()
    }

    pub fn live_render_passes(&self) -> usize {
        self.state.lock().render_passes.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state.lock().framebuffers.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn live_swapchains(&self) -> usize {
        self.state.lock().swapchains.len()
    }

    /// Layout a renderpass was created with, if it is still alive.
    pub fn render_pass_layout(&self, render_pass: vk::RenderPass) -> Option<RenderPassLayout> {
        self.state.lock().render_passes.get(&render_pass).cloned()
    }

    /// Descriptor a framebuffer was created with, if it is still alive.
    pub fn framebuffer_desc(&self, framebuffer: vk::Framebuffer) -> Option<FramebufferDesc> {
        self.state.lock().framebuffers.get(&framebuffer).cloned()
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence).copied().unwrap_or(false)
    }
}

impl GpuDevice for DummyDevice {
    fn name(&self) -> &str {
        "Dummy Device"
    }

    fn graphics_queue(&self) -> vk::Queue {
        vk::Queue::from_raw(0x1000)
    }

    fn present_queue(&self) -> vk::Queue {
        vk::Queue::from_raw(0x1000)
    }

    fn graphics_queue_family(&self) -> u32 {
        0
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.state.lock().memory_properties
    }

    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<vk::Buffer> {
        let mut state = self.state.lock();
        state.take_failure("create_buffer")?;
        let buffer = state.mint();
        log::trace!("DummyDevice: creating buffer {:?} (size: {})", buffer, desc.size);
        state.buffers.insert(buffer, *desc);
        state.calls.push(DeviceCall::CreateBuffer(buffer));
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        log::trace!("DummyDevice: destroying buffer {:?}", buffer);
        state.buffers.remove(&buffer);
        state.calls.push(DeviceCall::DestroyBuffer(buffer));
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state.buffers.get(&buffer).map(|b| b.size).unwrap_or(0);
        vk::MemoryRequirements {
            size: size.next_multiple_of(16),
            alignment: 16,
            memory_type_bits: state.memory_type_bits,
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image> {
        let mut state = self.state.lock();
        state.take_failure("create_image")?;
        let image = state.mint();
        log::trace!(
            "DummyDevice: creating image {:?} ({}x{}x{}, {} layers)",
            image,
            desc.extent.width,
            desc.extent.height,
            desc.extent.depth,
            desc.array_layers
        );
        state.images.insert(image, *desc);
        state.calls.push(DeviceCall::CreateImage(image));
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        log::trace!("DummyDevice: destroying image {:?}", image);
        state.images.remove(&image);
        state.calls.push(DeviceCall::DestroyImage(image));
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state
            .images
            .get(&image)
            .map(|i| {
                u64::from(i.extent.width)
                    * u64::from(i.extent.height)
                    * u64::from(i.extent.depth)
                    * u64::from(i.array_layers)
                    * 4
            })
            .unwrap_or(0);
        vk::MemoryRequirements {
            size: size.next_multiple_of(256),
            alignment: 256,
            memory_type_bits: state.memory_type_bits,
        }
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state.lock();
        state.take_failure("allocate_memory")?;
        if memory_type_index >= state.memory_properties.memory_type_count {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let memory = state.mint();
        log::trace!(
            "DummyDevice: allocating {} bytes from memory type {}",
            size,
            memory_type_index
        );
        state
            .memory
            .insert(memory, vec![0u8; size as usize].into_boxed_slice());
        state.calls.push(DeviceCall::AllocateMemory {
            memory,
            memory_type_index,
            size,
        });
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        log::trace!("DummyDevice: freeing memory {:?}", memory);
        state.memory.remove(&memory);
        state.calls.push(DeviceCall::FreeMemory(memory));
    }

    fn bind_buffer_memory(&self, _buffer: vk::Buffer, _memory: vk::DeviceMemory) -> VkResult<()> {
        self.state.lock().take_failure("bind_buffer_memory")
    }

    fn bind_image_memory(&self, _image: vk::Image, _memory: vk::DeviceMemory) -> VkResult<()> {
        self.state.lock().take_failure("bind_image_memory")
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> VkResult<*mut u8> {
        let mut state = self.state.lock();
        state.take_failure("map_memory")?;
        state.calls.push(DeviceCall::MapMemory(memory));
        match state.memory.get_mut(&memory) {
            Some(bytes) if bytes.len() as u64 >= size => Ok(bytes.as_mut_ptr()),
            _ => Err(vk::Result::ERROR_MEMORY_MAP_FAILED),
        }
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.state.lock().calls.push(DeviceCall::UnmapMemory(memory));
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> VkResult<vk::ImageView> {
        let mut state = self.state.lock();
        state.take_failure("create_image_view")?;
        let view = state.mint();
        log::trace!("DummyDevice: creating view {:?} of {:?}", view, desc.image);
        state.image_views.insert(view);
        state.calls.push(DeviceCall::CreateImageView(view));
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        state.image_views.remove(&view);
        state.calls.push(DeviceCall::DestroyImageView(view));
    }

    fn create_render_pass(&self, layout: &RenderPassLayout) -> VkResult<vk::RenderPass> {
        let mut state = self.state.lock();
        state.take_failure("create_render_pass")?;
        let render_pass = state.mint();
        log::trace!(
            "DummyDevice: creating renderpass {:?} ({} attachments, {} subpasses, {} dependencies)",
            render_pass,
            layout.attachments.len(),
            layout.subpasses.len(),
            layout.dependencies.len()
        );
        state.render_passes.insert(render_pass, layout.clone());
        state.calls.push(DeviceCall::CreateRenderPass(render_pass));
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        let mut state = self.state.lock();
        state.render_passes.remove(&render_pass);
        state.calls.push(DeviceCall::DestroyRenderPass(render_pass));
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> VkResult<vk::Framebuffer> {
        let mut state = self.state.lock();
        state.take_failure("create_framebuffer")?;
        let framebuffer = state.mint();
        state.framebuffers.insert(framebuffer, desc.clone());
        state.calls.push(DeviceCall::CreateFramebuffer(framebuffer));
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.lock();
        state.framebuffers.remove(&framebuffer);
        state.calls.push(DeviceCall::DestroyFramebuffer(framebuffer));
    }

    fn create_command_pool(
        &self,
        _queue_family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        state.take_failure("create_command_pool")?;
        let pool = state.mint();
        state.command_pools.insert(pool);
        state.calls.push(DeviceCall::CreateCommandPool(pool));
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.command_pools.remove(&pool);
        state.calls.push(DeviceCall::DestroyCommandPool(pool));
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        state.take_failure("allocate_command_buffers")?;
        let buffers: Vec<vk::CommandBuffer> = (0..count).map(|_| state.mint()).collect();
        state.command_buffers.extend(buffers.iter().copied());
        state
            .calls
            .push(DeviceCall::AllocateCommandBuffers(buffers.clone()));
        Ok(buffers)
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for buffer in buffers {
            state.command_buffers.remove(buffer);
        }
        state
            .calls
            .push(DeviceCall::FreeCommandBuffers(buffers.to_vec()));
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("reset_command_buffer")?;
        state.calls.push(DeviceCall::ResetCommandBuffer(cmd));
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _usage: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("begin_command_buffer")?;
        state.calls.push(DeviceCall::BeginCommandBuffer(cmd));
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("end_command_buffer")?;
        state.calls.push(DeviceCall::EndCommandBuffer(cmd));
        Ok(())
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin) {
        self.state.lock().calls.push(DeviceCall::BeginRenderPass {
            cmd,
            render_pass: begin.render_pass,
            framebuffer: begin.framebuffer,
        });
    }

    fn cmd_next_subpass(&self, cmd: vk::CommandBuffer) {
        self.state.lock().calls.push(DeviceCall::NextSubpass(cmd));
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.state.lock().calls.push(DeviceCall::EndRenderPass(cmd));
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _pipeline: vk::Pipeline,
    ) {
        self.state.lock().calls.push(DeviceCall::BindPipeline(cmd));
    }

    fn cmd_set_viewport_and_scissor(&self, cmd: vk::CommandBuffer, _extent: vk::Extent2D) {
        self.state
            .lock()
            .calls
            .push(DeviceCall::SetViewportAndScissor(cmd));
    }

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, _binding: u32, buffer: vk::Buffer) {
        self.state
            .lock()
            .calls
            .push(DeviceCall::BindVertexBuffer { cmd, buffer });
    }

    fn cmd_bind_index_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        self.state
            .lock()
            .calls
            .push(DeviceCall::BindIndexBuffer { cmd, buffer });
    }

    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32, _instance_count: u32) {
        self.state
            .lock()
            .calls
            .push(DeviceCall::Draw { cmd, vertex_count });
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32, _instance_count: u32) {
        self.state
            .lock()
            .calls
            .push(DeviceCall::DrawIndexed { cmd, index_count });
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) {
        self.state.lock().calls.push(DeviceCall::CopyBuffer {
            cmd,
            src,
            dst,
            size,
        });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        _regions: &[vk::BufferImageCopy],
    ) {
        self.state
            .lock()
            .calls
            .push(DeviceCall::CopyBufferToImage { cmd, src, dst });
    }

    fn cmd_image_barrier(&self, cmd: vk::CommandBuffer, barrier: &ImageBarrier) {
        self.state.lock().calls.push(DeviceCall::ImageBarrier {
            cmd,
            image: barrier.image,
            old_layout: barrier.old_layout,
            new_layout: barrier.new_layout,
        });
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        state.take_failure("create_fence")?;
        let fence = state.mint();
        state.fences.insert(fence, signaled);
        state.calls.push(DeviceCall::CreateFence(fence));
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence);
        state.calls.push(DeviceCall::DestroyFence(fence));
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::WaitForFence(fence));
        if state.fence_timeouts > 0 {
            state.fence_timeouts -= 1;
            return Err(vk::Result::TIMEOUT);
        }
        match state.fences.get(&fence) {
            Some(true) => Ok(()),
            // Nothing will ever signal it, so a real wait would time out.
            Some(false) => Err(vk::Result::TIMEOUT),
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("reset_fence")?;
        if let Some(signaled) = state.fences.get_mut(&fence) {
            *signaled = false;
        }
        state.calls.push(DeviceCall::ResetFence(fence));
        Ok(())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        state.take_failure("create_semaphore")?;
        let semaphore = state.mint();
        state.semaphores.insert(semaphore);
        state.calls.push(DeviceCall::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.semaphores.remove(&semaphore);
        state.calls.push(DeviceCall::DestroySemaphore(semaphore));
    }

    fn queue_submit(&self, _queue: vk::Queue, submit: &SubmitDesc) -> VkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("queue_submit")?;
        log::trace!(
            "DummyDevice: submitting {} command buffers",
            submit.command_buffers.len()
        );
        if submit.fence != vk::Fence::null() {
            if let Some(signaled) = state.fences.get_mut(&submit.fence) {
                *signaled = true;
            }
        }
        state.calls.push(DeviceCall::QueueSubmit {
            command_buffers: submit.command_buffers.clone(),
            fence: submit.fence,
        });
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        self.state.lock().calls.push(DeviceCall::QueueWaitIdle);
        Ok(())
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        self.state.lock().calls.push(DeviceCall::DeviceWaitIdle);
        Ok(())
    }

    fn surface_capabilities(
        &self,
        _surface: vk::SurfaceKHR,
    ) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        let mut state = self.state.lock();
        state.take_failure("surface_capabilities")?;
        Ok(state.surface_capabilities)
    }

    fn surface_formats(&self, _surface: vk::SurfaceKHR) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.state.lock().surface_formats.clone())
    }

    fn surface_present_modes(
        &self,
        _surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::PresentModeKHR>> {
        Ok(self.state.lock().present_modes.clone())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        state.take_failure("create_swapchain")?;
        let swapchain = state.mint();
        let images: Vec<vk::Image> = (0..desc.min_image_count).map(|_| state.mint()).collect();
        log::trace!(
            "DummyDevice: creating swapchain {:?} ({} images, {}x{})",
            swapchain,
            images.len(),
            desc.extent.width,
            desc.extent.height
        );
        state.swapchains.insert(swapchain, images);
        state.next_image.insert(swapchain, 0);
        state.calls.push(DeviceCall::CreateSwapchain {
            swapchain,
            old_swapchain: desc.old_swapchain,
            image_count: desc.min_image_count,
            extent: desc.extent,
            present_mode: desc.present_mode,
        });
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.swapchains.remove(&swapchain);
        state.next_image.remove(&swapchain);
        state.calls.push(DeviceCall::DestroySwapchain(swapchain));
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain)
            .cloned()
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        _signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        let scripted = state.acquire_script.pop_front().unwrap_or(Ok(false));
        let result = match scripted {
            Err(err) => Err(err),
            Ok(suboptimal) => {
                let count = state.swapchains.get(&swapchain).map(|i| i.len() as u32);
                match count {
                    Some(count) if count > 0 => {
                        let next = state.next_image.entry(swapchain).or_insert(0);
                        let index = *next % count;
                        *next = next.wrapping_add(1);
                        Ok((index, suboptimal))
                    }
                    _ => Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
                }
            }
        };
        state.calls.push(DeviceCall::AcquireNextImage {
            swapchain,
            result: result.map(|(index, _)| index),
        });
        result
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        _wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::QueuePresent {
            swapchain,
            image_index,
        });
        state.present_script.pop_front().unwrap_or(Ok(false))
    }
}

/// Surface stand-in for [`DummyDevice`] with a resizable window size.
pub struct DummySurface {
    surface: vk::SurfaceKHR,
    window_id: u64,
    size: Mutex<(u32, u32)>,
}

impl DummySurface {
    pub fn new(window_id: u64, width: u32, height: u32) -> Self {
        Self {
            surface: vk::SurfaceKHR::from_raw(0x5000 + window_id),
            window_id,
            size: Mutex::new((width, height)),
        }
    }

    pub fn resize(&self, width: u32, height: u32) {
        *self.size.lock() = (width, height);
    }
}

impl SurfaceProvider for DummySurface {
    fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    fn window_id(&self) -> u64 {
        self.window_id
    }

    fn size(&self) -> (u32, u32) {
        *self.size.lock()
    }
}
