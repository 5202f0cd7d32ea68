//! Command pool and command buffer management

use std::sync::Arc;

use ash::vk;
use log::{debug, error};

use crate::backend::{GpuDevice, SubmitDesc};
use crate::error::{RenderError, RenderResult};

fn native_error(context: &str, result: vk::Result) -> RenderError {
    error!(target: "commands", "{context} failed: {result}");
    RenderError::native(context, result)
}

/// Owns a resettable command pool on the graphics queue family and every
/// command buffer allocated from it.
pub struct CommandManager {
    device: Arc<dyn GpuDevice>,
    pool: vk::CommandPool,
    allocated: Vec<vk::CommandBuffer>,
}

impl CommandManager {
    pub fn new(device: Arc<dyn GpuDevice>) -> RenderResult<Self> {
        let pool = device
            .create_command_pool(
                device.graphics_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
            .map_err(|r| native_error("create command pool", r))?;
        debug!(target: "commands", "Created command pool {:?}", pool);
        Ok(Self {
            device,
            pool,
            allocated: Vec::new(),
        })
    }

    pub fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    /// Number of command buffers currently owned by this manager.
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    /// Allocate `count` primary command buffers, typically one per frame in
    /// flight. They are reset and re-recorded every frame.
    pub fn allocate_primary(&mut self, count: u32) -> RenderResult<Vec<vk::CommandBuffer>> {
        let buffers = self
            .device
            .allocate_command_buffers(self.pool, vk::CommandBufferLevel::PRIMARY, count)
            .map_err(|r| native_error("allocate command buffers", r))?;
        self.allocated.extend(buffers.iter().copied());
        Ok(buffers)
    }

    /// Allocate one long-lived command buffer that is recorded once and
    /// resubmitted.
    pub fn allocate_persistent(&mut self) -> RenderResult<vk::CommandBuffer> {
        let mut buffers = self.allocate_primary(1)?;
        buffers
            .pop()
            .ok_or_else(|| {
                RenderError::InitializationFailed("driver returned no command buffer".into())
            })
    }

    /// Record `record` into a fresh one-time command buffer, submit it to the
    /// graphics queue and block until the queue is idle.
    pub fn one_time_exec<F>(&mut self, name: &str, record: F) -> RenderResult<()>
    where
        F: FnOnce(&dyn GpuDevice, vk::CommandBuffer),
    {
        let cmd = self
            .device
            .allocate_command_buffers(self.pool, vk::CommandBufferLevel::PRIMARY, 1)
            .map_err(|r| native_error("allocate one-time command buffer", r))?
            .pop()
            .ok_or_else(|| {
                RenderError::InitializationFailed("driver returned no command buffer".into())
            })?;

        let result = self.submit_once(name, cmd, record);
        self.device.free_command_buffers(self.pool, &[cmd]);
        result
    }

    fn submit_once<F>(&self, name: &str, cmd: vk::CommandBuffer, record: F) -> RenderResult<()>
    where
        F: FnOnce(&dyn GpuDevice, vk::CommandBuffer),
    {
        self.device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .map_err(|r| native_error(&format!("begin one-time commands '{name}'"), r))?;
        record(&*self.device, cmd);
        self.device
            .end_command_buffer(cmd)
            .map_err(|r| native_error(&format!("end one-time commands '{name}'"), r))?;

        let queue = self.device.graphics_queue();
        let submit = SubmitDesc {
            command_buffers: vec![cmd],
            ..Default::default()
        };
        self.device
            .queue_submit(queue, &submit)
            .map_err(|r| native_error(&format!("submit one-time commands '{name}'"), r))?;
        self.device
            .queue_wait_idle(queue)
            .map_err(|r| native_error(&format!("wait for one-time commands '{name}'"), r))
    }

    /// Free specific command buffers owned by this manager.
    pub fn free(&mut self, buffers: &[vk::CommandBuffer]) {
        let owned: Vec<vk::CommandBuffer> = buffers
            .iter()
            .copied()
            .filter(|b| self.allocated.contains(b))
            .collect();
        if owned.is_empty() {
            return;
        }
        self.allocated.retain(|b| !owned.contains(b));
        self.device.free_command_buffers(self.pool, &owned);
    }

    /// Free every command buffer allocated from the pool.
    pub fn free_all(&mut self) {
        if self.allocated.is_empty() {
            return;
        }
        let buffers = std::mem::take(&mut self.allocated);
        self.device.free_command_buffers(self.pool, &buffers);
        debug!(target: "commands", "Freed {} command buffers", buffers.len());
    }

    /// Free all command buffers and destroy the pool.
    pub fn destroy(&mut self) {
        if self.pool == vk::CommandPool::null() {
            return;
        }
        self.free_all();
        self.device.destroy_command_pool(self.pool);
        self.pool = vk::CommandPool::null();
    }
}

impl Drop for CommandManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
