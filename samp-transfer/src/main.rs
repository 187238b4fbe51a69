#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::sync::Arc;

use ash::vk;
use clap::Parser;
use rgpu_lifecycle::{
    Buffer, CommandBuffer, CommandBufferState, Context, ContextConfig, ErrorKind, TransferWait,
    cleanup,
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<TracingLogLevel> for tracing_subscriber::filter::LevelFilter {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            TracingLogLevel::Off => Self::OFF,
            TracingLogLevel::Trace => Self::TRACE,
            TracingLogLevel::Debug => Self::DEBUG,
            TracingLogLevel::Info => Self::INFO,
            TracingLogLevel::Warn => Self::WARN,
            TracingLogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, default_value = "info")]
    tracing_log_level: TracingLogLevel,
    /// Size in bytes of the buffers used for the device-to-device copy.
    #[arg(short, long, default_value_t = 1024)]
    size: u64,
    /// Wait for transfers with a fence and this timeout instead of
    /// waiting for the queue to go idle.
    #[arg(long)]
    fence_timeout_ms: Option<u64>,
}

/// The externally owned Vulkan objects the library is handed.
/// Destroyed in reverse creation order on drop.
struct Gpu {
    // Keeps the loader alive until the instance is destroyed.
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
}

impl Gpu {
    fn new() -> eyre::Result<Self> {
        //SAFETY: Loads vulkan via libloading. Every object created from the
        //entry is destroyed before it is dropped (see Drop for Gpu).
        let entry = unsafe { ash::Entry::load() }?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"samp-transfer")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"rgpu-lifecycle")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);
        let instance_create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        //SAFETY: We made a valid instance_create_info
        let instance = unsafe { entry.create_instance(&instance_create_info, None) }?;

        match Self::open_device(&instance) {
            Ok((physical_device, device, queue_family)) => {
                //SAFETY: device was just created with one queue in this family
                let queue = unsafe { device.get_device_queue(queue_family, 0) };
                let pool_create_info = vk::CommandPoolCreateInfo::default()
                    .queue_family_index(queue_family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
                //SAFETY: valid create info for a family of this device
                match unsafe { device.create_command_pool(&pool_create_info, None) } {
                    Ok(command_pool) => Ok(Self {
                        _entry: entry,
                        instance,
                        physical_device,
                        device,
                        queue,
                        command_pool,
                    }),
                    Err(e) => {
                        //SAFETY: nothing else was created from device/instance
                        unsafe {
                            device.destroy_device(None);
                            instance.destroy_instance(None);
                        }
                        Err(e.into())
                    }
                }
            }
            Err(e) => {
                //SAFETY: nothing else was created from instance
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    /// Pick the first physical device with a graphics or compute queue
    /// family (both imply transfer support) and create a device with one
    /// queue from it.
    fn open_device(
        instance: &ash::Instance,
    ) -> eyre::Result<(vk::PhysicalDevice, ash::Device, u32)> {
        //SAFETY: instance is valid
        let physical_devices = unsafe { instance.enumerate_physical_devices() }?;

        let (physical_device, queue_family) = physical_devices
            .iter()
            .find_map(|&dev| {
                //SAFETY: dev was derived from instance
                let families = unsafe { instance.get_physical_device_queue_family_properties(dev) };
                families
                    .iter()
                    .position(|qf| {
                        qf.queue_count > 0
                            && qf
                                .queue_flags
                                .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                    })
                    .map(|idx| (dev, idx as u32))
            })
            .ok_or_else(|| eyre::eyre!("no physical device with a transfer-capable queue"))?;

        //SAFETY: physical_device was derived from instance
        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        tracing::info!(
            "Selected physical device: {:?} (type: {:?}), queue family {queue_family}",
            props.device_name_as_c_str().unwrap_or(c"unknown"),
            props.device_type
        );

        let priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities);
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));
        //SAFETY: physical_device was derived from instance, device_create_info
        //is valid
        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }?;

        Ok((physical_device, device, queue_family))
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.command_pool);
        //SAFETY: every buffer and command buffer was released by `cleanup`
        //before the Gpu is dropped, and the device is idle.
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn main() -> eyre::Result<()> {
    let cli_args = CliArgs::parse();

    if cli_args.tracing_log_level != TracingLogLevel::Off {
        let stdout_log = tracing_subscriber::fmt::layer();
        tracing_subscriber::registry()
            .with(stdout_log.with_filter(tracing_subscriber::filter::LevelFilter::from(
                cli_args.tracing_log_level,
            )))
            .init();
    }
    tracing::debug!("cli_args: {:#?}", cli_args);

    let config = ContextConfig {
        transfer_wait: match cli_args.fence_timeout_ms {
            Some(ms) => TransferWait::Fence {
                timeout_ns: ms.saturating_mul(1_000_000),
            },
            None => TransferWait::QueueIdle,
        },
    };

    let gpu = Gpu::new()?;
    //SAFETY: physical_device came from instance and device from
    //physical_device; queue and pool belong to device. The device outlives
    //the context because `cleanup` runs before `gpu` is dropped.
    let ctx = unsafe {
        Context::from_ash(
            &gpu.instance,
            gpu.physical_device,
            &gpu.device,
            gpu.queue,
            gpu.command_pool,
            config,
        )
    };

    let result = run_scenarios(&ctx, cli_args.size);
    drop(ctx);

    //SAFETY: Waiting on a device we own with no other threads using it
    if let Err(e) = unsafe { gpu.device.device_wait_idle() } {
        tracing::error!("Error while waiting for device idle: {e}");
    }
    //SAFETY: All scenario objects have been dropped and the device is idle
    unsafe { cleanup() };

    result
}

fn run_scenarios(ctx: &Arc<Context>, size: u64) -> eyre::Result<()> {
    host_round_trip(ctx)?;
    tracing::info!("host-visible round trip: ok");
    device_copy_chain(ctx, size)?;
    tracing::info!("device-local copy chain ({size} bytes): ok");
    double_begin_is_rejected(ctx)?;
    tracing::info!("double begin rejected: ok");
    idle_submit_is_rejected(ctx)?;
    tracing::info!("idle submit rejected: ok");
    Ok(())
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn host_round_trip(ctx: &Arc<Context>) -> eyre::Result<()> {
    let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    let mut buffer = Buffer::create(ctx, 256, vk::BufferUsageFlags::TRANSFER_SRC, host)?;
    let data = pattern(256);

    //SAFETY: data holds exactly buffer.size() bytes
    unsafe { buffer.copy_unchecked_from(data.as_ptr()) }?;
    buffer.map_memory()?;
    //SAFETY: no GPU work touches this buffer
    let mapped = unsafe { buffer.mapped_bytes() }
        .ok_or_else(|| eyre::eyre!("buffer not mapped after map_memory"))?;
    eyre::ensure!(mapped == &data[..], "mapped bytes differ from the source");
    Ok(())
}

fn device_copy_chain(ctx: &Arc<Context>, size: u64) -> eyre::Result<()> {
    use vk::BufferUsageFlags as U;
    let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    let data = pattern(usize::try_from(size)?);

    let mut staging = Buffer::create(ctx, size, U::TRANSFER_SRC, host)?;
    staging.write_pod(&data)?;
    let mut first = Buffer::create(ctx, size, U::TRANSFER_SRC | U::TRANSFER_DST, local)?;
    let mut second = Buffer::create(ctx, size, U::TRANSFER_SRC | U::TRANSFER_DST, local)?;
    let mut mirror = Buffer::create(ctx, size, U::TRANSFER_DST, host)?;

    staging.copy_to(&mut first)?;
    first.copy_to(&mut second)?;
    second.copy_to(&mut mirror)?;

    let mut out = vec![0u8; data.len()];
    mirror.read_pod(&mut out)?;
    eyre::ensure!(out == data, "device copy chain corrupted the data");
    Ok(())
}

fn double_begin_is_rejected(ctx: &Arc<Context>) -> eyre::Result<()> {
    let mut cb = CommandBuffer::create_primary(ctx)?;
    //SAFETY: freshly allocated, never submitted
    unsafe { cb.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT) }?;
    //SAFETY: never submitted
    match unsafe { cb.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT) } {
        Err(e) if e.kind == ErrorKind::CommandBufferAlreadyBegun => {}
        other => eyre::bail!("expected CommandBufferAlreadyBegun, got {other:?}"),
    }
    eyre::ensure!(cb.state() == CommandBufferState::Begun, "state changed to {:?}", cb.state());
    Ok(())
}

fn idle_submit_is_rejected(ctx: &Arc<Context>) -> eyre::Result<()> {
    let mut cb = CommandBuffer::create_primary(ctx)?;
    //SAFETY: nothing is submitted from an idle command buffer
    match unsafe { cb.submit_to_context_queue(None) } {
        Err(e) if e.kind == ErrorKind::CommandBufferNothingToSubmit => Ok(()),
        other => eyre::bail!("expected CommandBufferNothingToSubmit, got {other:?}"),
    }
}
