use crate::param::{GpuMemoryPolicy, GPU};
use bytemuck;
use wgpu::util::DeviceExt;
use wgpu::{BindGroupEntry, BindingResource, CommandEncoderDescriptor, ComputePassDescriptor};

/// Uniform block handed to the variance shader.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct VarianceParams {
    members: u32,
    positions: u32,
    threshold: f32,
    apply_threshold: u32,
}

/// GPU backend for the ensemble-variance reduction.
///
/// Holds the wgpu device and the compiled compute pipeline; the
/// per-stack buffers are created per call since stack sizes vary.
/// Computations run in f32 (the CPU path uses f64).
#[derive(Clone)]
#[allow(dead_code)]
pub struct GpuVariance {
    // WGPU core
    pub config: GPU,
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,

    // Pipeline and layout
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    shader_module: wgpu::ShaderModule,
}

impl GpuVariance {
    /// Synchronous constructor that internally does async wgpu setup
    pub fn new(config: &GPU) -> Self {
        pollster::block_on(Self::new_async(config))
    }

    pub fn log_memory_status(&self) {
        log::debug!(
            "GPU Memory Policy: {:?} | Buffer: {}/{}MB | Total: {}/{}MB",
            self.config.memory_policy,
            self.device.limits().max_storage_buffer_binding_size / 1024 / 1024,
            self.config.max_buffer_size_mb,
            self.device.limits().max_buffer_size / 1024 / 1024,
            self.config.max_total_memory_mb
        );
    }

    pub async fn new_async(config: &GPU) -> Self {
        // 1) Build wgpu
        let instance = wgpu::Instance::default();

        // First, try to get an adapter without forcing CPU fallback
        let adapter_result = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await;

        let adapter = match adapter_result {
            Some(adapter) => {
                // Control device type
                let info = adapter.get_info();

                if !config.fallback_to_cpu && info.device_type == wgpu::DeviceType::Cpu {
                    panic!("No compatible graphics card detected. The program requires a graphics card compatible with WGPU (Vulkan, Metal, DX12 or WebGPU) as the fallback_to_cpu option is disabled.");
                }

                log::info!(
                    "GPU adapter selected: {} ({:?})",
                    info.name,
                    info.device_type
                );
                adapter
            }
            None => {
                if !config.fallback_to_cpu {
                    panic!("No graphics adapter could be initialised and the fallback_to_cpu option is disabled.");
                }

                // Try explicitly with CPU fallback
                log::warn!("No compatible GPU found, trying with CPU fallback");
                instance
                    .request_adapter(&wgpu::RequestAdapterOptions {
                        power_preference: wgpu::PowerPreference::LowPower,
                        force_fallback_adapter: true,
                        compatible_surface: None,
                    })
                    .await
                    .expect("Unable to initialise even a spare CPU adapter")
            }
        };

        // Resolve memory limits according to the configured policy
        let hardware_limits = adapter.limits();
        let requested_total_size = config
            .max_total_memory_mb
            .saturating_mul(1024)
            .saturating_mul(1024);
        let requested_buffer_size = (config.max_buffer_size_mb as u64)
            .saturating_mul(1024)
            .saturating_mul(1024);

        let (final_total, final_buffer) = match config.memory_policy {
            GpuMemoryPolicy::Strict => {
                if requested_total_size > hardware_limits.max_buffer_size {
                    panic!(
                        "GPU Strict policy: requested total memory ({} MB) exceeds hardware limit ({} MB)",
                        config.max_total_memory_mb,
                        hardware_limits.max_buffer_size / (1024 * 1024)
                    );
                }
                if requested_buffer_size > hardware_limits.max_storage_buffer_binding_size as u64 {
                    panic!(
                        "GPU Strict policy: requested buffer size ({} MB) exceeds hardware limit ({} MB)",
                        config.max_buffer_size_mb,
                        hardware_limits.max_storage_buffer_binding_size / (1024 * 1024)
                    );
                }
                (requested_total_size, requested_buffer_size as u32)
            }

            GpuMemoryPolicy::Adaptive => (
                requested_total_size.min(hardware_limits.max_buffer_size),
                (requested_buffer_size
                    .min(hardware_limits.max_storage_buffer_binding_size as u64))
                    as u32,
            ),

            GpuMemoryPolicy::Performance => (
                hardware_limits.max_buffer_size,
                hardware_limits.max_storage_buffer_binding_size,
            ),
        };

        let required_limits = wgpu::Limits {
            max_storage_buffer_binding_size: final_buffer,
            max_buffer_size: final_total,
            ..wgpu::Limits::downlevel_defaults()
        };

        let (device, queue) = match adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    required_limits,
                    ..Default::default()
                },
                None,
            )
            .await
        {
            Ok(d) => d,
            Err(e) if config.fallback_to_cpu => {
                log::warn!("GPU initialization failed: {}. Falling back to CPU", e);
                let cpu_adapter = instance
                    .request_adapter(&wgpu::RequestAdapterOptions {
                        force_fallback_adapter: true,
                        ..Default::default()
                    })
                    .await
                    .expect("Failed to create CPU fallback");
                cpu_adapter
                    .request_device(&wgpu::DeviceDescriptor::default(), None)
                    .await
                    .expect("CPU fallback failed")
            }
            Err(e) => panic!("GPU initialization failed: {}", e),
        };

        // 2) Create the shader
        let variance_source = include_str!("variance.wgsl");
        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Variance shader"),
            source: wgpu::ShaderSource::Wgsl(variance_source.into()),
        });

        // 3) Create bind group layout, pipeline layout, and pipeline
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Variance BGL"),
            entries: &[
                // 0 => predictions
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // 1 => variance_out
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // 2 => params
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Variance Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Variance Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader_module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        Self {
            config: config.clone(),
            instance,
            adapter,
            device,
            queue,
            pipeline,
            bind_group_layout,
            pipeline_layout,
            shader_module,
        }
    }

    /// Population variance over the member axis of a flattened
    /// (members, positions) stack. Returns one value per position.
    pub fn ensemble_variance(
        &self,
        values: &[f32],
        members: usize,
        positions: usize,
        threshold: Option<f32>,
    ) -> Vec<f32> {
        assert_eq!(values.len(), members * positions);
        if positions == 0 {
            return Vec::new();
        }

        // 1) Upload the stack
        let predictions_buf = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("predictions_buf"),
                contents: bytemuck::cast_slice(values),
                usage: wgpu::BufferUsages::STORAGE,
            });

        // 2) Output + staging buffers, one f32 per position
        let out_size_bytes = (positions * std::mem::size_of::<f32>()) as u64;
        let out_buf = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Variance Out Buffer"),
            size: out_size_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging_buf = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Variance Staging Buffer"),
            size: out_size_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        // 3) Uniform params
        let params_data = VarianceParams {
            members: members as u32,
            positions: positions as u32,
            threshold: threshold.unwrap_or(0.0),
            apply_threshold: threshold.is_some() as u32,
        };
        let params_buf = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Params Buf"),
                contents: bytemuck::bytes_of(&params_data),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });

        // 4) Bind group for this run
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            layout: &self.bind_group_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::Buffer(predictions_buf.as_entire_buffer_binding()),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::Buffer(out_buf.as_entire_buffer_binding()),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: BindingResource::Buffer(params_buf.as_entire_buffer_binding()),
                },
            ],
            label: Some("Variance Bind Group"),
        });

        // 5) Dispatch, one invocation per position
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("Variance Encoder"),
            });

        {
            let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                label: Some("Variance Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let group_x = (positions as u32 + 63) / 64;
            pass.dispatch_workgroups(group_x.max(1), 1, 1);
        }

        // 6) Copy to staging and wait for the GPU
        encoder.copy_buffer_to_buffer(&out_buf, 0, &staging_buf, 0, out_size_bytes);
        self.queue.submit(Some(encoder.finish()));
        self.device.poll(wgpu::Maintain::Wait);

        // 7) Map + read
        let slice = staging_buf.slice(0..out_size_bytes);
        slice.map_async(wgpu::MapMode::Read, |_| {});
        self.device.poll(wgpu::Maintain::Wait);

        let data = slice.get_mapped_range();
        let variances: &[f32] = bytemuck::cast_slice(&data);

        let mut result_vec = vec![0f32; positions];
        result_vec.copy_from_slice(variances);

        drop(data);
        staging_buf.unmap();

        result_vec
    }
}
