//! NVML partition backend
//!
//! MIG management is not wrapped by `nvml-wrapper`, so the raw entry points are
//! called through the loaded library. Native handles are the NVML instance
//! pointers stored as integers.

use migslice_core::{MigError, MigResult, ProfileId};
use nvml_wrapper::error::{nvml_try, NvmlError};
use nvml_wrapper::Nvml;
use nvml_wrapper_sys::bindings::{
    nvmlComputeInstanceInfo_t, nvmlComputeInstance_t, nvmlDevice_t, nvmlGpuInstanceInfo_t,
    nvmlGpuInstance_t, nvmlReturn_enum_NVML_ERROR_INSUFFICIENT_RESOURCES, nvmlReturn_t,
};
use std::ffi::CStr;
use std::mem::MaybeUninit;
use std::os::raw::c_char;
use tracing::debug;

use crate::backend::{NativeHandle, PartitionBackend, PartitionIdentity, Placement};

const UUID_BUFFER_SIZE: usize = 96;

fn check(code: nvmlReturn_t, call: &str) -> MigResult<()> {
    if code == nvmlReturn_enum_NVML_ERROR_INSUFFICIENT_RESOURCES {
        return Err(MigError::ResourceExhausted(format!(
            "{} failed: insufficient resources",
            call
        )));
    }
    nvml_try(code).map_err(|e| MigError::Native(format!("{} failed: {}", call, e)))
}

fn native(call: &str) -> impl FnOnce(NvmlError) -> MigError + '_ {
    move |e| MigError::Native(format!("{} failed: {}", call, e))
}

fn gpu_instance(handle: NativeHandle) -> nvmlGpuInstance_t {
    handle.raw() as usize as nvmlGpuInstance_t
}

fn compute_instance(handle: NativeHandle) -> nvmlComputeInstance_t {
    handle.raw() as usize as nvmlComputeInstance_t
}

/// Partition backend talking to the NVIDIA Management Library
pub struct NvmlBackend {
    nvml: Nvml,
}

impl NvmlBackend {
    /// Initialize NVML
    pub fn init() -> MigResult<Self> {
        let nvml = Nvml::init().map_err(native("nvmlInit"))?;
        debug!("NVML initialized");
        Ok(Self { nvml })
    }

    fn device_handle(&self, device: u32) -> MigResult<nvmlDevice_t> {
        let dev = self.nvml.device_by_index(device).map_err(|e| match e {
            NvmlError::InvalidArg | NvmlError::NotFound => MigError::DeviceNotFound(device),
            other => MigError::Native(format!("nvmlDeviceGetHandleByIndex failed: {}", other)),
        })?;
        // SAFETY: the handle stays valid for as long as `self.nvml` is initialized
        Ok(unsafe { dev.handle() })
    }

    fn gpu_instance_info(&self, instance: nvmlGpuInstance_t) -> MigResult<nvmlGpuInstanceInfo_t> {
        let mut info = MaybeUninit::<nvmlGpuInstanceInfo_t>::zeroed();
        // SAFETY: `instance` came from nvmlDeviceCreateGpuInstance and `info` is writable
        unsafe {
            check(
                self.nvml.lib().nvmlGpuInstanceGetInfo(instance, info.as_mut_ptr()),
                "nvmlGpuInstanceGetInfo",
            )?;
            Ok(info.assume_init())
        }
    }

    fn raw_device_uuid(&self, device: nvmlDevice_t) -> MigResult<String> {
        let mut buf = [0 as c_char; UUID_BUFFER_SIZE];
        // SAFETY: the buffer length is passed alongside the pointer
        unsafe {
            check(
                self.nvml
                    .lib()
                    .nvmlDeviceGetUUID(device, buf.as_mut_ptr(), UUID_BUFFER_SIZE as u32),
                "nvmlDeviceGetUUID",
            )?;
            Ok(CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned())
        }
    }
}

impl PartitionBackend for NvmlBackend {
    fn device_count(&self) -> MigResult<u32> {
        self.nvml.device_count().map_err(native("nvmlDeviceGetCount"))
    }

    fn device_uuid(&self, device: u32) -> MigResult<String> {
        let handle = self.device_handle(device)?;
        self.raw_device_uuid(handle)
    }

    fn create_device_partition(&self, device: u32, profile: ProfileId) -> MigResult<NativeHandle> {
        let dev = self.device_handle(device)?;
        let mut instance: nvmlGpuInstance_t = std::ptr::null_mut();
        // SAFETY: `dev` is a live device handle and `instance` is writable
        unsafe {
            check(
                self.nvml
                    .lib()
                    .nvmlDeviceCreateGpuInstance(dev, profile.0, &mut instance),
                "nvmlDeviceCreateGpuInstance",
            )?;
        }
        Ok(NativeHandle::from_raw(instance as usize as u64))
    }

    fn destroy_device_partition(&self, handle: NativeHandle) -> MigResult<()> {
        // SAFETY: the handle was produced by create_device_partition and is destroyed once
        unsafe {
            check(
                self.nvml.lib().nvmlGpuInstanceDestroy(gpu_instance(handle)),
                "nvmlGpuInstanceDestroy",
            )
        }
    }

    fn create_compute_partition(
        &self,
        parent: NativeHandle,
        profile: ProfileId,
    ) -> MigResult<NativeHandle> {
        let mut instance: nvmlComputeInstance_t = std::ptr::null_mut();
        // SAFETY: `parent` is a live GPU instance and `instance` is writable
        unsafe {
            check(
                self.nvml.lib().nvmlGpuInstanceCreateComputeInstance(
                    gpu_instance(parent),
                    profile.0,
                    &mut instance,
                ),
                "nvmlGpuInstanceCreateComputeInstance",
            )?;
        }
        Ok(NativeHandle::from_raw(instance as usize as u64))
    }

    fn destroy_compute_partition(&self, handle: NativeHandle) -> MigResult<()> {
        // SAFETY: the handle was produced by create_compute_partition and is destroyed once
        unsafe {
            check(
                self.nvml
                    .lib()
                    .nvmlComputeInstanceDestroy(compute_instance(handle)),
                "nvmlComputeInstanceDestroy",
            )
        }
    }

    fn device_partition_capacity(&self, device: u32, profile: ProfileId) -> MigResult<u32> {
        let dev = self.device_handle(device)?;
        let mut count = 0;
        // SAFETY: `dev` is a live device handle and `count` is writable
        unsafe {
            check(
                self.nvml
                    .lib()
                    .nvmlDeviceGetGpuInstanceRemainingCapacity(dev, profile.0, &mut count),
                "nvmlDeviceGetGpuInstanceRemainingCapacity",
            )?;
        }
        Ok(count)
    }

    fn compute_partition_capacity(
        &self,
        parent: NativeHandle,
        profile: ProfileId,
    ) -> MigResult<u32> {
        let mut count = 0;
        // SAFETY: `parent` is a live GPU instance and `count` is writable
        unsafe {
            check(
                self.nvml.lib().nvmlGpuInstanceGetComputeInstanceRemainingCapacity(
                    gpu_instance(parent),
                    profile.0,
                    &mut count,
                ),
                "nvmlGpuInstanceGetComputeInstanceRemainingCapacity",
            )?;
        }
        Ok(count)
    }

    fn device_partition_placement(&self, handle: NativeHandle) -> MigResult<Placement> {
        let info = self.gpu_instance_info(gpu_instance(handle))?;
        Ok(Placement {
            start: info.placement.start,
            size: info.placement.size,
        })
    }

    fn resolve_identity(&self, handle: NativeHandle) -> MigResult<PartitionIdentity> {
        let mut info = MaybeUninit::<nvmlComputeInstanceInfo_t>::zeroed();
        // SAFETY: `handle` is a live compute instance and `info` is writable
        let info = unsafe {
            check(
                self.nvml
                    .lib()
                    .nvmlComputeInstanceGetInfo_v2(compute_instance(handle), info.as_mut_ptr()),
                "nvmlComputeInstanceGetInfo",
            )?;
            info.assume_init()
        };
        let gi_info = self.gpu_instance_info(info.gpuInstance)?;

        Ok(PartitionIdentity {
            device_uuid: self.raw_device_uuid(gi_info.device)?,
            device_partition_id: gi_info.id,
            compute_partition_id: info.id,
        })
    }

    fn name(&self) -> &'static str {
        "nvml"
    }
}
