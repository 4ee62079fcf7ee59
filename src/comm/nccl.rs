//! NCCL collective backend over CUDA devices.
//!
//! One NCCL communicator handle and one CUDA stream per local device. The
//! participant set agrees on a shared 128-byte setup id generated by global
//! rank 0 and distributed through the process coordinator's broadcast
//! before any communicator handle is created; handle creation for all
//! local devices is itself issued inside one NCCL group.
//!
//! Collective launches are asynchronous on the per-device streams; the
//! communicator calls [`NcclBackend::synchronize`] after closing the group.

use super::{CollectiveBackend, ReduceOp, ShardSlice};
use crate::coord::Coordinator;
use crate::device::{DeviceContext, DeviceKind, ElementType, FlatBuffer};
use crate::error::{GradsyncError, Result};

use cudarc::driver::{CudaDevice as CudarcDevice, CudaSlice, CudaStream};
use cudarc::nccl::safe::Id;
use cudarc::nccl::sys;

use std::any::Any;
use std::ffi::c_void;
use std::ops::Range;
use std::sync::{Arc, Mutex};

const NCCL_UNIQUE_ID_BYTES: usize = 128;

fn check(code: sys::ncclResult_t, what: &str) -> Result<()> {
    if code != sys::ncclResult_t::ncclSuccess {
        return Err(GradsyncError::Backend(format!("{what} failed: {code:?}")));
    }
    Ok(())
}

fn driver_err(what: &str, e: impl std::fmt::Display) -> GradsyncError {
    GradsyncError::Backend(format!("{what}: {e}"))
}

fn nccl_dtype(element_type: ElementType) -> sys::ncclDataType_t {
    match element_type {
        ElementType::F32 => sys::ncclDataType_t::ncclFloat32,
        ElementType::F16 => sys::ncclDataType_t::ncclFloat16,
    }
}

fn element_bytes(element_type: ElementType) -> usize {
    match element_type {
        ElementType::F32 => 4,
        ElementType::F16 => 2,
    }
}

/// Scoped NCCL group region. Closing returns the `ncclGroupEnd` result;
/// if an error path unwinds before `close`, `Drop` still ends the group
/// (best-effort, result discarded) so the backend never leaks an open group.
struct GroupGuard {
    open: bool,
}

impl GroupGuard {
    fn open() -> Result<Self> {
        check(unsafe { sys::ncclGroupStart() }, "ncclGroupStart")?;
        Ok(Self { open: true })
    }

    fn close(mut self) -> Result<()> {
        self.open = false;
        check(unsafe { sys::ncclGroupEnd() }, "ncclGroupEnd")
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.open {
            unsafe {
                sys::ncclGroupEnd();
            }
        }
    }
}

/// Scoped signal block restoring the previous mask on drop.
///
/// NCCL's shared-memory allocation during communicator setup does not
/// handle EINTR; a SIGPROF arriving mid-allocation fails initialization.
/// Masking the signal for the duration of handle creation only avoids the
/// hazard. Blocked on both the calling thread and the process, matching
/// the environments where the failure was observed.
#[cfg(unix)]
struct BlockedSignal {
    mask_fn: unsafe extern "C" fn(libc::c_int, *const libc::sigset_t, *mut libc::sigset_t) -> libc::c_int,
    old: libc::sigset_t,
}

#[cfg(unix)]
impl BlockedSignal {
    fn new(
        signal: libc::c_int,
        mask_fn: unsafe extern "C" fn(libc::c_int, *const libc::sigset_t, *mut libc::sigset_t) -> libc::c_int,
    ) -> Self {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, signal);
            let mut old: libc::sigset_t = std::mem::zeroed();
            mask_fn(libc::SIG_BLOCK, &set, &mut old);
            Self { mask_fn, old }
        }
    }
}

#[cfg(unix)]
impl Drop for BlockedSignal {
    fn drop(&mut self) {
        unsafe {
            (self.mask_fn)(libc::SIG_SETMASK, &self.old, std::ptr::null_mut());
        }
    }
}

/// CUDA device-memory f32 buffer.
pub struct CudaBuffer {
    device: Arc<CudarcDevice>,
    slice: Mutex<CudaSlice<f32>>,
    len: usize,
}

impl CudaBuffer {
    pub fn zeros(device: Arc<CudarcDevice>, len: usize) -> Result<Self> {
        let slice = device
            .alloc_zeros::<f32>(len)
            .map_err(|e| driver_err("cuda alloc", e))?;
        Ok(Self {
            device,
            slice: Mutex::new(slice),
            len,
        })
    }

    /// Base device pointer. The caller must not touch the buffer through
    /// any other path while an asynchronous collective is in flight on it.
    fn device_ptr(&self) -> u64 {
        use cudarc::driver::DevicePtr;
        let slice = self.slice.lock().expect("cuda buffer poisoned");
        *slice.device_ptr()
    }
}

impl FlatBuffer for CudaBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn element_type(&self) -> ElementType {
        ElementType::F32
    }

    fn copy_to_host(&self, range: Range<usize>, out: &mut [f32]) -> Result<()> {
        let slice = self.slice.lock().expect("cuda buffer poisoned");
        let view = slice.slice(range);
        self.device
            .dtoh_sync_copy_into(&view, out)
            .map_err(|e| driver_err("cuda dtoh copy", e))
    }

    fn copy_from_host(&self, range: Range<usize>, src: &[f32]) -> Result<()> {
        let mut slice = self.slice.lock().expect("cuda buffer poisoned");
        let mut view = slice.slice_mut(range);
        self.device
            .htod_sync_copy_into(src, &mut view)
            .map_err(|e| driver_err("cuda htod copy", e))
    }

    fn fill(&self, range: Range<usize>, value: f32) -> Result<()> {
        let host = vec![value; range.len()];
        self.copy_from_host(range, &host)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// CUDA device context: one device ordinal, its default compute stream,
/// and the gradient/parameter buffers living on it.
pub struct CudaDeviceContext {
    ordinal: usize,
    device: Arc<CudarcDevice>,
    grads: CudaBuffer,
    params: CudaBuffer,
}

impl CudaDeviceContext {
    pub fn new(ordinal: usize, len: usize) -> Result<Self> {
        let device = CudarcDevice::new(ordinal).map_err(|e| driver_err("cuda device open", e))?;
        let grads = CudaBuffer::zeros(device.clone(), len)?;
        let params = CudaBuffer::zeros(device.clone(), len)?;
        Ok(Self {
            ordinal,
            device,
            grads,
            params,
        })
    }

    pub fn cuda_device(&self) -> &Arc<CudarcDevice> {
        &self.device
    }
}

impl DeviceContext for CudaDeviceContext {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Gpu
    }

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn set_active(&self) -> Result<()> {
        self.device
            .bind_to_thread()
            .map_err(|e| driver_err("cuda bind_to_thread", e))
    }

    fn synchronize_stream(&self) -> Result<()> {
        self.device
            .synchronize()
            .map_err(|e| driver_err("cuda synchronize", e))
    }

    fn grads(&self) -> &dyn FlatBuffer {
        &self.grads
    }

    fn params(&self) -> &dyn FlatBuffer {
        &self.params
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn cuda_base_ptr(buf: &dyn FlatBuffer) -> Result<(u64, ElementType)> {
    match buf.as_any().downcast_ref::<CudaBuffer>() {
        Some(cuda) => Ok((cuda.device_ptr(), cuda.element_type())),
        None => Err(GradsyncError::Config(
            "NCCL backend requires CUDA device buffers".into(),
        )),
    }
}

/// NCCL-backed collective implementation.
///
/// Owns one communicator handle and one stream per local device; both are
/// torn down unconditionally on drop, best-effort.
pub struct NcclBackend {
    devices: Vec<Arc<CudarcDevice>>,
    comms: Vec<sys::ncclComm_t>,
    streams: Vec<CudaStream>,
}

// The raw ncclComm_t handles prevent the auto-derive. Each handle is only
// ever driven from the orchestrating thread holding &self, and NCCL
// serializes per-communicator access internally.
unsafe impl Send for NcclBackend {}
unsafe impl Sync for NcclBackend {}

impl NcclBackend {
    /// Collective constructor: every participant must call this with the
    /// same topology. `total_ranks` and `global_rank_of` come from the
    /// caller's rank mapping; `coordinator` distributes the setup id when
    /// more than one process participates.
    pub fn new(
        device_contexts: &[Arc<dyn DeviceContext>],
        total_ranks: usize,
        global_ranks: &[usize],
        coordinator: Option<&Arc<dyn Coordinator>>,
    ) -> Result<Self> {
        let mut devices = Vec::with_capacity(device_contexts.len());
        for ctx in device_contexts {
            if ctx.kind() != DeviceKind::Gpu {
                return Err(GradsyncError::Config(format!(
                    "NCCL backend can only be used with GPUs; device {} is not one",
                    ctx.ordinal()
                )));
            }
            let cuda = ctx
                .as_any()
                .downcast_ref::<CudaDeviceContext>()
                .ok_or_else(|| {
                    GradsyncError::Config(format!(
                        "NCCL backend requires CUDA device contexts; device {} is not one",
                        ctx.ordinal()
                    ))
                })?;
            devices.push(cuda.cuda_device().clone());
        }

        let mut streams = Vec::with_capacity(devices.len());
        for device in &devices {
            device
                .bind_to_thread()
                .map_err(|e| driver_err("cuda bind_to_thread", e))?;
            streams.push(
                device
                    .fork_default_stream()
                    .map_err(|e| driver_err("cuda stream create", e))?,
            );
        }

        // Global rank 0 generates the setup id; everyone else receives it
        // over the coordinator before any communicator handle exists.
        let mut id_bytes = vec![0u8; NCCL_UNIQUE_ID_BYTES];
        if coordinator.map_or(true, |c| c.my_rank() == 0) {
            let id = Id::new().map_err(|e| GradsyncError::Backend(format!("ncclGetUniqueId failed: {e:?}")))?;
            for (dst, src) in id_bytes.iter_mut().zip(id.internal()) {
                *dst = *src as u8;
            }
        }
        if let Some(c) = coordinator {
            c.broadcast_bytes(&mut id_bytes, 0)?;
        }
        let mut internal = [0 as core::ffi::c_char; NCCL_UNIQUE_ID_BYTES];
        for (dst, src) in internal.iter_mut().zip(&id_bytes) {
            *dst = *src as core::ffi::c_char;
        }
        let unique_id = sys::ncclUniqueId { internal };

        // NCCL setup does not survive EINTR during shared-memory
        // allocation; keep SIGPROF masked until every handle exists.
        #[cfg(unix)]
        let _block_thread = BlockedSignal::new(libc::SIGPROF, libc::pthread_sigmask);
        #[cfg(unix)]
        let _block_proc = BlockedSignal::new(libc::SIGPROF, libc::sigprocmask);

        let mut comms: Vec<sys::ncclComm_t> = vec![std::ptr::null_mut(); devices.len()];
        let guard = GroupGuard::open()?;
        for (i, device) in devices.iter().enumerate() {
            device
                .bind_to_thread()
                .map_err(|e| driver_err("cuda bind_to_thread", e))?;
            check(
                unsafe {
                    sys::ncclCommInitRank(
                        &mut comms[i],
                        total_ranks as i32,
                        unique_id,
                        global_ranks[i] as i32,
                    )
                },
                "ncclCommInitRank",
            )?;
        }
        guard.close()?;

        tracing::info!(
            local_devices = devices.len(),
            total_ranks,
            "NCCL backend constructed"
        );

        Ok(Self {
            devices,
            comms,
            streams,
        })
    }

    // cudarc::driver::sys::CUstream and cudarc::nccl::sys::cudaStream_t are
    // the same underlying CUDA type (*mut CUstream_st); the cast happens at
    // the call site.
    fn stream_raw(&self, i: usize) -> cudarc::driver::sys::CUstream {
        self.streams[i].stream
    }
}

impl Drop for NcclBackend {
    fn drop(&mut self) {
        for (i, device) in self.devices.iter().enumerate() {
            let _ = device.bind_to_thread();
            unsafe {
                sys::ncclCommDestroy(self.comms[i]);
            }
        }
    }
}

impl CollectiveBackend for NcclBackend {
    fn reduce_scatter(
        &self,
        send: &[&dyn FlatBuffer],
        recv: &[ShardSlice<'_>],
        shard_elems: usize,
        op: ReduceOp,
    ) -> Result<()> {
        let ReduceOp::Sum = op;
        let guard = GroupGuard::open()?;
        for (i, slice) in recv.iter().enumerate() {
            if slice.range.len() != shard_elems {
                return Err(GradsyncError::Config(format!(
                    "shard slice of {} elements does not match shard size {shard_elems}",
                    slice.range.len()
                )));
            }
            self.devices[i]
                .bind_to_thread()
                .map_err(|e| driver_err("cuda bind_to_thread", e))?;

            let (send_ptr, element_type) = cuda_base_ptr(send[i])?;
            let (recv_base, _) = cuda_base_ptr(slice.buffer)?;
            let recv_ptr = recv_base + (slice.range.start * element_bytes(element_type)) as u64;

            check(
                unsafe {
                    sys::ncclReduceScatter(
                        send_ptr as *const c_void,
                        recv_ptr as *mut c_void,
                        shard_elems,
                        nccl_dtype(element_type),
                        sys::ncclRedOp_t::ncclSum,
                        self.comms[i],
                        self.stream_raw(i).cast(),
                    )
                },
                "ncclReduceScatter",
            )?;
        }
        guard.close()
    }

    fn all_gather(
        &self,
        send: &[ShardSlice<'_>],
        recv: &[&dyn FlatBuffer],
        shard_elems: usize,
    ) -> Result<()> {
        let guard = GroupGuard::open()?;
        for (i, slice) in send.iter().enumerate() {
            if slice.range.len() != shard_elems {
                return Err(GradsyncError::Config(format!(
                    "shard slice of {} elements does not match shard size {shard_elems}",
                    slice.range.len()
                )));
            }
            self.devices[i]
                .bind_to_thread()
                .map_err(|e| driver_err("cuda bind_to_thread", e))?;

            let (send_base, element_type) = cuda_base_ptr(slice.buffer)?;
            let send_ptr = send_base + (slice.range.start * element_bytes(element_type)) as u64;
            let (recv_ptr, _) = cuda_base_ptr(recv[i])?;

            check(
                unsafe {
                    sys::ncclAllGather(
                        send_ptr as *const c_void,
                        recv_ptr as *mut c_void,
                        shard_elems,
                        nccl_dtype(element_type),
                        self.comms[i],
                        self.stream_raw(i).cast(),
                    )
                },
                "ncclAllGather",
            )?;
        }
        guard.close()
    }

    fn synchronize(&self) -> Result<()> {
        for (device, stream) in self.devices.iter().zip(&self.streams) {
            device
                .bind_to_thread()
                .map_err(|e| driver_err("cuda bind_to_thread", e))?;
            // Collectives launch on the forked non-blocking streams; the
            // device work stream must be chained behind them before the
            // drain, or this returns while they are still in flight.
            device
                .wait_for(stream)
                .map_err(|e| driver_err("cuda stream wait", e))?;
            device
                .synchronize()
                .map_err(|e| driver_err("cuda synchronize", e))?;
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        // NCCL has no standalone barrier; draining every stream gives the
        // same local guarantee. Cross-process barriers go through the
        // coordinator.
        self.synchronize()
    }

    fn name(&self) -> &'static str {
        "nccl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;
    use std::sync::Arc;

    /// Requires a CUDA device with NCCL; skips when none is available.
    /// Results must be visible on the host once `synchronize` returns —
    /// the launches run on the forked streams, not the device work stream.
    #[test]
    fn reduce_scatter_results_visible_after_synchronize() {
        let ctx = match CudaDeviceContext::new(0, 8) {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => {
                eprintln!("skipping NCCL test: {e}");
                return;
            }
        };
        let devices: Vec<Arc<dyn DeviceContext>> = vec![ctx.clone()];
        let backend = NcclBackend::new(&devices, 1, &[0], None).unwrap();

        ctx.grads().copy_from_host(0..8, &[1.0; 8]).unwrap();
        let send: Vec<&dyn FlatBuffer> = vec![ctx.grads()];
        let recv = vec![ShardSlice {
            buffer: ctx.grads(),
            range: 0..8,
        }];
        backend.reduce_scatter(&send, &recv, 8, ReduceOp::Sum).unwrap();
        backend.synchronize().unwrap();

        let mut out = [0.0f32; 8];
        ctx.grads().copy_to_host(0..8, &mut out).unwrap();
        assert_eq!(out, [1.0; 8]);
    }
}
