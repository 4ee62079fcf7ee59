//! Sharded-state gather/scatter around checkpoint boundaries.
//!
//! Optimizer state is sharded exactly like gradients. Persisting it means
//! concatenating every participant's shard into one contiguous record on
//! every process; restoring means slicing an identical full record back
//! into per-device shards. Byte ranges mirror the shard math exactly, so
//! gather-then-scatter reproduces each device's bytes bit-for-bit.

use crate::coord::Coordinator;
use crate::device::ElementType;
use crate::error::{GradsyncError, Result};
use crate::rank::RankMapper;
use std::sync::Arc;

/// A length-prefixed, byte-bearing state record: tag, element type,
/// payload. Produced by device-local getters and consumed by device-local
/// setters during checkpoint gather/scatter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub tag: String,
    pub element_type: ElementType,
    pub bytes: Vec<u8>,
}

impl StateRecord {
    pub fn new(tag: impl Into<String>, element_type: ElementType, bytes: Vec<u8>) -> Self {
        Self {
            tag: tag.into(),
            element_type,
            bytes,
        }
    }

    /// Concatenate another record's payload onto this one. Element types
    /// must match; the tag of `self` is kept.
    pub fn append(&mut self, other: &StateRecord) -> Result<()> {
        if self.element_type != other.element_type {
            return Err(GradsyncError::Config(format!(
                "cannot append state record '{}' ({:?}) onto '{}' ({:?})",
                other.tag, other.element_type, self.tag, self.element_type
            )));
        }
        self.bytes.extend_from_slice(&other.bytes);
        Ok(())
    }

    /// Wire form used when a record crosses processes:
    /// `[type: u8][tag len: u64][tag][payload len: u64][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 8 + self.tag.len() + 8 + self.bytes.len());
        out.push(match self.element_type {
            ElementType::F32 => 0u8,
            ElementType::F16 => 1u8,
        });
        out.extend_from_slice(&(self.tag.len() as u64).to_le_bytes());
        out.extend_from_slice(self.tag.as_bytes());
        out.extend_from_slice(&(self.bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.bytes);
        out
    }

    pub fn decode(wire: &[u8]) -> Result<Self> {
        let bad = || GradsyncError::Coordination("malformed state record".into());
        let mut pos = 0usize;

        let take = |pos: &mut usize, n: usize| -> Result<std::ops::Range<usize>> {
            let start = *pos;
            let end = start.checked_add(n).ok_or_else(bad)?;
            if end > wire.len() {
                return Err(bad());
            }
            *pos = end;
            Ok(start..end)
        };
        let take_u64 = |pos: &mut usize| -> Result<u64> {
            let r = take(pos, 8)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&wire[r]);
            Ok(u64::from_le_bytes(buf))
        };

        let element_type = match wire.get(pos).ok_or_else(bad)? {
            0 => ElementType::F32,
            1 => ElementType::F16,
            _ => return Err(bad()),
        };
        pos += 1;

        let tag_len = take_u64(&mut pos)? as usize;
        let tag_range = take(&mut pos, tag_len)?;
        let tag = String::from_utf8(wire[tag_range].to_vec()).map_err(|_| bad())?;

        let payload_len = take_u64(&mut pos)? as usize;
        let payload_range = take(&mut pos, payload_len)?;

        Ok(Self {
            tag,
            element_type,
            bytes: wire[payload_range].to_vec(),
        })
    }
}

/// Per-device setter invoked by [`StateAggregator::scatter`] with the byte
/// slice owned by that device.
pub type ScatterSetFn<'a> = dyn Fn(usize, &[u8]) -> Result<()> + 'a;

/// Per-device getter invoked by [`StateAggregator::gather`].
pub type GatherGetFn<'a> = dyn Fn(usize) -> Result<StateRecord> + 'a;

/// Gathers sharded state into one contiguous record (across devices and
/// processes) and scatters a contiguous record back into per-device shards.
pub struct StateAggregator {
    num_local_devices: usize,
    mapper: RankMapper,
    coordinator: Option<Arc<dyn Coordinator>>,
}

impl StateAggregator {
    pub fn new(num_local_devices: usize, coordinator: Option<Arc<dyn Coordinator>>) -> Self {
        let mapper = RankMapper::new(num_local_devices, coordinator.clone());
        Self {
            num_local_devices,
            mapper,
            coordinator,
        }
    }

    /// Slice a full record (assumed identical on every process) into
    /// per-device byte shards. No cross-process transfer is needed: each
    /// process only slices out the ranges of its own local devices.
    pub fn scatter(&self, data: &StateRecord, set_fn: &ScatterSetFn<'_>) -> Result<()> {
        let total = data.bytes.len();
        for local_device in 0..self.num_local_devices {
            let range = self.mapper.local_shard_range(local_device, total)?;
            set_fn(local_device, &data.bytes[range])?;
        }
        Ok(())
    }

    /// Concatenate every device's record in global rank order, ending with
    /// the identical full record on every process.
    ///
    /// Local devices concatenate first (they occupy consecutive global
    /// ranks); across processes, each rank's local concatenation is pushed
    /// to all via broadcast and appended in rank order.
    pub fn gather(&self, get_fn: &GatherGetFn<'_>) -> Result<StateRecord> {
        let mut local = get_fn(0)?;
        for local_device in 1..self.num_local_devices {
            local.append(&get_fn(local_device)?)?;
        }

        let Some(coordinator) = self.coordinator.as_ref().filter(|c| c.num_processes() > 1) else {
            return Ok(local);
        };

        let my_rank = coordinator.my_rank();
        let mut full: Option<StateRecord> = None;
        for rank in 0..coordinator.num_processes() {
            let mut wire = if rank == my_rank { local.encode() } else { Vec::new() };
            coordinator.broadcast_bytes(&mut wire, rank)?;
            let piece = StateRecord::decode(&wire)?;
            match full.as_mut() {
                None => full = Some(piece),
                Some(f) => f.append(&piece)?,
            }
        }
        full.ok_or_else(|| GradsyncError::Coordination("gather over empty process group".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_wire_roundtrip() {
        let record = StateRecord::new("adam.m", ElementType::F32, vec![1, 2, 3, 4, 5]);
        let decoded = StateRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn decode_rejects_truncated_wire() {
        let wire = StateRecord::new("t", ElementType::F32, vec![0; 16]).encode();
        assert!(StateRecord::decode(&wire[..wire.len() - 1]).is_err());
        assert!(StateRecord::decode(&[]).is_err());
    }

    #[test]
    fn append_requires_matching_element_type() {
        let mut a = StateRecord::new("a", ElementType::F32, vec![1, 2]);
        let b = StateRecord::new("b", ElementType::F16, vec![3]);
        assert!(a.append(&b).is_err());

        let c = StateRecord::new("c", ElementType::F32, vec![3, 4]);
        a.append(&c).unwrap();
        assert_eq!(a.bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn single_process_gather_then_scatter_roundtrips() {
        let aggregator = StateAggregator::new(4, None);

        let originals: Vec<Vec<u8>> = (0..4u8).map(|d| vec![d * 10; 8]).collect();
        let full = aggregator
            .gather(&|d| Ok(StateRecord::new("opt", ElementType::F32, originals[d].clone())))
            .unwrap();
        assert_eq!(full.bytes.len(), 32);

        let seen = std::sync::Mutex::new(vec![Vec::new(); 4]);
        aggregator
            .scatter(&full, &|d, bytes| {
                seen.lock().unwrap()[d] = bytes.to_vec();
                Ok(())
            })
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), originals);
    }
}
