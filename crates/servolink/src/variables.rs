//! Shared-memory variables.
//!
//! The definitions block is an append-only log: within a session the
//! backend only ever adds records, and published records never change. Each
//! record points at a value cell inside the live data block; those offsets
//! stay valid for the whole session, so reads go straight against shared
//! memory with no copying for scalars and a small seqlock loop for arrays.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use servolink_shm::ShmView;
use servolink_wire::variables::{VARIABLE_DEF_COUNT_OFFSET, VARIABLE_DEF_RECORD_SIZE};
use servolink_wire::{
    BaseType, ValueType, VariableDataBlock, VariableDefBlock, VariableDefRecord, VariableFlags,
};

use crate::device_info::DeviceSessionId;
use crate::session::Session;

/// Cap on definitions tracked per session (32 chunks of 1024 in the
/// original storage scheme).
pub const MAX_DEFINITIONS: usize = 32 * 1024;

/// One copied definition with its resolved value pointer.
pub(crate) struct VariableDef {
    name: String,
    value_type: ValueType,
    flags: VariableFlags,
    device_session_id: DeviceSessionId,
    /// Points into the live variable data block.
    value_ptr: *const u8,
}

// SAFETY: the value pointer targets the session's variable-data mapping,
// which outlives every handle (handles hold the session alive).
unsafe impl Send for VariableDef {}
unsafe impl Sync for VariableDef {}

/// Immutable snapshot of the definition log.
pub(crate) struct DefSnapshot {
    defs: Vec<Arc<VariableDef>>,
    /// Indices sorted by (device id, name) for binary search.
    search: Vec<u32>,
}

impl DefSnapshot {
    fn empty() -> DefSnapshot {
        DefSnapshot {
            defs: Vec::new(),
            search: Vec::new(),
        }
    }

    fn search_key(&self, idx: u32) -> (u16, &str) {
        let def = &self.defs[idx as usize];
        (def.device_session_id.0, def.name.as_str())
    }
}

struct Geometry {
    defs_start: usize,
    record_size: usize,
    max_defs: usize,
    values_start: usize,
    values_len: usize,
}

/// Owner of the two variable blocks and the growing definition log.
pub(crate) struct VariableStore {
    defs_view: ShmView,
    data_view: ShmView,
    geometry: Option<Geometry>,
    state: RwLock<StoreState>,
}

struct StoreState {
    snapshot: Arc<DefSnapshot>,
    /// Records consumed from the shared log, including skipped ones.
    processed: u32,
}

impl VariableStore {
    pub fn new(defs_view: ShmView, data_view: ShmView) -> Self {
        let geometry = Self::resolve_geometry(&defs_view, &data_view);
        if geometry.is_none() {
            tracing::warn!("variable block headers failed validation, variables unavailable");
        }
        let store = Self {
            defs_view,
            data_view,
            geometry,
            state: RwLock::new(StoreState {
                snapshot: Arc::new(DefSnapshot::empty()),
                processed: 0,
            }),
        };
        store.refresh();
        store
    }

    fn resolve_geometry(defs_view: &ShmView, data_view: &ShmView) -> Option<Geometry> {
        let mut defs_head = [0u8; 32];
        let mut data_head = [0u8; 24];
        if defs_view.len() < defs_head.len() || data_view.len() < data_head.len() {
            return None;
        }
        // SAFETY: both views are live mappings at least as long as the
        // copied prefixes.
        unsafe {
            std::ptr::copy_nonoverlapping(defs_view.as_ptr(), defs_head.as_mut_ptr(), defs_head.len());
            std::ptr::copy_nonoverlapping(data_view.as_ptr(), data_head.as_mut_ptr(), data_head.len());
        }
        let defs = VariableDefBlock::parse(&defs_head)?;
        let data = VariableDataBlock::parse(&data_head)?;

        let defs_start = defs.definition_offset as usize;
        let record_size = defs.definition_data_size as usize;
        let values_start = data.var_data_offset as usize;
        if defs_start >= defs_view.len()
            || values_start >= data_view.len()
            || record_size < VARIABLE_DEF_RECORD_SIZE
        {
            return None;
        }

        Some(Geometry {
            defs_start,
            record_size,
            max_defs: (defs_view.len() - defs_start) / record_size,
            values_start,
            values_len: data_view.len() - values_start,
        })
    }

    /// Pull any new definitions out of the shared log. Returns true when
    /// the set grew.
    pub fn refresh(&self) -> bool {
        let Some(geometry) = &self.geometry else {
            return false;
        };

        // The count is published after the records it covers; the fence
        // pairs with the writer's release.
        let live_count = unsafe {
            (*(self.defs_view.as_ptr().add(VARIABLE_DEF_COUNT_OFFSET) as *const AtomicU32))
                .load(Ordering::Relaxed)
        };
        fence(Ordering::Acquire);
        let live_count =
            (live_count as usize).min(geometry.max_defs).min(MAX_DEFINITIONS) as u32;

        let mut state = self.state.write();
        if state.processed >= live_count {
            return false;
        }

        let mut snapshot = DefSnapshot {
            defs: state.snapshot.defs.clone(),
            search: state.snapshot.search.clone(),
        };

        for i in state.processed..live_count {
            let mut record = [0u8; VARIABLE_DEF_RECORD_SIZE];
            // SAFETY: i < max_defs keeps the record inside the mapping.
            unsafe {
                let src = self
                    .defs_view
                    .as_ptr()
                    .add(geometry.defs_start + geometry.record_size * i as usize);
                std::ptr::copy_nonoverlapping(src, record.as_mut_ptr(), record.len());
            }
            let Some(record) = VariableDefRecord::parse(&record) else {
                tracing::debug!(index = i, "skipping malformed variable definition");
                continue;
            };

            let value_size = record.value_type.value_byte_size() as u64;
            if value_size == 0
                || record.value_offset as u64 + value_size > geometry.values_len as u64
            {
                tracing::debug!(
                    name = %record.name,
                    "skipping variable definition with out-of-bounds value"
                );
                continue;
            }

            let def = Arc::new(VariableDef {
                name: record.name,
                value_type: record.value_type,
                flags: record.flags,
                device_session_id: DeviceSessionId(record.device_session_id),
                // SAFETY: bounds were checked against the data mapping.
                value_ptr: unsafe {
                    self.data_view
                        .as_ptr()
                        .add(geometry.values_start + record.value_offset as usize)
                },
            });

            let idx = snapshot.defs.len() as u32;
            snapshot.defs.push(def);
            let at = snapshot
                .search
                .partition_point(|&other| snapshot.search_key(other) < snapshot.search_key(idx));
            snapshot.search.insert(at, idx);
        }

        state.processed = live_count;
        state.snapshot = Arc::new(snapshot);
        true
    }

    pub fn snapshot(&self) -> Arc<DefSnapshot> {
        Arc::clone(&self.state.read().snapshot)
    }
}

/// A point-in-time view of the definitions, bound to its session.
///
/// The set it exposes never changes; call [`Session::variables`] again
/// after a `VariableDefinitionsChanged` event to see new entries. Handles
/// keep the session (and with it the value mapping) alive.
#[derive(Clone)]
pub struct VariableDefinitions {
    snapshot: Arc<DefSnapshot>,
    session: Arc<Session>,
}

impl VariableDefinitions {
    pub(crate) fn new(snapshot: Arc<DefSnapshot>, session: Arc<Session>) -> Self {
        Self { snapshot, session }
    }

    pub fn len(&self) -> usize {
        self.snapshot.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.defs.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<Variable> {
        if idx >= self.snapshot.defs.len() {
            return None;
        }
        Some(Variable {
            snapshot: Arc::clone(&self.snapshot),
            _session: Arc::clone(&self.session),
            idx,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Variable> + '_ {
        (0..self.len()).map(move |idx| self.get(idx).unwrap())
    }

    /// Find a variable by name within a device scope.
    pub fn find(&self, name: &str, device: DeviceSessionId) -> Option<Variable> {
        let start = self
            .snapshot
            .search
            .partition_point(|&i| self.snapshot.search_key(i) < (device.0, name));
        for &i in &self.snapshot.search[start..] {
            if self.snapshot.search_key(i) != (device.0, name) {
                break;
            }
            return self.get(i as usize);
        }
        None
    }

    /// Find a variable by name and exact type within a device scope.
    pub fn find_typed(
        &self,
        name: &str,
        value_type: ValueType,
        device: DeviceSessionId,
    ) -> Option<Variable> {
        let start = self
            .snapshot
            .search
            .partition_point(|&i| self.snapshot.search_key(i) < (device.0, name));
        for &i in &self.snapshot.search[start..] {
            if self.snapshot.search_key(i) != (device.0, name) {
                break;
            }
            if self.snapshot.defs[i as usize].value_type == value_type {
                return self.get(i as usize);
            }
        }
        None
    }
}

/// One variable: its definition plus live value access.
#[derive(Clone)]
pub struct Variable {
    snapshot: Arc<DefSnapshot>,
    _session: Arc<Session>,
    idx: usize,
}

impl Variable {
    fn def(&self) -> &VariableDef {
        &self.snapshot.defs[self.idx]
    }

    pub fn name(&self) -> &str {
        &self.def().name
    }

    pub fn value_type(&self) -> ValueType {
        self.def().value_type
    }

    pub fn flags(&self) -> VariableFlags {
        self.def().flags
    }

    pub fn device_session_id(&self) -> DeviceSessionId {
        self.def().device_session_id
    }

    fn scalar_ptr(&self, base: BaseType) -> Option<*const u8> {
        let t = self.def().value_type;
        if t.is_scalar() && t.base() == base {
            Some(self.def().value_ptr)
        } else {
            None
        }
    }

    pub fn read_bool(&self) -> Option<bool> {
        let def = self.def();
        let t = def.value_type;
        if t.is_bit() {
            // A bit view of an integer cell.
            let bit = t.bit_index();
            let raw = match t.base().byte_size() {
                1 => unsafe { load_u8(def.value_ptr) as u64 },
                2 => unsafe { load_u16(def.value_ptr) as u64 },
                4 => unsafe { load_u32(def.value_ptr) as u64 },
                8 => unsafe { load_u64(def.value_ptr) },
                _ => return None,
            };
            return Some(raw & (1u64 << bit) != 0);
        }
        let ptr = self.scalar_ptr(BaseType::Bool)?;
        Some(unsafe { load_u8(ptr) } != 0)
    }

    pub fn read_u8(&self) -> Option<u8> {
        Some(unsafe { load_u8(self.scalar_ptr(BaseType::U8)?) })
    }

    pub fn read_i8(&self) -> Option<i8> {
        Some(unsafe { load_u8(self.scalar_ptr(BaseType::I8)?) } as i8)
    }

    pub fn read_u16(&self) -> Option<u16> {
        Some(unsafe { load_u16(self.scalar_ptr(BaseType::U16)?) })
    }

    pub fn read_i16(&self) -> Option<i16> {
        Some(unsafe { load_u16(self.scalar_ptr(BaseType::I16)?) } as i16)
    }

    pub fn read_u32(&self) -> Option<u32> {
        Some(unsafe { load_u32(self.scalar_ptr(BaseType::U32)?) })
    }

    pub fn read_i32(&self) -> Option<i32> {
        Some(unsafe { load_u32(self.scalar_ptr(BaseType::I32)?) } as i32)
    }

    pub fn read_i64(&self) -> Option<i64> {
        Some(unsafe { load_u64(self.scalar_ptr(BaseType::I64)?) } as i64)
    }

    pub fn read_f32(&self) -> Option<f32> {
        Some(f32::from_bits(unsafe {
            load_u32(self.scalar_ptr(BaseType::F32)?)
        }))
    }

    pub fn read_f64(&self) -> Option<f64> {
        Some(f64::from_bits(unsafe {
            load_u64(self.scalar_ptr(BaseType::F64)?)
        }))
    }

    /// Read a cstring value. Unsynchronized raw bytes by protocol.
    pub fn read_string(&self) -> Option<String> {
        let def = self.def();
        let t = def.value_type;
        if t.base() != BaseType::CString || !t.is_array() {
            return None;
        }
        let cap = t.array_len() as usize;
        let mut bytes = vec![0u8; cap];
        // SAFETY: the cell spans `cap` bytes inside the data mapping.
        unsafe { std::ptr::copy_nonoverlapping(def.value_ptr, bytes.as_mut_ptr(), cap) };
        let nul = bytes.iter().position(|&b| b == 0).unwrap_or(cap);
        String::from_utf8(bytes[..nul].to_vec()).ok()
    }

    /// Copy an array value under its 8-byte revision counter.
    ///
    /// Returns `None` when no consistent copy could be taken within the
    /// retry budget.
    pub fn read_array_bytes(&self) -> Option<Vec<u8>> {
        let def = self.def();
        let t = def.value_type;
        if !t.is_array() || t.base() == BaseType::CString {
            return None;
        }
        let len = (t.base().byte_size() * t.array_len()) as usize;

        for _ in 0..3 {
            // SAFETY: the value cell is 8-byte aligned with the counter
            // first, elements after.
            let rev0 = unsafe { (*(def.value_ptr as *const AtomicU64)).load(Ordering::Acquire) };
            if rev0 & 1 != 0 {
                std::thread::yield_now();
                continue;
            }
            let mut out = vec![0u8; len];
            unsafe {
                std::ptr::copy_nonoverlapping(def.value_ptr.add(8), out.as_mut_ptr(), len);
            }
            fence(Ordering::Acquire);
            let rev1 = unsafe { (*(def.value_ptr as *const AtomicU64)).load(Ordering::Relaxed) };
            if rev0 == rev1 {
                return Some(out);
            }
            std::thread::yield_now();
        }
        None
    }

    /// Copy an f32 array value.
    pub fn read_array_f32(&self) -> Option<Vec<f32>> {
        if self.def().value_type.base() != BaseType::F32 {
            return None;
        }
        let bytes = self.read_array_bytes()?;
        Some(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

unsafe fn load_u8(ptr: *const u8) -> u8 {
    std::ptr::read_volatile(ptr)
}

unsafe fn load_u16(ptr: *const u8) -> u16 {
    std::ptr::read_volatile(ptr as *const u16)
}

unsafe fn load_u32(ptr: *const u8) -> u32 {
    (*(ptr as *const AtomicU32)).load(Ordering::Relaxed)
}

unsafe fn load_u64(ptr: *const u8) -> u64 {
    (*(ptr as *const AtomicU64)).load(Ordering::Relaxed)
}
