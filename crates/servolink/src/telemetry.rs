//! Telemetry definitions and update groups.
//!
//! Telemetry flows client → backend: the client registers a group of
//! telemetry ids once, then repeatedly pushes a size-packed value action.
//! Values are packed by size bucket (bools first as 32-bit words, then 8-,
//! 4-, 2- and 1-byte fields) so the wire payload is as small as the set
//! allows.

use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use servolink_shm::ShmView;
use servolink_wire::telemetry::{TELEMETRY_DEF_COUNT_OFFSET, TELEMETRY_DEF_RECORD_SIZE};
use servolink_wire::{
    ActionFlags, ActionId, BaseType, TelemetryDefBlock, TelemetryDefRecord, TelemetryFlags,
    ValueType, NO_ALIAS_VARIABLE,
};

use crate::action::{ActionBuilder, ActionResult};
use crate::error::{Error, Result};
use crate::session::Session;

/// Cap on telemetry definitions tracked per session.
pub const MAX_DEFINITIONS: usize = 8 * 1024;

/// One telemetry definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryDefinition {
    pub id: u16,
    pub name: String,
    pub value_type: ValueType,
    pub flags: TelemetryFlags,
    /// Index of the variable mirroring this telemetry, if any.
    pub alias_variable_idx: Option<u32>,
}

/// Lazily grown, append-only telemetry definition table.
pub(crate) struct TelemetrySystem {
    view: ShmView,
    geometry: Option<TelemetryGeometry>,
    state: RwLock<TelemetryState>,
}

struct TelemetryGeometry {
    defs_start: usize,
    record_size: usize,
    max_defs: usize,
}

struct TelemetryState {
    defs: Arc<Vec<TelemetryDefinition>>,
}

impl TelemetrySystem {
    pub fn new(view: ShmView) -> Self {
        let geometry = Self::resolve_geometry(&view);
        if geometry.is_none() {
            tracing::warn!("telemetry block header failed validation, telemetry unavailable");
        }
        let system = Self {
            view,
            geometry,
            state: RwLock::new(TelemetryState {
                defs: Arc::new(Vec::new()),
            }),
        };
        system.refresh();
        system
    }

    fn resolve_geometry(view: &ShmView) -> Option<TelemetryGeometry> {
        let mut head = [0u8; 32];
        if view.len() < head.len() {
            return None;
        }
        // SAFETY: the view is a live mapping at least `head` bytes long.
        unsafe { std::ptr::copy_nonoverlapping(view.as_ptr(), head.as_mut_ptr(), head.len()) };
        let block = TelemetryDefBlock::parse(&head)?;

        let defs_start = block.definition_offset as usize;
        let record_size = block.definition_data_size as usize;
        if defs_start >= view.len() || record_size < TELEMETRY_DEF_RECORD_SIZE {
            return None;
        }
        Some(TelemetryGeometry {
            defs_start,
            record_size,
            max_defs: (view.len() - defs_start) / record_size,
        })
    }

    /// Pull new definitions out of the shared table. Returns true when the
    /// set grew.
    pub fn refresh(&self) -> bool {
        let Some(geometry) = &self.geometry else {
            return false;
        };

        let live_count = unsafe {
            (*(self.view.as_ptr().add(TELEMETRY_DEF_COUNT_OFFSET) as *const AtomicU32))
                .load(Ordering::Relaxed)
        };
        fence(Ordering::Acquire);
        let live_count = (live_count as usize)
            .min(geometry.max_defs)
            .min(MAX_DEFINITIONS);

        let mut state = self.state.write();
        if state.defs.len() >= live_count {
            return false;
        }

        // Previous definitions are immutable within a session; carry them
        // over and only decode the tail.
        let mut defs = (*state.defs).clone();
        for i in defs.len()..live_count {
            let mut record = [0u8; TELEMETRY_DEF_RECORD_SIZE];
            // SAFETY: i < max_defs keeps the record inside the mapping.
            unsafe {
                let src = self
                    .view
                    .as_ptr()
                    .add(geometry.defs_start + geometry.record_size * i);
                std::ptr::copy_nonoverlapping(src, record.as_mut_ptr(), record.len());
            }
            let Some(record) = TelemetryDefRecord::parse(&record) else {
                tracing::debug!(index = i, "skipping malformed telemetry definition");
                continue;
            };
            defs.push(TelemetryDefinition {
                id: record.id,
                name: record.name,
                value_type: record.value_type,
                flags: record.flags,
                alias_variable_idx: (record.alias_variable_idx != NO_ALIAS_VARIABLE)
                    .then_some(record.alias_variable_idx),
            });
        }

        state.defs = Arc::new(defs);
        true
    }

    pub fn definitions(&self) -> Arc<Vec<TelemetryDefinition>> {
        Arc::clone(&self.state.read().defs)
    }
}

/// A point-in-time view of the telemetry definitions.
#[derive(Clone)]
pub struct TelemetryDefinitions {
    defs: Arc<Vec<TelemetryDefinition>>,
    session: Arc<Session>,
}

impl TelemetryDefinitions {
    pub(crate) fn new(defs: Arc<Vec<TelemetryDefinition>>, session: Arc<Session>) -> Self {
        Self { defs, session }
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TelemetryDefinition> {
        self.defs.iter()
    }

    pub fn find(&self, name: &str) -> Option<&TelemetryDefinition> {
        self.defs.iter().find(|d| d.name == name)
    }

    pub fn find_typed(&self, name: &str, value_type: ValueType) -> Option<&TelemetryDefinition> {
        self.defs
            .iter()
            .find(|d| d.name == name && d.value_type == value_type)
    }

    pub fn find_by_id(&self, id: u16) -> Option<&TelemetryDefinition> {
        self.defs.iter().find(|d| d.id == id)
    }
}

/// Scalars usable as telemetry values.
pub trait TelemetryScalar: Copy {
    const BASE: BaseType;
    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

macro_rules! impl_telemetry_scalar {
    ($($t:ty => $base:expr),* $(,)?) => {
        $(impl TelemetryScalar for $t {
            const BASE: BaseType = $base;
            fn to_bits(self) -> u64 {
                self as u64
            }
            fn from_bits(bits: u64) -> Self {
                bits as $t
            }
        })*
    };
}

impl_telemetry_scalar! {
    i8 => BaseType::I8,
    u8 => BaseType::U8,
    i16 => BaseType::I16,
    u16 => BaseType::U16,
    i32 => BaseType::I32,
    u32 => BaseType::U32,
    i64 => BaseType::I64,
}

impl TelemetryScalar for bool {
    const BASE: BaseType = BaseType::Bool;
    fn to_bits(self) -> u64 {
        self as u64
    }
    fn from_bits(bits: u64) -> Self {
        bits != 0
    }
}

impl TelemetryScalar for f32 {
    const BASE: BaseType = BaseType::F32;
    fn to_bits(self) -> u64 {
        self.to_bits() as u64
    }
    fn from_bits(bits: u64) -> Self {
        f32::from_bits(bits as u32)
    }
}

impl TelemetryScalar for f64 {
    const BASE: BaseType = BaseType::F64;
    fn to_bits(self) -> u64 {
        self.to_bits()
    }
    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits)
    }
}

/// Type-erased telemetry value cell shared between the setter and the
/// update groups that pack it.
pub struct TelemetryCell {
    name: String,
    value_type: ValueType,
    bits: AtomicU64,
    /// Resolved id (low 16 bits) and flags (high 16), 0 when unresolved.
    binding: AtomicU32,
}

impl TelemetryCell {
    fn new(name: String, value_type: ValueType) -> Arc<TelemetryCell> {
        Arc::new(TelemetryCell {
            name,
            value_type,
            bits: AtomicU64::new(0),
            binding: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    fn bound_id(&self) -> u16 {
        (self.binding.load(Ordering::Relaxed) & 0xffff) as u16
    }

    fn bind(&self, id: u16, flags: u16) {
        self.binding
            .store(u32::from(id) | (u32::from(flags) << 16), Ordering::Relaxed);
    }

    fn load_bits(&self) -> u64 {
        self.bits.load(Ordering::Relaxed)
    }
}

/// A typed telemetry value handle.
///
/// Set the value from any thread; groups read whatever is current at pack
/// time.
pub struct Telemetry<T: TelemetryScalar> {
    cell: Arc<TelemetryCell>,
    _marker: PhantomData<T>,
}

impl<T: TelemetryScalar> Telemetry<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            cell: TelemetryCell::new(name.into(), ValueType::scalar(T::BASE)),
            _marker: PhantomData,
        }
    }

    pub fn set(&self, value: T) {
        self.cell.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> T {
        T::from_bits(self.cell.bits.load(Ordering::Relaxed))
    }

    /// The shareable cell, for adding into a [`TelemetryUpdateGroup`].
    pub fn cell(&self) -> &Arc<TelemetryCell> {
        &self.cell
    }
}

fn size_bucket(base: BaseType) -> Option<usize> {
    match base {
        BaseType::Bool => Some(0),
        BaseType::I64 | BaseType::F64 => Some(1),
        BaseType::I32 | BaseType::U32 | BaseType::F32 => Some(2),
        BaseType::I16 | BaseType::U16 => Some(3),
        BaseType::I8 | BaseType::U8 => Some(4),
        BaseType::Invalid | BaseType::CString => None,
    }
}

/// Packed size of one value region, by bucket counts (bools, 8-, 4-, 2-,
/// 1-byte). Bools pack into 32-bit words; the bool region accounting spans
/// the 4-byte payload header and rounds up to 8 bytes.
fn packed_region_size(counts: &[usize; 5]) -> usize {
    let mut size = ((counts[0] + 63 + 32) / 64) * 8;
    size += counts[1] * 8;
    size += counts[2] * 4;
    size += counts[3] * 2;
    size += counts[4];
    size
}

struct PackPlan {
    /// Resolved cells in wire order: bools, 8-, 4-, 2-, 1-byte fields.
    ordered: Vec<Arc<TelemetryCell>>,
    counts: [usize; 5],
    /// Value of the `expected_payload_size` register field.
    expected_size: u16,
    /// Allocation size of one SET payload.
    set_payload_size: usize,
}

/// A registered bundle of telemetry values sent as one action.
///
/// `group_id` is client-chosen and must be unique within the session.
pub struct TelemetryUpdateGroup {
    group_id: u16,
    cells: Vec<Arc<TelemetryCell>>,
    builder: Option<ActionBuilder>,
    plan: Option<PackPlan>,
}

impl TelemetryUpdateGroup {
    pub fn new(group_id: u16) -> Self {
        Self {
            group_id,
            cells: Vec::new(),
            builder: None,
            plan: None,
        }
    }

    pub fn group_id(&self) -> u16 {
        self.group_id
    }

    /// Replace the telemetry set. Invalidates any previous registration.
    pub fn set(&mut self, cells: Vec<Arc<TelemetryCell>>) {
        self.plan = None;
        self.cells = cells;
    }

    /// Add one telemetry to the set. Invalidates any previous registration.
    pub fn add(&mut self, cell: Arc<TelemetryCell>) {
        self.plan = None;
        self.cells.push(cell);
    }

    /// Resolve the set against `definitions`, compute the packed layout and
    /// register the group with the backend. Unresolved entries are left out
    /// of the payload.
    pub fn configure(&mut self, definitions: &TelemetryDefinitions) -> Result<()> {
        self.plan = None;
        if self.cells.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let mut builder = ActionBuilder::new(Arc::clone(definitions.session()));

        for cell in &self.cells {
            match definitions.find_typed(&cell.name, cell.value_type) {
                Some(def) => cell.bind(def.id, def.flags.0),
                None => cell.bind(0, 0),
            }
        }

        let mut ordered: Vec<Arc<TelemetryCell>> =
            self.cells.iter().map(Arc::clone).collect();
        ordered.sort_by_key(|cell| {
            (
                size_bucket(cell.value_type.base()).unwrap_or(usize::MAX),
                cell.bound_id(),
            )
        });
        ordered.dedup_by(|a, b| a.bound_id() != 0 && a.bound_id() == b.bound_id());
        ordered.retain(|cell| cell.bound_id() != 0);

        let mut counts = [0usize; 5];
        for cell in &ordered {
            let Some(bucket) = size_bucket(cell.value_type.base()) else {
                return Err(Error::InvalidArgument);
            };
            counts[bucket] += 1;
        }

        let expected_size = packed_region_size(&counts);
        if ordered.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let register_payload_size = 6 + 2 * ordered.len();
        let Some(payload) = builder.start_frame(
            ActionId::RegisterTelemetryGroup,
            register_payload_size,
            ActionFlags::NONE,
        ) else {
            return Err(Error::NoControl);
        };
        payload[0..2].copy_from_slice(&self.group_id.to_le_bytes());
        payload[2..4].copy_from_slice(&(ordered.len() as u16).to_le_bytes());
        payload[4..6].copy_from_slice(&(expected_size as u16).to_le_bytes());
        for (i, cell) in ordered.iter().enumerate() {
            payload[6 + 2 * i..8 + 2 * i].copy_from_slice(&cell.bound_id().to_le_bytes());
        }

        if builder.send_blocking() != ActionResult::Complete {
            return Err(Error::CannotConnect);
        }

        self.plan = Some(PackPlan {
            ordered,
            counts,
            expected_size: expected_size as u16,
            set_payload_size: expected_size + 4,
        });
        self.builder = Some(builder);
        Ok(())
    }

    /// True once [`configure`](Self::configure) succeeded.
    pub fn is_prepared(&self) -> bool {
        self.plan.is_some()
    }

    /// The registered `expected_payload_size` value.
    pub fn expected_payload_size(&self) -> Option<u16> {
        self.plan.as_ref().map(|p| p.expected_size)
    }

    /// Pack the current values and send them, non-blocking.
    ///
    /// The payload reflects each value cell as read at pack time.
    pub fn send(&mut self) -> ActionResult {
        let (Some(plan), Some(builder)) = (self.plan.as_ref(), self.builder.as_mut()) else {
            return ActionResult::Failed;
        };

        let Some(payload) = builder.start_frame(
            ActionId::SetTelemetryGroup,
            plan.set_payload_size,
            ActionFlags::NONE,
        ) else {
            return ActionResult::Failed;
        };

        payload[0..2].copy_from_slice(&self.group_id.to_le_bytes());
        payload[2] = 0;
        payload[3] = 0;

        let mut cells = plan.ordered.iter();
        let mut at = 4usize;

        // Bool words.
        let mut word = 0u32;
        let mut bit = 0usize;
        for _ in 0..plan.counts[0] {
            let cell = cells.next().unwrap();
            if cell.load_bits() != 0 {
                word |= 1 << (bit % 32);
            }
            bit += 1;
            if bit % 32 == 0 {
                payload[at..at + 4].copy_from_slice(&word.to_le_bytes());
                at += 4;
                word = 0;
            }
        }
        if bit % 32 != 0 {
            payload[at..at + 4].copy_from_slice(&word.to_le_bytes());
            at += 4;
        }
        at = (at + 7) & !7;

        for _ in 0..plan.counts[1] {
            let bits = cells.next().unwrap().load_bits();
            payload[at..at + 8].copy_from_slice(&bits.to_le_bytes());
            at += 8;
        }
        for _ in 0..plan.counts[2] {
            let bits = cells.next().unwrap().load_bits() as u32;
            payload[at..at + 4].copy_from_slice(&bits.to_le_bytes());
            at += 4;
        }
        for _ in 0..plan.counts[3] {
            let bits = cells.next().unwrap().load_bits() as u16;
            payload[at..at + 2].copy_from_slice(&bits.to_le_bytes());
            at += 2;
        }
        for _ in 0..plan.counts[4] {
            payload[at] = cells.next().unwrap().load_bits() as u8;
            at += 1;
        }

        builder.send_non_blocking()
    }

    /// Deregister the group; the backend returns its telemetry to defaults.
    pub fn disable(&mut self) -> ActionResult {
        let Some(builder) = self.builder.as_mut() else {
            return ActionResult::Failed;
        };
        self.plan = None;

        let Some(payload) =
            builder.start_frame(ActionId::RegisterTelemetryGroup, 6, ActionFlags::NONE)
        else {
            return ActionResult::Failed;
        };
        payload[0..2].copy_from_slice(&self.group_id.to_le_bytes());
        payload[2..6].fill(0);
        builder.send_blocking()
    }
}
