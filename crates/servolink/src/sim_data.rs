//! Parsed simulator data.
//!
//! The sim-data blob is one BSON document with per-category subdocuments:
//! `sim`, `vehicles`, `sessions`, `tracks`, `participants` and `tires`,
//! plus `active_sim` / `active_session` pointers. Section entries keep
//! their raw documents so arbitrary properties stay reachable through the
//! typed getters.

use std::sync::Arc;

use bson::{Bson, Document};
use parking_lot::Mutex;
use servolink_shm::ShmView;
use servolink_wire::SIM_DATA_SHM_VERSION;

use crate::provider::{BsonBlockProvider, UpdateOutcome};

/// Property access over one section document.
///
/// `get` reports `None` both for a missing key and a type mismatch;
/// `try_get` reports whether the property was found.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    doc: Document,
}

impl Section {
    fn new(doc: Document) -> Section {
        Section { doc }
    }

    pub fn raw(&self) -> &Document {
        &self.doc
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.doc.get(name)? {
            Bson::Double(v) => Some(*v),
            Bson::Int32(v) => Some(*v as f64),
            Bson::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        self.doc.get_i32(name).ok()
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.doc.get(name)? {
            Bson::Int64(v) => Some(*v),
            Bson::Int32(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.doc.get_bool(name).ok()
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.doc.get_str(name).ok()
    }

    pub fn get_str_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get_str(name).unwrap_or(default)
    }

    /// Found/missing probe for a property of any supported type.
    pub fn try_get(&self, name: &str) -> bool {
        self.doc.contains_key(name)
    }
}

/// A vehicle known to the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct Vehicle {
    pub id: String,
    pub properties: Section,
}

impl Vehicle {
    pub fn name(&self) -> &str {
        self.properties.get_str_or("name", "")
    }
}

/// A simulator session (practice, qualifying, race…).
#[derive(Debug, Clone, PartialEq)]
pub struct SimSession {
    pub id: String,
    pub properties: Section,
}

/// A track known to the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: String,
    pub properties: Section,
}

impl Track {
    pub fn name(&self) -> &str {
        self.properties.get_str_or("name", "")
    }
}

/// A participant in the running session. Participant keys on the wire are
/// 4-digit hex strings.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: i32,
    pub properties: Section,
}

/// Tire state for one participant slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Tire {
    pub id: i32,
    pub properties: Section,
}

/// The simulator itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Sim {
    pub id: String,
    pub properties: Section,
}

/// Participant and tire ids are 4-character hex strings.
fn parse_hex_key(key: &str) -> Option<i32> {
    if key.len() != 4 {
        return None;
    }
    i32::from_str_radix(key, 16).ok()
}

/// One parsed snapshot of the simulator data.
pub struct SimData {
    revision: u32,
    sim: Option<Sim>,
    vehicles: Vec<Vehicle>,
    sessions: Vec<SimSession>,
    tracks: Vec<Track>,
    participants: Vec<Participant>,
    tires: Vec<Tire>,
    active_session_idx: Option<usize>,
}

impl SimData {
    fn parse(raw: &[u8], revision: u32) -> SimData {
        let mut data = SimData {
            revision,
            sim: None,
            vehicles: Vec::new(),
            sessions: Vec::new(),
            tracks: Vec::new(),
            participants: Vec::new(),
            tires: Vec::new(),
            active_session_idx: None,
        };

        let Ok(doc) = Document::from_reader(&mut &raw[..]) else {
            return data;
        };

        let mut active_session = String::new();
        let mut active_sim = String::new();
        let mut sim_doc = None;

        for (key, value) in &doc {
            match (key.as_str(), value) {
                ("vehicles", Bson::Document(d)) => {
                    for (id, entry) in d {
                        if let Bson::Document(body) = entry {
                            data.vehicles.push(Vehicle {
                                id: id.clone(),
                                properties: Section::new(body.clone()),
                            });
                        }
                    }
                }
                ("sessions", Bson::Document(d)) => {
                    for (id, entry) in d {
                        if let Bson::Document(body) = entry {
                            data.sessions.push(SimSession {
                                id: id.clone(),
                                properties: Section::new(body.clone()),
                            });
                        }
                    }
                }
                ("tracks", Bson::Document(d)) => {
                    for (id, entry) in d {
                        if let Bson::Document(body) = entry {
                            data.tracks.push(Track {
                                id: id.clone(),
                                properties: Section::new(body.clone()),
                            });
                        }
                    }
                }
                ("participants", Bson::Document(d)) => {
                    for (id, entry) in d {
                        // Entries with malformed keys are skipped.
                        let (Some(id), Bson::Document(body)) = (parse_hex_key(id), entry) else {
                            continue;
                        };
                        data.participants.push(Participant {
                            id,
                            properties: Section::new(body.clone()),
                        });
                    }
                }
                ("tires", Bson::Document(d)) => {
                    for (id, entry) in d {
                        let (Some(id), Bson::Document(body)) = (parse_hex_key(id), entry) else {
                            continue;
                        };
                        data.tires.push(Tire {
                            id,
                            properties: Section::new(body.clone()),
                        });
                    }
                }
                ("sim", Bson::Document(d)) => sim_doc = Some(d.clone()),
                ("active_session", Bson::String(s)) => active_session = s.clone(),
                ("active_sim", Bson::String(s)) => active_sim = s.clone(),
                _ => {}
            }
        }

        if let (Some(doc), false) = (sim_doc, active_sim.is_empty()) {
            data.sim = Some(Sim {
                id: active_sim,
                properties: Section::new(doc),
            });
        }
        data.active_session_idx = data.sessions.iter().position(|s| s.id == active_session);
        data
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn sim(&self) -> Option<&Sim> {
        self.sim.as_ref()
    }

    pub fn vehicles(&self) -> &[Vehicle] {
        &self.vehicles
    }

    pub fn vehicle(&self, id: &str) -> Option<&Vehicle> {
        self.vehicles.iter().find(|v| v.id == id)
    }

    pub fn sessions(&self) -> &[SimSession] {
        &self.sessions
    }

    pub fn session(&self, id: &str) -> Option<&SimSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn current_session(&self) -> Option<&SimSession> {
        self.sessions.get(self.active_session_idx?)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, id: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn current_track(&self) -> Option<&Track> {
        let id = self.current_session()?.properties.get_str("track_id")?;
        self.track(id)
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, id: i32) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn player_participant(&self) -> Option<&Participant> {
        let id = self
            .current_session()?
            .properties
            .get_i32("player_participant_id")?;
        self.participant(id)
    }

    pub fn player_vehicle(&self) -> Option<&Vehicle> {
        let id = self
            .current_session()?
            .properties
            .get_str("player_vehicle_id")?;
        self.vehicle(id)
    }

    pub fn tires(&self) -> &[Tire] {
        &self.tires
    }

    pub fn tire(&self, id: i32) -> Option<&Tire> {
        self.tires.iter().find(|t| t.id == id)
    }
}

/// Sim data block provider with a lazy parse cache.
pub(crate) struct SimDataProvider {
    block: BsonBlockProvider,
    parsed: Mutex<Option<Arc<SimData>>>,
}

impl SimDataProvider {
    pub fn new(view: ShmView) -> Self {
        Self {
            block: BsonBlockProvider::new(view, SIM_DATA_SHM_VERSION),
            parsed: Mutex::new(None),
        }
    }

    pub fn update(&self) -> UpdateOutcome {
        self.block.update()
    }

    pub fn sim_data(&self) -> Option<Arc<SimData>> {
        let (raw, revision) = self.block.raw()?;
        {
            let parsed = self.parsed.lock();
            if let Some(data) = parsed.as_ref() {
                if data.revision == revision {
                    return Some(Arc::clone(data));
                }
            }
        }

        let data = Arc::new(SimData::parse(&raw, revision));
        *self.parsed.lock() = Some(Arc::clone(&data));
        Some(data)
    }
}
