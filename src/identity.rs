use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
    sync::Arc,
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    node::{NodeKind, NodeRef},
    storage::Storage,
};

pub const DIRECTION_KEY_PREFIX: &str = "nodeboard.io.direction:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("invalid port identity: {0}")]
    InvalidIdentity(String),
    #[error("unknown port `{0}`")]
    UnknownPort(PortId),
}

/// Which way payloads flow through a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Source,
    Sink,
}

impl Direction {
    pub fn flipped(self) -> Self {
        match self {
            Direction::Source => Direction::Sink,
            Direction::Sink => Direction::Source,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Source => "source",
            Direction::Sink => "sink",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts the legacy `out`/`in` spellings as well.
impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" | "out" => Ok(Direction::Source),
            "sink" | "in" => Ok(Direction::Sink),
            other => Err(format!("unknown direction `{other}`")),
        }
    }
}

/// Where a port lives: owning node, side label and index on that side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointMeta {
    pub node: NodeRef,
    pub side: String,
    pub index: u32,
}

impl PointMeta {
    pub fn new(node: NodeRef, side: &str, index: u32) -> Self {
        Self {
            node,
            side: side.to_string(),
            index,
        }
    }

    pub fn on(kind: NodeKind, id: &str, side: &str) -> Self {
        Self::new(NodeRef::new(kind, id), side, 0)
    }

    fn validate(&self) -> Result<(), IdentityError> {
        if self.node.id.is_empty() {
            return Err(IdentityError::InvalidIdentity(format!(
                "{} node without an id",
                self.node.kind
            )));
        }
        if self.node.id.contains(':') || self.side.contains(':') {
            return Err(IdentityError::InvalidIdentity(format!(
                "`:` is reserved in port identities ({}:{})",
                self.node.id, self.side
            )));
        }
        Ok(())
    }

    fn normalized(&self) -> Self {
        if self.side.is_empty() {
            Self {
                side: "x".to_string(),
                ..self.clone()
            }
        } else {
            self.clone()
        }
    }
}

/// Stable port identifier: `kind:id:side:index`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct PortId(String);

impl PortId {
    pub fn of(meta: &PointMeta) -> Self {
        PortId(format!(
            "{}:{}:{}:{}",
            meta.node.kind, meta.node.id, meta.side, meta.index
        ))
    }

    pub fn parse(raw: &str) -> Result<PointMeta, IdentityError> {
        let invalid = || IdentityError::InvalidIdentity(format!("malformed port id `{raw}`"));
        let mut parts = raw.split(':');
        let (Some(kind), Some(id), Some(side), Some(index), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(invalid());
        };
        let kind: NodeKind = kind.parse().map_err(|_| invalid())?;
        let index: u32 = index.parse().map_err(|_| invalid())?;
        let meta = PointMeta::new(NodeRef::new(kind, id), side, index);
        meta.validate()?;
        Ok(meta)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
struct PortRecord {
    meta: PointMeta,
    direction: Direction,
}

pub type DirectionListener = Arc<dyn Fn(&PortId, Direction) + Send + Sync>;

/// Assigns stable ids to connection points and owns their direction.
///
/// Directions are written through to storage on every change, so a port
/// re-registered after a restart comes back with the direction it had.
pub struct IdentityRegistry {
    points: HashMap<PortId, PortRecord>,
    by_node: HashMap<NodeRef, Vec<PortId>>,
    storage: Storage,
    listeners: Vec<DirectionListener>,
}

impl fmt::Debug for IdentityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityRegistry")
            .field("points", &self.points.len())
            .field("storage", &self.storage)
            .finish()
    }
}

impl IdentityRegistry {
    pub fn new(storage: Storage) -> Self {
        Self {
            points: HashMap::new(),
            by_node: HashMap::new(),
            storage,
            listeners: Vec::new(),
        }
    }

    fn storage_key(id: &PortId) -> String {
        format!("{DIRECTION_KEY_PREFIX}{id}")
    }

    fn saved_direction(&self, id: &PortId) -> Option<Direction> {
        let raw = self.storage.get_item(&Self::storage_key(id))?;
        match raw.parse() {
            Ok(dir) => Some(dir),
            Err(err) => {
                warn!(port = %id, %err, "ignoring stored direction");
                None
            }
        }
    }

    fn persist(&self, id: &PortId, direction: Direction) {
        if let Err(err) = self.storage.set_item(&Self::storage_key(id), direction.as_str()) {
            warn!(port = %id, error = %err, "could not persist port direction");
        }
    }

    /// Registers a point and returns its id. Registering an already known
    /// point is a no-op that returns the same id.
    pub fn register(&mut self, meta: &PointMeta, default: Direction) -> Result<PortId, IdentityError> {
        meta.validate()?;
        let meta = meta.normalized();
        let id = PortId::of(&meta);
        if self.points.contains_key(&id) {
            return Ok(id);
        }
        let direction = self.saved_direction(&id).unwrap_or(default);
        debug!(port = %id, %direction, "registered port");
        self.by_node
            .entry(meta.node.clone())
            .or_default()
            .push(id.clone());
        self.points.insert(id.clone(), PortRecord { meta, direction });
        Ok(id)
    }

    pub fn contains(&self, id: &PortId) -> bool {
        self.points.contains_key(id)
    }

    pub fn get_direction(&self, id: &PortId) -> Option<Direction> {
        self.points.get(id).map(|r| r.direction)
    }

    pub fn set_direction(&mut self, id: &PortId, direction: Direction) -> Result<(), IdentityError> {
        let record = self
            .points
            .get_mut(id)
            .ok_or_else(|| IdentityError::UnknownPort(id.clone()))?;
        let changed = record.direction != direction;
        record.direction = direction;
        self.persist(id, direction);
        if changed {
            for listener in &self.listeners {
                listener(id, direction);
            }
        }
        Ok(())
    }

    pub fn toggle_direction(&mut self, id: &PortId) -> Result<Direction, IdentityError> {
        let next = self
            .get_direction(id)
            .ok_or_else(|| IdentityError::UnknownPort(id.clone()))?
            .flipped();
        self.set_direction(id, next)?;
        Ok(next)
    }

    pub fn resolve_by_id(&self, id: &PortId) -> Option<&PointMeta> {
        self.points.get(id).map(|r| &r.meta)
    }

    pub fn ports_of(&self, node: &NodeRef) -> &[PortId] {
        self.by_node.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Forgets a port. Its stored direction is kept.
    pub fn unregister(&mut self, id: &PortId) -> bool {
        let Some(record) = self.points.remove(id) else {
            return false;
        };
        if let Some(ports) = self.by_node.get_mut(&record.meta.node) {
            ports.retain(|p| p != id);
            if ports.is_empty() {
                self.by_node.remove(&record.meta.node);
            }
        }
        true
    }

    pub fn unregister_node(&mut self, node: &NodeRef) -> Vec<PortId> {
        let ports = self.by_node.remove(node).unwrap_or_default();
        for id in &ports {
            self.points.remove(id);
        }
        ports
    }

    pub fn on_direction_change(&mut self, listener: DirectionListener) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Every stored direction, registered or not, keyed by port id.
    pub fn export_directions(&self) -> BTreeMap<String, Direction> {
        self.storage
            .keys_with_prefix(DIRECTION_KEY_PREFIX)
            .into_iter()
            .filter_map(|key| {
                let id = key.strip_prefix(DIRECTION_KEY_PREFIX)?.to_string();
                let dir = self.storage.get_item(&key)?.parse::<Direction>().ok()?;
                Some((id, dir))
            })
            .collect()
    }

    /// Loads stored directions and applies them to registered ports.
    /// Returns how many entries were imported.
    pub fn import_directions(&mut self, directions: &BTreeMap<String, String>) -> usize {
        let mut imported = 0;
        for (raw_id, raw_dir) in directions {
            let Ok(direction) = raw_dir.parse::<Direction>() else {
                warn!(port = %raw_id, value = %raw_dir, "skipping unknown direction");
                continue;
            };
            let id = PortId(raw_id.clone());
            if self.contains(&id) {
                let _ = self.set_direction(&id, direction);
            } else {
                self.persist(&id, direction);
            }
            imported += 1;
        }
        imported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn agent_point(id: &str, side: &str) -> PointMeta {
        PointMeta::on(NodeKind::Agent, id, side)
    }

    #[test]
    fn port_id_has_stable_format() {
        let id = PortId::of(&agent_point("1", "r"));
        assert_eq!(id.as_str(), "agent:1:r:0");
        assert_eq!(PortId::parse(id.as_str()).unwrap(), agent_point("1", "r"));
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        for raw in ["agent:1:r", "agent:1:r:x", "bot:1:r:0", "agent::r:0", "agent:1:r:0:9"] {
            assert!(PortId::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn register_is_idempotent() {
        let mut reg = IdentityRegistry::new(Storage::in_memory());
        let a = reg.register(&agent_point("1", "r"), Direction::Source).unwrap();
        reg.set_direction(&a, Direction::Sink).unwrap();
        let b = reg.register(&agent_point("1", "r"), Direction::Source).unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.get_direction(&a), Some(Direction::Sink));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn empty_node_id_is_invalid() {
        let mut reg = IdentityRegistry::new(Storage::in_memory());
        let err = reg
            .register(&agent_point("", "r"), Direction::Source)
            .unwrap_err();
        assert!(matches!(err, IdentityError::InvalidIdentity(_)));
        assert!(reg.is_empty());
    }

    #[test]
    fn missing_side_falls_back_to_placeholder() {
        let mut reg = IdentityRegistry::new(Storage::in_memory());
        let id = reg.register(&agent_point("1", ""), Direction::Source).unwrap();
        assert_eq!(id.as_str(), "agent:1:x:0");
    }

    #[test]
    fn direction_survives_new_registry_on_same_storage() {
        let storage = Storage::in_memory();
        let mut reg = IdentityRegistry::new(storage.clone());
        let id = reg.register(&agent_point("2", "l"), Direction::Source).unwrap();
        reg.toggle_direction(&id).unwrap();

        let mut reloaded = IdentityRegistry::new(storage);
        reloaded.register(&agent_point("2", "l"), Direction::Source).unwrap();
        assert_eq!(reloaded.get_direction(&id), Some(Direction::Sink));
    }

    #[test]
    fn legacy_direction_values_are_understood() {
        let storage = Storage::in_memory();
        storage
            .set_item("nodeboard.io.direction:human:me:b:0", "in")
            .unwrap();
        let mut reg = IdentityRegistry::new(storage);
        let id = reg
            .register(&PointMeta::on(NodeKind::Human, "me", "b"), Direction::Source)
            .unwrap();
        assert_eq!(reg.get_direction(&id), Some(Direction::Sink));
    }

    #[test]
    fn unregister_node_drops_all_its_ports() {
        let mut reg = IdentityRegistry::new(Storage::in_memory());
        reg.register(&agent_point("1", "l"), Direction::Source).unwrap();
        reg.register(&agent_point("1", "r"), Direction::Source).unwrap();
        let other = reg.register(&agent_point("2", "l"), Direction::Source).unwrap();

        let removed = reg.unregister_node(&NodeRef::agent("1"));
        assert_eq!(removed.len(), 2);
        assert!(reg.ports_of(&NodeRef::agent("1")).is_empty());
        assert!(reg.contains(&other));
        assert!(reg.unregister(&other));
        assert!(!reg.unregister(&other));
    }

    #[test]
    fn listeners_fire_only_on_change() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut reg = IdentityRegistry::new(Storage::in_memory());
        let sink = seen.clone();
        reg.on_direction_change(Arc::new(move |id, dir| {
            sink.lock().unwrap().push((id.clone(), dir));
        }));
        let id = reg.register(&agent_point("1", "r"), Direction::Source).unwrap();
        reg.set_direction(&id, Direction::Source).unwrap();
        reg.set_direction(&id, Direction::Sink).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(id, Direction::Sink)]);
    }

    #[test]
    fn export_and_import_directions() {
        let mut reg = IdentityRegistry::new(Storage::in_memory());
        let id = reg.register(&agent_point("1", "r"), Direction::Source).unwrap();
        reg.set_direction(&id, Direction::Sink).unwrap();
        let exported = reg.export_directions();
        assert_eq!(exported.get("agent:1:r:0"), Some(&Direction::Sink));

        let mut other = IdentityRegistry::new(Storage::in_memory());
        let raw: BTreeMap<String, String> = exported
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .chain([("agent:9:l:0".to_string(), "sideways".to_string())])
            .collect();
        assert_eq!(other.import_directions(&raw), 1);
        other.register(&agent_point("1", "r"), Direction::Source).unwrap();
        assert_eq!(other.get_direction(&id), Some(Direction::Sink));
    }

    #[test]
    fn unknown_port_cannot_change_direction() {
        let mut reg = IdentityRegistry::new(Storage::in_memory());
        let ghost = PortId::of(&agent_point("1", "r"));
        assert_eq!(
            reg.toggle_direction(&ghost),
            Err(IdentityError::UnknownPort(ghost.clone()))
        );
    }
}
