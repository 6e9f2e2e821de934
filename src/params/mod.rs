//! Hierarchical parameter store.
//!
//! The store mirrors the definition files the supervisory layer ships
//! (`parameterListMaster.json` plus one definition per slave type): a tree
//! of named groups and typed leaves. Each leaf carries a closed value
//! variant, a writability flag and the wire command code the protocol
//! layer uses when exchanging it with a slave.
//!
//! Mutation is whole-node replacement only — a reader never observes a
//! half-written value. Nodes marked not-writable are derived/output values
//! and are exactly the set reported upstream in the system-data snapshot;
//! writable nodes are command inputs and are never echoed back.

use std::collections::BTreeMap;

use log::{info, warn};
use serde_json::{Map, Value, json};

use crate::error::{Error, ProtocolError};

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Closed set of parameter value types. Every encode/decode boundary
/// matches exhaustively; unknown definition tags are a load-time error,
/// never a silent coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Uint(u32),
    Int(i32),
    Float(f32),
    Text(String),
}

impl ParamValue {
    /// The definition-file tag for this variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Uint(_) => "uint32",
            Self::Int(_) => "int32",
            Self::Float(_) => "float32",
            Self::Text(_) => "string",
        }
    }

    /// True when `other` carries the same variant.
    pub fn same_type(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::Uint(_), Self::Uint(_))
                | (Self::Int(_), Self::Int(_))
                | (Self::Float(_), Self::Float(_))
                | (Self::Text(_), Self::Text(_))
        )
    }

    /// Parse a definition-file `type`/`value` pair.
    fn from_definition(tag: &str, value: &Value) -> Result<Self, Error> {
        match tag {
            "uint32" => value
                .as_u64()
                .map(|v| Self::Uint(v as u32))
                .ok_or(Error::Config("uint32 value out of range")),
            "int32" => value
                .as_i64()
                .map(|v| Self::Int(v as i32))
                .ok_or(Error::Config("int32 value out of range")),
            "float32" => value
                .as_f64()
                .map(|v| Self::Float(v as f32))
                .ok_or(Error::Config("float32 value not a number")),
            "string" => value
                .as_str()
                .map(|v| Self::Text(v.to_string()))
                .ok_or(Error::Config("string value not a string")),
            _ => Err(Error::Config("unknown parameter type tag")),
        }
    }

    /// Render as JSON for the snapshot.
    fn to_json(&self) -> Value {
        match self {
            Self::Uint(v) => json!(v),
            Self::Int(v) => json!(v),
            Self::Float(v) => json!(v),
            Self::Text(v) => json!(v),
        }
    }

    /// Coerce a JSON scalar into this node's variant (control-file writes).
    pub fn coerce_json(&self, value: &Value) -> Result<Self, ProtocolError> {
        match self {
            Self::Uint(_) => value
                .as_u64()
                .map(|v| Self::Uint(v as u32))
                .ok_or(ProtocolError::TypeMismatch),
            Self::Int(_) => value
                .as_i64()
                .map(|v| Self::Int(v as i32))
                .ok_or(ProtocolError::TypeMismatch),
            Self::Float(_) => value
                .as_f64()
                .map(|v| Self::Float(v as f32))
                .ok_or(ProtocolError::TypeMismatch),
            Self::Text(_) => value
                .as_str()
                .map(|v| Self::Text(v.to_string()))
                .ok_or(ProtocolError::TypeMismatch),
        }
    }
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// A typed leaf: current value, writability, wire command code.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterNode {
    pub value: ParamValue,
    pub write_enable: bool,
    pub command: u16,
}

/// Group or leaf.
#[derive(Debug, Clone)]
pub enum ParamTree {
    Group(BTreeMap<String, ParamTree>),
    Leaf(ParameterNode),
}

/// The shared parameter tree.
pub struct ParameterStore {
    root: BTreeMap<String, ParamTree>,
}

impl ParameterStore {
    /// Build the store from the master definition plus one definition per
    /// slave subtree (`(subtree key, definition)` pairs).
    pub fn from_definitions(
        master: &Value,
        slaves: &[(String, Value)],
    ) -> Result<Self, Error> {
        let mut root = Self::parse_group(
            master
                .get("parameters")
                .and_then(Value::as_object)
                .ok_or(Error::Config("master definition missing 'parameters'"))?,
        )?;
        for (key, def) in slaves {
            let group = Self::parse_group(
                def.get("parameters")
                    .and_then(Value::as_object)
                    .ok_or(Error::Config("slave definition missing 'parameters'"))?,
            )?;
            root.insert(key.clone(), ParamTree::Group(group));
        }
        info!("parameter store loaded ({} top-level entries)", root.len());
        Ok(Self { root })
    }

    fn parse_group(obj: &Map<String, Value>) -> Result<BTreeMap<String, ParamTree>, Error> {
        let mut group = BTreeMap::new();
        for (key, entry) in obj {
            if let Some(children) = entry.get("parameters").and_then(Value::as_object) {
                group.insert(key.clone(), ParamTree::Group(Self::parse_group(children)?));
            } else if let Some(leaf) = entry.get("type").and_then(Value::as_object) {
                let tag = leaf
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or(Error::Config("leaf missing type tag"))?;
                let value = ParamValue::from_definition(
                    tag,
                    leaf.get("value").unwrap_or(&Value::Null),
                )?;
                let write_enable = leaf
                    .get("writeEnable")
                    .and_then(Value::as_bool)
                    .ok_or(Error::Config("leaf missing writeEnable"))?;
                let command = leaf
                    .get("command")
                    .and_then(Value::as_u64)
                    .ok_or(Error::Config("leaf missing command code"))?
                    as u16;
                group.insert(
                    key.clone(),
                    ParamTree::Leaf(ParameterNode {
                        value,
                        write_enable,
                        command,
                    }),
                );
            } else {
                return Err(Error::Config("definition entry is neither group nor leaf"));
            }
        }
        Ok(group)
    }

    /// Built-in fallback definition: the master's own telemetry plus one
    /// rsd slave at 0x10. Used when the definition files are absent.
    pub fn builtin() -> Self {
        let master = json!({
            "name": "pvsw_master",
            "parameters": {
                "temperature": { "type": { "type": "float32", "value": 25.0, "writeEnable": false, "command": 0x0001 } },
                "is_ac_in":    { "type": { "type": "uint32",  "value": 0,    "writeEnable": false, "command": 0x0002 } },
                "is_24V_en":   { "type": { "type": "uint32",  "value": 0,    "writeEnable": false, "command": 0x0003 } },
                "is_wet":      { "type": { "type": "uint32",  "value": 0,    "writeEnable": false, "command": 0x0004 } },
                "scale":       { "type": { "type": "float32", "value": 0.0,  "writeEnable": false, "command": 0x0005 } },
            }
        });
        let rsd = json!({
            "name": "pvsw_slave_rsd",
            "parameters": {
                "status":     { "type": { "type": "uint32",  "value": 0,    "writeEnable": false, "command": 0x0010 } },
                "version":    { "type": { "type": "uint32",  "value": 0,    "writeEnable": false, "command": 0x0011 } },
                "pv_volt":    { "type": { "type": "float32", "value": 0.0,  "writeEnable": false, "command": 0x0012 } },
                "pv_current": { "type": { "type": "float32", "value": 0.0,  "writeEnable": false, "command": 0x0013 } },
                "pv_sw":      { "type": { "type": "uint32",  "value": 0,    "writeEnable": true,  "command": 0x0014 } },
                "serial":     { "type": { "type": "string",  "value": "",   "writeEnable": false, "command": 0x0015 } },
            }
        });
        Self::from_definitions(&master, &[("slave_0010".to_string(), rsd)])
            .expect("builtin definition is well formed")
    }

    /// Load the definition files from the config directory: the master
    /// list plus one `<stem>_<addr>.json` per slave (address in hex,
    /// e.g. `parameterListSlave_0010.json`). Any problem falls back to
    /// the built-in definition so the daemon still comes up.
    ///
    /// Returns the store and the configured slave addresses.
    pub fn from_config_dir(cfg: &crate::config::FileConfig) -> (Self, Vec<u8>) {
        match Self::try_from_config_dir(cfg) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("parameter definitions unusable ({e}), using built-in set");
                (Self::builtin(), vec![0x10])
            }
        }
    }

    fn try_from_config_dir(cfg: &crate::config::FileConfig) -> Result<(Self, Vec<u8>), Error> {
        let dir = std::path::Path::new(&cfg.config_path);
        let read_json = |path: &std::path::Path| -> Result<Value, Error> {
            let text = std::fs::read_to_string(path)
                .map_err(|_| Error::Config("definition file unreadable"))?;
            serde_json::from_str(&text).map_err(|_| Error::Config("definition file not JSON"))
        };

        let master = read_json(&dir.join(&cfg.parameter_list_master_name))?;
        let mut slaves = Vec::new();
        let mut addresses = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|_| Error::Config("config dir unreadable"))? {
            let entry = entry.map_err(|_| Error::Config("config dir unreadable"))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(hex) = name
                .strip_prefix(&format!("{}_", cfg.parameter_list_slave_name))
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            let address = u8::from_str_radix(hex, 16)
                .map_err(|_| Error::Config("bad address in slave definition name"))?;
            slaves.push((format!("slave_{address:04x}"), read_json(&entry.path())?));
            addresses.push(address);
        }
        addresses.sort_unstable();
        slaves.sort_by(|a, b| a.0.cmp(&b.0));
        let store = Self::from_definitions(&master, &slaves)?;
        Ok((store, addresses))
    }

    /// Look up a leaf by path (e.g. `["slave_0010", "pv_sw"]`).
    pub fn lookup(&self, path: &[&str]) -> Option<&ParameterNode> {
        let mut cursor = &self.root;
        let (last, prefix) = path.split_last()?;
        for key in prefix {
            match cursor.get(*key)? {
                ParamTree::Group(g) => cursor = g,
                ParamTree::Leaf(_) => return None,
            }
        }
        match cursor.get(*last)? {
            ParamTree::Leaf(node) => Some(node),
            ParamTree::Group(_) => None,
        }
    }

    /// Replace a leaf's value. The replacement must carry the node's
    /// declared type; the node is swapped whole, never partially updated.
    pub fn set_value(&mut self, path: &[&str], value: ParamValue) -> Result<(), ProtocolError> {
        let node = self
            .lookup_mut(path)
            .ok_or(ProtocolError::UnknownParameter)?;
        if !node.value.same_type(&value) {
            return Err(ProtocolError::TypeMismatch);
        }
        node.value = value;
        Ok(())
    }

    fn lookup_mut(&mut self, path: &[&str]) -> Option<&mut ParameterNode> {
        let mut cursor = &mut self.root;
        let (last, prefix) = path.split_last()?;
        for key in prefix {
            match cursor.get_mut(*key)? {
                ParamTree::Group(g) => cursor = g,
                ParamTree::Leaf(_) => return None,
            }
        }
        match cursor.get_mut(*last)? {
            ParamTree::Leaf(node) => Some(node),
            ParamTree::Group(_) => None,
        }
    }

    /// JSON view of the tree for the system-data snapshot. Only
    /// not-writable leaves appear — writable nodes are command inputs,
    /// not reported state.
    pub fn snapshot(&self) -> Value {
        Value::Object(Self::snapshot_group(&self.root))
    }

    fn snapshot_group(group: &BTreeMap<String, ParamTree>) -> Map<String, Value> {
        let mut out = Map::new();
        for (key, entry) in group {
            match entry {
                ParamTree::Group(g) => {
                    out.insert(key.clone(), Value::Object(Self::snapshot_group(g)));
                }
                ParamTree::Leaf(node) if !node.write_enable => {
                    out.insert(key.clone(), node.value.to_json());
                }
                ParamTree::Leaf(_) => {}
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lookup_paths() {
        let store = ParameterStore::builtin();
        let node = store.lookup(&["slave_0010", "pv_sw"]).unwrap();
        assert!(node.write_enable);
        assert_eq!(node.command, 0x0014);
        assert!(store.lookup(&["slave_0010", "nonexistent"]).is_none());
        assert!(store.lookup(&["slave_0010"]).is_none(), "group is not a leaf");
    }

    #[test]
    fn set_value_replaces_whole_node_value() {
        let mut store = ParameterStore::builtin();
        store
            .set_value(&["slave_0010", "pv_volt"], ParamValue::Float(312.5))
            .unwrap();
        assert_eq!(
            store.lookup(&["slave_0010", "pv_volt"]).unwrap().value,
            ParamValue::Float(312.5)
        );
    }

    #[test]
    fn set_value_rejects_type_mismatch() {
        let mut store = ParameterStore::builtin();
        let err = store
            .set_value(&["slave_0010", "pv_volt"], ParamValue::Uint(1))
            .unwrap_err();
        assert_eq!(err, ProtocolError::TypeMismatch);
    }

    #[test]
    fn set_value_unknown_path() {
        let mut store = ParameterStore::builtin();
        let err = store
            .set_value(&["slave_0010", "ghost"], ParamValue::Uint(1))
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnknownParameter);
    }

    #[test]
    fn snapshot_excludes_writable_nodes() {
        let store = ParameterStore::builtin();
        let snap = store.snapshot();
        let slave = snap.get("slave_0010").unwrap();
        assert!(slave.get("pv_volt").is_some());
        assert!(slave.get("status").is_some());
        assert!(
            slave.get("pv_sw").is_none(),
            "writable command inputs are not reported upstream"
        );
    }

    #[test]
    fn unknown_type_tag_is_a_hard_error() {
        let master = json!({
            "parameters": {
                "bogus": { "type": { "type": "float64", "value": 0.0, "writeEnable": false, "command": 1 } }
            }
        });
        assert!(ParameterStore::from_definitions(&master, &[]).is_err());
    }

    #[test]
    fn coerce_json_respects_variant() {
        let v = ParamValue::Uint(0);
        assert_eq!(v.coerce_json(&json!(3)).unwrap(), ParamValue::Uint(3));
        assert!(v.coerce_json(&json!("three")).is_err());
        let f = ParamValue::Float(0.0);
        assert_eq!(f.coerce_json(&json!(2.5)).unwrap(), ParamValue::Float(2.5));
    }
}
