//! Server-side variable storage.
//!
//! Every slot is declared up front from the server configuration. Incoming
//! payloads only ever overwrite existing slots; a message naming an
//! undeclared slot is rejected.

use crate::core::{Error, Result};
use crate::paramserver::config::ServerConfig;
use crate::paramserver::round::trainer_var_name;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

/// Storage kind of a variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarKind {
    /// Dense tensor
    Dense,
    /// Row-sparse tensor: a set of row indices plus their values
    SparseRows,
}

impl FromStr for VarKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dense" | "lod_tensor" => Ok(VarKind::Dense),
            "sparse_rows" | "selected_rows" => Ok(VarKind::SparseRows),
            other => Err(Error::UnsupportedVariableKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for VarKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarKind::Dense => write!(f, "dense"),
            VarKind::SparseRows => write!(f, "sparse_rows"),
        }
    }
}

/// A dense row-major tensor of `f32`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseTensor {
    /// Shape
    pub dims: Vec<usize>,
    /// Flat values, `dims.iter().product()` long
    pub data: Vec<f32>,
}

impl DenseTensor {
    /// Create a tensor, checking that the data matches the shape.
    pub fn new(dims: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let tensor = Self { dims, data };
        match tensor.shape_error() {
            Some(reason) => Err(Error::Internal(reason)),
            None => Ok(tensor),
        }
    }

    fn shape_error(&self) -> Option<String> {
        let numel = self
            .dims
            .iter()
            .try_fold(1usize, |acc, d| acc.checked_mul(*d));
        match numel {
            None => Some(format!("Tensor shape {:?} overflows", self.dims)),
            Some(n) if n != self.data.len() => Some(format!(
                "Tensor shape {:?} needs {} values, got {}",
                self.dims,
                n,
                self.data.len()
            )),
            Some(_) => None,
        }
    }

    /// Zero-filled tensor of the given shape.
    pub fn zeros(dims: &[usize]) -> Self {
        let numel = dims.iter().product();
        Self {
            dims: dims.to_vec(),
            data: vec![0.0; numel],
        }
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Elements per leading-dimension row.
    pub fn row_width(&self) -> usize {
        if self.dims.len() <= 1 {
            1
        } else {
            self.dims[1..].iter().product()
        }
    }
}

/// Row-sparse tensor.
///
/// `value` holds one row per entry of `rows`; `height` is the row count of
/// the dense tensor this one is a slice of.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SparseRows {
    /// Height of the full tensor
    pub height: usize,
    /// Row indices present in `value`
    pub rows: Vec<i64>,
    /// Row values, `rows.len()` rows of the full tensor's width
    pub value: DenseTensor,
}

impl SparseRows {
    /// Create a sparse tensor, checking row count against the value.
    pub fn new(height: usize, rows: Vec<i64>, value: DenseTensor) -> Result<Self> {
        let sparse = Self {
            height,
            rows,
            value,
        };
        match sparse.shape_error() {
            Some(reason) => Err(Error::Internal(reason)),
            None => Ok(sparse),
        }
    }

    fn shape_error(&self) -> Option<String> {
        if let Some(reason) = self.value.shape_error() {
            return Some(reason);
        }
        let leading = self.value.dims.first().copied().unwrap_or(0);
        if leading != self.rows.len() {
            return Some(format!(
                "Sparse value has {} rows but {} indices",
                leading,
                self.rows.len()
            ));
        }
        let in_range = |r: &i64| usize::try_from(*r).map_or(false, |r| r < self.height);
        self.rows.iter().find(|r| !in_range(r)).map(|bad| {
            format!("Row index {} out of range for height {}", bad, self.height)
        })
    }

    /// Empty sparse tensor for a full shape `[height, ...]`.
    pub fn empty(dims: &[usize]) -> Self {
        let height = dims.first().copied().unwrap_or(0);
        let mut value_dims = vec![0];
        value_dims.extend_from_slice(dims.get(1..).unwrap_or(&[]));
        Self {
            height,
            rows: Vec::new(),
            value: DenseTensor::zeros(&value_dims),
        }
    }

    /// Drop the row index set. The value buffer is left allocated.
    pub fn clear_rows(&mut self) {
        self.rows.clear();
    }
}

/// A server-side variable value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Variable {
    Dense(DenseTensor),
    SparseRows(SparseRows),
}

impl Variable {
    /// Empty value of the given kind and full shape.
    pub fn empty(kind: VarKind, dims: &[usize]) -> Self {
        match kind {
            VarKind::Dense => Variable::Dense(DenseTensor::zeros(dims)),
            VarKind::SparseRows => Variable::SparseRows(SparseRows::empty(dims)),
        }
    }

    /// Storage kind of this value.
    pub fn kind(&self) -> VarKind {
        match self {
            Variable::Dense(_) => VarKind::Dense,
            Variable::SparseRows(_) => VarKind::SparseRows,
        }
    }

    pub fn as_dense(&self) -> Option<&DenseTensor> {
        match self {
            Variable::Dense(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_sparse(&self) -> Option<&SparseRows> {
        match self {
            Variable::SparseRows(s) => Some(s),
            _ => None,
        }
    }

    /// Why `self` cannot be stored in `slot`, if anything.
    ///
    /// Checks the value's own shape, then the slot's declared geometry:
    /// dims for dense values, height and row width for sparse ones.
    fn incompatibility(&self, slot: &Variable) -> Option<String> {
        match (self, slot) {
            (Variable::Dense(value), Variable::Dense(declared)) => {
                value.shape_error().or_else(|| {
                    (value.dims != declared.dims).then(|| {
                        format!("dims {:?}, declared {:?}", value.dims, declared.dims)
                    })
                })
            }
            (Variable::SparseRows(value), Variable::SparseRows(declared)) => {
                value.shape_error().or_else(|| {
                    let row_dims = |s: &SparseRows| s.value.dims.get(1..).unwrap_or(&[]).to_vec();
                    if value.height != declared.height {
                        Some(format!(
                            "height {}, declared {}",
                            value.height, declared.height
                        ))
                    } else if row_dims(value) != row_dims(declared) {
                        Some(format!(
                            "row dims {:?}, declared {:?}",
                            row_dims(value),
                            row_dims(declared)
                        ))
                    } else {
                        None
                    }
                })
            }
            _ => None,
        }
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// Deserialize from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Server-side variable storage, keyed by variable name.
///
/// Tracks which slots have been written since the last
/// [`clear_written`](Self::clear_written), so update programs can tell this
/// round's gradients from values left over by earlier rounds.
#[derive(Debug, Default)]
pub struct VariableStore {
    vars: HashMap<String, Variable>,
    written: HashSet<String>,
}

impl VariableStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the slot namespace from configuration.
    ///
    /// Gradients listed in `grad_list` also get one `<grad>.trainer_<k>`
    /// slot per trainer when `fan_in > 1`.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let mut store = Self::new();
        for decl in &config.variables {
            let kind: VarKind = decl.kind.parse()?;
            store.declare(&decl.name, Variable::empty(kind, &decl.dims));

            if config.fan_in > 1 && config.grad_list.iter().any(|g| g == &decl.name) {
                for k in 0..config.fan_in {
                    store.declare(
                        &trainer_var_name(&decl.name, k),
                        Variable::empty(kind, &decl.dims),
                    );
                }
            }
        }
        Ok(store)
    }

    /// Declare (or replace) a slot.
    pub fn declare(&mut self, name: &str, value: Variable) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Variable> {
        self.vars.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Decode a wire payload into an existing slot.
    ///
    /// Returns the storage kind of the value written.
    pub fn deserialize_into(&mut self, name: &str, payload: &[u8]) -> Result<VarKind> {
        if !self.vars.contains_key(name) {
            return Err(Error::UnknownVariable(name.to_string()));
        }
        let value = Variable::from_bytes(payload)?;
        self.write(name, value)
    }

    /// Overwrite an existing slot and mark it written.
    ///
    /// The value must match the slot's kind and declared shape; on error the
    /// slot keeps its previous value.
    pub fn write(&mut self, name: &str, value: Variable) -> Result<VarKind> {
        let slot = self
            .vars
            .get_mut(name)
            .ok_or_else(|| Error::UnknownVariable(name.to_string()))?;

        if value.kind() != slot.kind() {
            return Err(Error::VariableKindMismatch {
                name: name.to_string(),
                expected: slot.kind().to_string(),
                actual: value.kind().to_string(),
            });
        }
        if let Some(reason) = value.incompatibility(slot) {
            return Err(Error::MalformedVariable {
                name: name.to_string(),
                reason,
            });
        }

        let kind = value.kind();
        *slot = value;
        self.written.insert(name.to_string());
        Ok(kind)
    }

    /// Whether `name` was written since the last [`clear_written`](Self::clear_written).
    pub fn is_written(&self, name: &str) -> bool {
        self.written.contains(name)
    }

    pub fn clear_written(&mut self) {
        self.written.clear();
    }

    /// Empty the row index set of a sparse slot. Dense slots are untouched.
    pub fn clear_rows(&mut self, name: &str) -> Result<()> {
        match self.vars.get_mut(name) {
            Some(Variable::SparseRows(sparse)) => {
                sparse.clear_rows();
                Ok(())
            }
            Some(Variable::Dense(_)) => Ok(()),
            None => Err(Error::UnknownVariable(name.to_string())),
        }
    }

    /// Serialize the named slots for release to trainers.
    pub fn snapshot(&self, names: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        let mut out = HashMap::with_capacity(names.len());
        for name in names {
            let var = self
                .vars
                .get(name)
                .ok_or_else(|| Error::UnknownVariable(name.clone()))?;
            out.insert(name.clone(), var.to_bytes()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paramserver::config::VariableDecl;

    fn sparse_payload() -> Vec<u8> {
        let value = DenseTensor::new(vec![2, 3], vec![1.0; 6]).unwrap();
        Variable::SparseRows(SparseRows::new(10, vec![1, 7], value).unwrap())
            .to_bytes()
            .unwrap()
    }

    #[test]
    fn test_var_kind_parsing() {
        assert_eq!("dense".parse::<VarKind>().unwrap(), VarKind::Dense);
        assert_eq!("selected_rows".parse::<VarKind>().unwrap(), VarKind::SparseRows);
        assert!(matches!(
            "raw_bytes".parse::<VarKind>(),
            Err(Error::UnsupportedVariableKind(k)) if k == "raw_bytes"
        ));
    }

    #[test]
    fn test_dense_shape_checked() {
        assert!(DenseTensor::new(vec![2, 2], vec![0.0; 3]).is_err());
        let t = DenseTensor::new(vec![2, 3], vec![0.0; 6]).unwrap();
        assert_eq!(t.row_width(), 3);
        assert_eq!(t.numel(), 6);
    }

    #[test]
    fn test_sparse_rejects_out_of_range_rows() {
        let value = DenseTensor::new(vec![1, 2], vec![0.0; 2]).unwrap();
        assert!(SparseRows::new(4, vec![4], value.clone()).is_err());
        assert!(SparseRows::new(4, vec![1, 2], value).is_err());
    }

    #[test]
    fn test_deserialize_into_unknown_slot() {
        let mut store = VariableStore::new();
        let err = store.deserialize_into("missing", &sparse_payload()).unwrap_err();
        assert!(matches!(err, Error::UnknownVariable(name) if name == "missing"));
    }

    #[test]
    fn test_deserialize_into_kind_mismatch() {
        let mut store = VariableStore::new();
        store.declare("w", Variable::empty(VarKind::Dense, &[10, 3]));
        let err = store.deserialize_into("w", &sparse_payload()).unwrap_err();
        assert!(matches!(err, Error::VariableKindMismatch { .. }));
        // slot keeps its previous value
        assert_eq!(store.get("w").unwrap().kind(), VarKind::Dense);
    }

    #[test]
    fn test_payload_round_trip_through_store() {
        let mut store = VariableStore::new();
        store.declare("emb@GRAD.trainer_0", Variable::empty(VarKind::SparseRows, &[10, 3]));

        let payload = sparse_payload();
        let kind = store.deserialize_into("emb@GRAD.trainer_0", &payload).unwrap();
        assert_eq!(kind, VarKind::SparseRows);

        let stored = store.get("emb@GRAD.trainer_0").unwrap();
        assert_eq!(stored, &Variable::from_bytes(&payload).unwrap());
        assert_eq!(stored.to_bytes().unwrap(), payload);
    }

    #[test]
    fn test_malformed_payloads_are_rejected() {
        let mut store = VariableStore::new();
        store.declare("w", Variable::empty(VarKind::Dense, &[2]));
        store.declare("emb", Variable::empty(VarKind::SparseRows, &[4, 2]));

        let short_data = Variable::SparseRows(SparseRows {
            height: 4,
            rows: vec![0, 1],
            value: DenseTensor {
                dims: vec![2, 2],
                data: vec![1.0, 1.0],
            },
        });
        let negative_row = Variable::SparseRows(SparseRows {
            height: 4,
            rows: vec![-1],
            value: DenseTensor::zeros(&[1, 2]),
        });
        let wrong_height = Variable::SparseRows(SparseRows {
            height: 9,
            rows: vec![8],
            value: DenseTensor::zeros(&[1, 2]),
        });
        let wrong_width = Variable::SparseRows(SparseRows {
            height: 4,
            rows: vec![1],
            value: DenseTensor::zeros(&[1, 3]),
        });
        for bad in [short_data, negative_row, wrong_height, wrong_width] {
            let err = store.deserialize_into("emb", &bad.to_bytes().unwrap()).unwrap_err();
            assert!(matches!(err, Error::MalformedVariable { ref name, .. } if name == "emb"));
        }

        let wrong_dims = Variable::Dense(DenseTensor::zeros(&[3]));
        assert!(matches!(
            store.write("w", wrong_dims),
            Err(Error::MalformedVariable { .. })
        ));

        assert_eq!(store.get("emb").unwrap(), &Variable::empty(VarKind::SparseRows, &[4, 2]));
        assert!(!store.is_written("emb"));
        assert!(!store.is_written("w"));
    }

    #[test]
    fn test_written_slots_are_tracked_until_cleared() {
        let mut store = VariableStore::new();
        store.declare("a", Variable::empty(VarKind::Dense, &[1]));
        store.declare("b", Variable::empty(VarKind::Dense, &[1]));
        assert!(!store.is_written("a"));

        store.write("a", Variable::Dense(DenseTensor::zeros(&[1]))).unwrap();
        assert!(store.is_written("a"));
        assert!(!store.is_written("b"));

        store.clear_written();
        assert!(!store.is_written("a"));
        // the value itself survives
        assert!(store.contains("a"));
    }

    #[test]
    fn test_clear_rows_keeps_values() {
        let mut store = VariableStore::new();
        store.declare("emb", Variable::empty(VarKind::SparseRows, &[10, 3]));
        store.deserialize_into("emb", &sparse_payload()).unwrap();

        store.clear_rows("emb").unwrap();

        let sparse = store.get("emb").unwrap().as_sparse().unwrap();
        assert!(sparse.rows.is_empty());
        assert_eq!(sparse.value.data.len(), 6);
        assert_eq!(sparse.height, 10);
    }

    #[test]
    fn test_from_config_expands_trainer_slots() {
        let config = ServerConfig::default()
            .with_fan_in(3)
            .with_param_grad("w", "w@GRAD")
            .with_variable(VariableDecl::new("w", "dense", vec![4]))
            .with_variable(VariableDecl::new("w@GRAD", "dense", vec![4]))
            .with_variable(VariableDecl::new("lr", "dense", vec![1]));

        let store = VariableStore::from_config(&config).unwrap();
        assert!(store.contains("w@GRAD"));
        for k in 0..3 {
            assert!(store.contains(&format!("w@GRAD.trainer_{}", k)));
        }
        assert!(!store.contains("w.trainer_0"));
        assert!(!store.contains("lr.trainer_0"));
        assert_eq!(store.len(), 6);
    }

    #[test]
    fn test_from_config_rejects_unsupported_kind() {
        let config = ServerConfig::default()
            .with_variable(VariableDecl::new("w", "string_tensor", vec![4]));
        assert!(matches!(
            VariableStore::from_config(&config),
            Err(Error::UnsupportedVariableKind(_))
        ));
    }

    #[test]
    fn test_snapshot() {
        let mut store = VariableStore::new();
        store.declare("w", Variable::empty(VarKind::Dense, &[2]));
        let snap = store.snapshot(&["w".to_string()]).unwrap();
        let w = Variable::from_bytes(&snap["w"]).unwrap();
        assert_eq!(w.as_dense().unwrap().data, vec![0.0, 0.0]);
        assert!(store.snapshot(&["nope".to_string()]).is_err());
    }
}
