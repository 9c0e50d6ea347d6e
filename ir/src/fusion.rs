//! The fusion container: tensors and tensor ops of one compilation unit.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ops::TensorOp;
use crate::tensor::{TensorView, TvKey};

/// Owns the tensors and operations of a single fusion.
///
/// Ops are appended producer-before-consumer, so `exprs()` is already in
/// output-dependency order; no re-sort happens at query time.
#[derive(Debug, Default)]
pub struct Fusion {
    tensors: Vec<Arc<TensorView>>,
    ops: Vec<Arc<TensorOp>>,
    inputs: Vec<Arc<TensorView>>,
    outputs: Vec<Arc<TensorView>>,
    definitions: HashMap<TvKey, Arc<TensorOp>>,
    uses: HashMap<TvKey, Vec<Arc<TensorOp>>>,
}

impl Fusion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, tv: Arc<TensorView>) -> Arc<TensorView> {
        self.inputs.push(tv.clone());
        self.tensors.push(tv.clone());
        tv
    }

    pub fn add_output(&mut self, tv: &Arc<TensorView>) {
        self.outputs.push(tv.clone());
    }

    /// Register an op; its outputs become known tensors of this fusion.
    pub fn add_op(&mut self, op: Arc<TensorOp>) -> Arc<TensorOp> {
        for out in op.outputs() {
            self.definitions.insert(TvKey::of(&out), op.clone());
            self.tensors.push(out);
        }
        for inp in op.inputs() {
            self.uses.entry(TvKey::of(&inp)).or_default().push(op.clone());
        }
        self.ops.push(op.clone());
        op
    }

    pub fn tensors(&self) -> &[Arc<TensorView>] {
        &self.tensors
    }

    /// All ops, producers before consumers.
    pub fn exprs(&self) -> &[Arc<TensorOp>] {
        &self.ops
    }

    pub fn inputs(&self) -> &[Arc<TensorView>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Arc<TensorView>] {
        &self.outputs
    }

    pub fn is_output(&self, tv: &Arc<TensorView>) -> bool {
        self.outputs.iter().any(|o| o.id() == tv.id())
    }

    pub fn is_input(&self, tv: &Arc<TensorView>) -> bool {
        self.inputs.iter().any(|i| i.id() == tv.id())
    }

    pub fn definition(&self, tv: &Arc<TensorView>) -> Option<&Arc<TensorOp>> {
        self.definitions.get(&TvKey::of(tv))
    }

    pub fn uses(&self, tv: &Arc<TensorView>) -> &[Arc<TensorOp>] {
        self.uses.get(&TvKey::of(tv)).map_or(&[], Vec::as_slice)
    }
}
