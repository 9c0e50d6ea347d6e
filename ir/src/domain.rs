//! Tensor domains: the root/logical/allocation/loop views of one tensor's
//! axes, plus the recorded transformation history connecting them.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::iter_domain::IterDomain;
use crate::scalar::Extent;
use crate::transform::Transform;
use crate::types::{Swizzle2DKind, SwizzleKind};

/// One tensor's axis bookkeeping.
///
/// - `root`: the axes as produced by the tensor's definition.
/// - `logical`: the axes consumers address; differs from `root` only when an
///   rfactor reshaped the tensor.
/// - `allocation`: the axes the buffer is laid out in, when set explicitly.
/// - `loop`: the axes the generated loop nest iterates, rewritten in place by
///   the scheduling operations below.
///
/// Contiguity flags align positionally with the allocation domain (falling
/// back to `logical`); broadcast slots carry `None`.
#[derive(Debug, Clone)]
pub struct TensorDomain {
    root: Vec<Arc<IterDomain>>,
    logical: Vec<Arc<IterDomain>>,
    allocation: Option<Vec<Arc<IterDomain>>>,
    loop_domain: Vec<Arc<IterDomain>>,
    contiguity: Vec<Option<bool>>,
    transforms: Vec<Arc<Transform>>,
}

fn validate_contiguity(domain: &[Arc<IterDomain>], contiguity: &[Option<bool>]) -> Result<()> {
    if domain.len() != contiguity.len() {
        return Err(Error::ContiguityLengthMismatch {
            expected: domain.len(),
            found: contiguity.len(),
        });
    }
    for (axis, (id, flag)) in domain.iter().zip(contiguity).enumerate() {
        if id.is_broadcast() && flag.is_some() {
            return Err(Error::ContiguityOnBroadcast { axis });
        }
    }
    Ok(())
}

impl TensorDomain {
    pub fn new(logical: Vec<Arc<IterDomain>>, contiguity: Vec<Option<bool>>) -> Result<Self> {
        validate_contiguity(&logical, &contiguity)?;
        Ok(Self {
            root: logical.clone(),
            loop_domain: logical.clone(),
            logical,
            allocation: None,
            contiguity,
            transforms: Vec::new(),
        })
    }

    /// Fully contiguous domain; broadcast axes get `None` flags.
    pub fn new_contiguous(logical: Vec<Arc<IterDomain>>) -> Self {
        let contiguity = logical
            .iter()
            .map(|id| if id.is_broadcast() { None } else { Some(true) })
            .collect();
        Self {
            root: logical.clone(),
            loop_domain: logical.clone(),
            logical,
            allocation: None,
            contiguity,
            transforms: Vec::new(),
        }
    }

    /// Domain whose logical axes were produced from `root` by rfactor
    /// transformations.
    pub fn with_root(
        root: Vec<Arc<IterDomain>>,
        logical: Vec<Arc<IterDomain>>,
        transforms: Vec<Arc<Transform>>,
        contiguity: Vec<Option<bool>>,
    ) -> Result<Self> {
        validate_contiguity(&logical, &contiguity)?;
        Ok(Self {
            root,
            loop_domain: logical.clone(),
            logical,
            allocation: None,
            contiguity,
            transforms,
        })
    }

    pub fn root(&self) -> &[Arc<IterDomain>] {
        &self.root
    }

    pub fn logical(&self) -> &[Arc<IterDomain>] {
        &self.logical
    }

    pub fn loop_domain(&self) -> &[Arc<IterDomain>] {
        &self.loop_domain
    }

    pub fn allocation(&self) -> Option<&[Arc<IterDomain>]> {
        self.allocation.as_deref()
    }

    /// Allocation domain, falling back to logical when unset.
    pub fn maybe_allocation(&self) -> &[Arc<IterDomain>] {
        self.allocation.as_deref().unwrap_or(&self.logical)
    }

    pub fn contiguity(&self) -> &[Option<bool>] {
        &self.contiguity
    }

    pub fn transforms(&self) -> &[Arc<Transform>] {
        &self.transforms
    }

    pub fn ndims(&self) -> usize {
        self.loop_domain.len()
    }

    pub fn axis(&self, pos: usize) -> Result<&Arc<IterDomain>> {
        self.loop_domain
            .get(pos)
            .ok_or(Error::AxisOutOfBounds { axis: pos, ndims: self.loop_domain.len() })
    }

    pub fn set_allocation(
        &mut self,
        allocation: Vec<Arc<IterDomain>>,
        contiguity: Vec<Option<bool>>,
    ) -> Result<()> {
        validate_contiguity(&allocation, &contiguity)?;
        self.allocation = Some(allocation);
        self.contiguity = contiguity;
        Ok(())
    }

    fn check_axis(&self, pos: usize) -> Result<()> {
        if pos >= self.loop_domain.len() {
            return Err(Error::AxisOutOfBounds { axis: pos, ndims: self.loop_domain.len() });
        }
        Ok(())
    }

    /// Split loop axis `pos`, leaving `(outer, inner)` in its place.
    pub fn split(&mut self, pos: usize, factor: Extent, inner_split: bool) -> Result<()> {
        self.check_axis(pos)?;
        let (outer, inner, t) =
            IterDomain::split(&self.loop_domain[pos], factor, inner_split, false);
        self.loop_domain.splice(pos..=pos, [outer, inner]);
        self.transforms.push(t);
        Ok(())
    }

    /// Merge loop axes `pos` (outer) and `pos + 1` (inner).
    pub fn merge(&mut self, pos: usize) -> Result<()> {
        self.check_axis(pos + 1)?;
        let (out, t) =
            IterDomain::merge(&self.loop_domain[pos], &self.loop_domain[pos + 1], false);
        self.loop_domain.splice(pos..=pos + 1, [out]);
        self.transforms.push(t);
        Ok(())
    }

    pub fn swizzle(&mut self, kind: SwizzleKind, pos: usize) -> Result<()> {
        self.check_axis(pos + 1)?;
        let (out_x, out_y, t) =
            IterDomain::swizzle(kind, &self.loop_domain[pos], &self.loop_domain[pos + 1]);
        self.loop_domain.splice(pos..=pos + 1, [out_x, out_y]);
        self.transforms.push(t);
        Ok(())
    }

    pub fn swizzle_2d(&mut self, kind: Swizzle2DKind, pos: usize) -> Result<()> {
        self.check_axis(pos + 1)?;
        let (out_x, out_y, t) =
            IterDomain::swizzle_2d(kind, &self.loop_domain[pos], &self.loop_domain[pos + 1]);
        self.loop_domain.splice(pos..=pos + 1, [out_x, out_y]);
        self.transforms.push(t);
        Ok(())
    }

    pub fn resize(&mut self, pos: usize, left: i64, right: i64) -> Result<()> {
        self.check_axis(pos)?;
        let (out, t) = IterDomain::resize(&self.loop_domain[pos], left, right, false);
        self.loop_domain[pos] = out;
        self.transforms.push(t);
        Ok(())
    }
}

/// Filter out reduction axes, preserving order.
pub fn no_reductions(ids: &[Arc<IterDomain>]) -> Vec<Arc<IterDomain>> {
    ids.iter().filter(|id| !id.is_reduction()).cloned().collect()
}

/// Filter out broadcast axes, preserving order.
pub fn no_broadcasts(ids: &[Arc<IterDomain>]) -> Vec<Arc<IterDomain>> {
    ids.iter().filter(|id| !id.is_broadcast()).cloned().collect()
}
