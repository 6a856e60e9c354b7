//! Named transform registry with one shared free-parameter vector.
//!
//! Every atomic transform's parameters live in a single arena. After
//! [`TransformRegistry::rebuild_parameter_vector`] the free atomics, sorted by
//! name, occupy a contiguous prefix of that arena, so the free-parameter vector
//! is exactly that prefix and an atomic's arena offset is its index into it.
//!
//! Structural changes (learning a map, fixing a map, replacing a map, a
//! rebuild) bump a generation counter. Views handed out by
//! [`TransformRegistry::issue`] remember the generation they were issued at and
//! refuse to bind once it has moved. Between a structural change and the next
//! rebuild the layout is dirty and offset-based access to the free vector
//! fails with [`FitError::LayoutStale`].

mod fixing;
mod serialize;
mod view;

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::DVector;
use tracing::debug;

use crate::error::{FitError, Result};
use crate::transform::{
    AtomicMap, CompositeMap, MapKind, MapShape, PixelMap, Transform, IDENTITY_NAME,
};

pub use serialize::FORMAT_VERSION;
pub use view::{BoundMap, FreeBlock, Link, MapView};

#[derive(Debug, Clone, PartialEq)]
struct AtomEntry {
    shape: MapShape,
    offset: usize,
    fixed: bool,
    defaulted: bool,
}

impl AtomEntry {
    fn count(&self) -> usize {
        self.shape.n_params()
    }

    fn is_free(&self) -> bool {
        !self.fixed && self.count() > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Atomic(AtomEntry),
    Composite(Vec<String>),
}

/// A namespace of named transforms sharing one parameter arena.
#[derive(Debug, Clone, Default)]
pub struct TransformRegistry {
    entries: BTreeMap<String, Entry>,
    arena: Vec<f64>,
    n_free: usize,
    generation: u64,
    dirty: bool,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current structural generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True if the layout changed since the last rebuild.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn touch(&mut self) {
        self.generation += 1;
        self.dirty = true;
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All map names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Names of all atomic maps, sorted.
    pub fn atomic_names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, e)| matches!(e, Entry::Atomic(_)))
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn kind(&self, name: &str) -> Result<MapKind> {
        match self.entry(name)? {
            Entry::Atomic(a) => Ok(a.shape.kind()),
            Entry::Composite(_) => Ok(MapKind::Composite),
        }
    }

    /// Direct elements of a composite, or `None` for an atomic map.
    pub fn elements(&self, name: &str) -> Result<Option<&[String]>> {
        match self.entry(name)? {
            Entry::Atomic(_) => Ok(None),
            Entry::Composite(e) => Ok(Some(e)),
        }
    }

    fn entry(&self, name: &str) -> Result<&Entry> {
        self.entries
            .get(name)
            .ok_or_else(|| FitError::NotFound(name.to_string()))
    }

    fn atom(&self, name: &str) -> Result<&AtomEntry> {
        match self.entry(name)? {
            Entry::Atomic(a) => Ok(a),
            Entry::Composite(_) => Err(FitError::configuration(
                "expected an atomic map",
                vec![name.to_string()],
            )),
        }
    }

    fn atom_mut(&mut self, name: &str) -> Result<&mut AtomEntry> {
        match self.entries.get_mut(name) {
            Some(Entry::Atomic(a)) => Ok(a),
            Some(Entry::Composite(_)) => Err(FitError::configuration(
                "expected an atomic map",
                vec![name.to_string()],
            )),
            None => Err(FitError::NotFound(name.to_string())),
        }
    }

    // ── Learning ────────────────────────────────────────────────────────────

    /// Register a transform. Composites register their elements recursively.
    pub fn learn(&mut self, transform: &Transform) -> Result<()> {
        match transform {
            Transform::Atomic(a) => {
                self.insert_atomic(a.name(), *a.shape(), a.param_slice(), a.fixed, a.defaulted)
            }
            Transform::Composite(c) => {
                for e in c.elements() {
                    self.learn(e)?;
                }
                let names = c.elements().iter().map(|e| e.name().to_string()).collect();
                self.learn_composite(c.name(), names)
            }
        }
    }

    /// Register an atomic map. Without parameters the map starts at the identity
    /// and is flagged as defaulted.
    pub fn learn_atomic(&mut self, name: &str, shape: MapShape, params: Option<&[f64]>) -> Result<()> {
        match params {
            Some(p) => self.insert_atomic(name, shape, p, false, false),
            None => {
                let identity = shape.identity_params();
                self.insert_atomic(name, shape, &identity, false, shape.n_params() > 0)
            }
        }
    }

    /// Register the parameter-free identity map under [`IDENTITY_NAME`].
    pub fn learn_identity(&mut self) -> Result<()> {
        self.insert_atomic(IDENTITY_NAME, MapShape::Identity, &[], false, false)
    }

    /// Register a chain of previously or subsequently learned maps.
    pub fn learn_composite(&mut self, name: &str, elements: Vec<String>) -> Result<()> {
        if let Some(existing) = self.entries.get(name) {
            return match existing {
                Entry::Composite(e) if *e == elements => Ok(()),
                _ => Err(FitError::DuplicateName(name.to_string())),
            };
        }
        self.entries.insert(name.to_string(), Entry::Composite(elements));
        self.touch();
        Ok(())
    }

    fn insert_atomic(
        &mut self,
        name: &str,
        shape: MapShape,
        params: &[f64],
        fixed: bool,
        defaulted: bool,
    ) -> Result<()> {
        if let Some(existing) = self.entries.get(name) {
            return match existing {
                Entry::Atomic(a) if a.shape == shape => Ok(()),
                _ => Err(FitError::DuplicateName(name.to_string())),
            };
        }
        if params.len() != shape.n_params() {
            return Err(FitError::ParameterCount {
                name: name.to_string(),
                expected: shape.n_params(),
                got: params.len(),
            });
        }
        let offset = self.arena.len();
        self.arena.extend_from_slice(params);
        self.entries.insert(
            name.to_string(),
            Entry::Atomic(AtomEntry {
                shape,
                offset,
                fixed,
                defaulted,
            }),
        );
        self.touch();
        Ok(())
    }

    /// Replace an atomic map by a parameter-free identity of the same name.
    pub fn set_identity(&mut self, name: &str) -> Result<()> {
        let atom = self.atom_mut(name)?;
        atom.shape = MapShape::Identity;
        atom.defaulted = false;
        self.touch();
        Ok(())
    }

    // ── Flags ───────────────────────────────────────────────────────────────

    /// Fix every atomic map reachable from the given names.
    pub fn set_fixed<I, S>(&mut self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut atoms = Vec::new();
        for name in names {
            atoms.extend(self.order_atoms(name.as_ref())?);
        }
        for a in atoms {
            self.atom_mut(&a)?.fixed = true;
        }
        self.touch();
        Ok(())
    }

    /// True if no parameter of the map can vary.
    pub fn is_fixed(&self, name: &str) -> Result<bool> {
        for a in self.order_atoms(name)? {
            if self.atom(&a)?.is_free() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// True if any atomic in the map still has default parameters.
    pub fn is_defaulted(&self, name: &str) -> Result<bool> {
        for a in self.order_atoms(name)? {
            if self.atom(&a)?.defaulted {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn set_defaulted(&mut self, name: &str, defaulted: bool) -> Result<()> {
        for a in self.order_atoms(name)? {
            self.atom_mut(&a)?.defaulted = defaulted;
        }
        Ok(())
    }

    // ── Free parameter vector ───────────────────────────────────────────────

    /// Lay out the arena with all free atomics, sorted by name, as its prefix.
    pub fn rebuild_parameter_vector(&mut self) {
        let mut free = Vec::new();
        let mut rest = Vec::new();
        for (name, e) in &self.entries {
            if let Entry::Atomic(a) = e {
                if a.is_free() {
                    free.push(name.clone());
                } else {
                    rest.push(name.clone());
                }
            }
        }

        let mut arena = Vec::with_capacity(self.arena.len());
        let mut n_free = 0;
        for (i, name) in free.iter().chain(rest.iter()).enumerate() {
            if let Some(Entry::Atomic(a)) = self.entries.get_mut(name) {
                let count = a.count();
                arena.extend_from_slice(&self.arena[a.offset..a.offset + count]);
                a.offset = arena.len() - count;
                if i < free.len() {
                    n_free += count;
                }
            }
        }
        self.arena = arena;
        self.n_free = n_free;
        self.generation += 1;
        self.dirty = false;
        debug!(
            "Rebuilt parameter vector: {} free maps, {} free parameters",
            free.len(),
            n_free
        );
    }

    /// Fails with [`FitError::LayoutStale`] between a structural change and the next rebuild.
    pub(crate) fn require_clean(&self) -> Result<()> {
        if self.dirty {
            Err(FitError::LayoutStale)
        } else {
            Ok(())
        }
    }

    pub fn free_parameters(&self) -> Result<DVector<f64>> {
        self.require_clean()?;
        Ok(DVector::from_column_slice(&self.arena[..self.n_free]))
    }

    pub fn set_free_parameters(&mut self, params: &DVector<f64>) -> Result<()> {
        self.require_clean()?;
        if params.len() != self.n_free {
            return Err(FitError::ParameterCount {
                name: "free parameter vector".to_string(),
                expected: self.n_free,
                got: params.len(),
            });
        }
        self.arena[..self.n_free].copy_from_slice(params.as_slice());
        Ok(())
    }

    /// Number of free parameters implied by the current flags.
    pub fn n_free_params(&self) -> usize {
        self.entries
            .values()
            .filter_map(|e| match e {
                Entry::Atomic(a) if a.is_free() => Some(a.count()),
                _ => None,
            })
            .sum()
    }

    pub fn n_free_maps(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, Entry::Atomic(a) if a.is_free()))
            .count()
    }

    /// Atomic map owning a free-vector index, and the index within that map.
    pub fn param_block_of(&self, index: usize) -> Option<(&str, usize)> {
        if self.dirty || index >= self.n_free {
            return None;
        }
        self.entries.iter().find_map(|(name, e)| match e {
            Entry::Atomic(a) if a.is_free() && (a.offset..a.offset + a.count()).contains(&index) => {
                Some((name.as_str(), index - a.offset))
            }
            _ => None,
        })
    }

    pub(crate) fn arena(&self) -> &[f64] {
        &self.arena
    }

    // ── Views and copies ────────────────────────────────────────────────────

    /// Atomic names of a map in application order, nested chains flattened.
    pub fn order_atoms(&self, name: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut stack = Vec::new();
        self.flatten_into(name, &mut stack, &mut out)?;
        Ok(out)
    }

    fn flatten_into(&self, name: &str, stack: &mut Vec<String>, out: &mut Vec<String>) -> Result<()> {
        match self.entry(name)? {
            Entry::Atomic(_) => out.push(name.to_string()),
            Entry::Composite(elements) => {
                if stack.iter().any(|s| s == name) {
                    stack.push(name.to_string());
                    return Err(FitError::configuration("cyclic composite map", stack.clone()));
                }
                stack.push(name.to_string());
                for e in elements {
                    self.flatten_into(e, stack, out)?;
                }
                stack.pop();
            }
        }
        Ok(())
    }

    /// A view of a map bound to the current generation.
    pub fn issue(&self, name: &str) -> Result<MapView> {
        let mut links = Vec::new();
        for atom_name in self.order_atoms(name)? {
            let a = self.atom(&atom_name)?;
            links.push(Link {
                name: atom_name,
                shape: a.shape,
                offset: a.offset,
                count: a.count(),
                free: a.is_free(),
            });
        }
        Ok(MapView::new(name.to_string(), self.generation, links))
    }

    /// Deep owned copy of a map, flags included.
    pub fn clone_map(&self, name: &str) -> Result<Transform> {
        let mut stack = Vec::new();
        self.clone_inner(name, &mut stack)
    }

    fn clone_inner(&self, name: &str, stack: &mut Vec<String>) -> Result<Transform> {
        match self.entry(name)? {
            Entry::Atomic(a) => {
                let params = self.arena[a.offset..a.offset + a.count()].to_vec();
                let mut map = AtomicMap::with_params(name, a.shape, params)?;
                map.fixed = a.fixed;
                map.defaulted = a.defaulted;
                Ok(map.into())
            }
            Entry::Composite(elements) => {
                if stack.iter().any(|s| s == name) {
                    return Err(FitError::configuration("cyclic composite map", stack.clone()));
                }
                stack.push(name.to_string());
                let elements = elements
                    .iter()
                    .map(|e| self.clone_inner(e, stack))
                    .collect::<Result<Vec<_>>>()?;
                stack.pop();
                Ok(CompositeMap::new(name, elements).into())
            }
        }
    }

    /// Copy parameters from an owned transform back into the registry and mark
    /// every atomic written as no longer defaulted.
    ///
    /// Atomics are matched by name and must belong to the chain of `name`.
    pub fn copy_params_into(&mut self, name: &str, source: &Transform) -> Result<()> {
        let members = self.order_atoms(name)?;
        let atoms = source.atoms();
        for atom in &atoms {
            if !members.iter().any(|m| m == atom.name()) {
                return Err(FitError::NotFound(atom.name().to_string()));
            }
            let entry = self.atom(atom.name())?;
            if entry.shape != *atom.shape() {
                return Err(FitError::DuplicateName(atom.name().to_string()));
            }
        }
        for atom in atoms {
            let entry = self.atom_mut(atom.name())?;
            entry.defaulted = false;
            let (offset, count) = (entry.offset, entry.count());
            self.arena[offset..offset + count].copy_from_slice(atom.param_slice());
        }
        Ok(())
    }

    /// Parameters of a map, concatenated over its atomics in chain order.
    pub fn params_of(&self, name: &str) -> Result<DVector<f64>> {
        let mut out = Vec::new();
        for a in self.order_atoms(name)? {
            let e = self.atom(&a)?;
            out.extend_from_slice(&self.arena[e.offset..e.offset + e.count()]);
        }
        Ok(DVector::from_vec(out))
    }

    /// Overwrite the parameters of one atomic map.
    pub fn set_map_params(&mut self, name: &str, params: &[f64]) -> Result<()> {
        let e = self.atom(name)?;
        let (offset, count) = (e.offset, e.count());
        if params.len() != count {
            return Err(FitError::ParameterCount {
                name: name.to_string(),
                expected: count,
                got: params.len(),
            });
        }
        self.arena[offset..offset + count].copy_from_slice(params);
        Ok(())
    }

    // ── Validation and housekeeping ─────────────────────────────────────────

    /// Reject fixed-and-defaulted atomics, dangling chain members and cycles.
    pub fn validate(&self) -> Result<()> {
        let frozen: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e, Entry::Atomic(a) if a.fixed && a.defaulted))
            .map(|(n, _)| n.clone())
            .collect();
        if !frozen.is_empty() {
            return Err(FitError::configuration(
                "maps are frozen at defaulted parameters",
                frozen,
            ));
        }

        for (name, e) in &self.entries {
            if let Entry::Composite(elements) = e {
                let missing: Vec<String> = elements
                    .iter()
                    .filter(|el| !self.entries.contains_key(el.as_str()))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(FitError::configuration(
                        format!("composite <{name}> references unknown maps"),
                        missing,
                    ));
                }
                self.order_atoms(name)?;
            }
        }
        Ok(())
    }

    /// Drop every map not reachable from `roots`. Returns the removed names.
    pub fn purge_unreferenced<S: AsRef<str>>(&mut self, roots: &[S]) -> Result<Vec<String>> {
        let mut keep = BTreeSet::new();
        let mut pending: Vec<String> = roots.iter().map(|r| r.as_ref().to_string()).collect();
        while let Some(name) = pending.pop() {
            if !keep.insert(name.clone()) {
                continue;
            }
            if let Entry::Composite(elements) = self.entry(&name)? {
                pending.extend(elements.iter().cloned());
            }
        }

        let removed: Vec<String> = self
            .entries
            .keys()
            .filter(|n| !keep.contains(*n))
            .cloned()
            .collect();
        if !removed.is_empty() {
            self.entries.retain(|n, _| keep.contains(n));
            self.touch();
            debug!("Purged {} unreferenced maps", removed.len());
        }
        Ok(removed)
    }
}
