//! Explicit type registry.
//!
//! Every stored type is registered once at startup under its stable
//! [`Entity::TYPE`] tag, together with at most one accessor feeding each
//! index:
//!
//! - `secondary`: per-tenant lookup value (`secondaryOrganisation`)
//! - `global`: cross-tenant lookup value (`secondaryGlobal`)
//! - `parallel`: named grouping value hashed into `parallelHash`
//!
//! and optionally a [`HashLocator`] that spreads the type over hashed
//! partitions.

use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::entity::Entity;
use crate::error::{TesseraResult, ValidationError};
use crate::record::{IndexValues, WriteRecord};

type ErasedAccessor = Arc<dyn Fn(&dyn Any) -> Option<String> + Send + Sync>;

fn erase<T, F>(accessor: F) -> ErasedAccessor
where
    T: Entity,
    F: Fn(&T) -> Option<String> + Send + Sync + 'static,
{
    Arc::new(move |any: &dyn Any| any.downcast_ref::<T>().and_then(&accessor))
}

/// Stable 64-bit hash of a parallel grouping value.
pub fn parallel_hash(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

// ============================================================================
// HASH LOCATOR
// ============================================================================

/// Physical location of a hashed id: partition suffix plus sort-key part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    pub hash_part: String,
    pub sort_part: String,
}

/// Optional extension that splits ids across hashed partitions.
///
/// Types using it trade away unfiltered scans and links for write
/// throughput on very large tenants.
pub trait HashLocator: Send + Sync {
    fn locate(&self, id: &str) -> Locator;

    /// Inverse of [`HashLocator::locate`].
    fn compose(&self, locator: &Locator) -> String;

    /// Partitions (and sort prefixes within them) a prefix scan must visit.
    /// `None` when the prefix cannot be resolved to a bounded partition set.
    fn expand(&self, prefix: &str) -> Option<Vec<Locator>>;
}

/// Uses the first `width` characters of the id as the hash part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixHashLocator {
    width: usize,
}

impl PrefixHashLocator {
    pub fn new(width: usize) -> Self {
        Self { width: width.max(1) }
    }

    fn split(&self, value: &str) -> (String, String) {
        let cut = value
            .char_indices()
            .nth(self.width)
            .map(|(i, _)| i)
            .unwrap_or(value.len());
        (value[..cut].to_string(), value[cut..].to_string())
    }
}

impl HashLocator for PrefixHashLocator {
    fn locate(&self, id: &str) -> Locator {
        let (hash_part, sort_part) = self.split(id);
        Locator {
            hash_part,
            sort_part,
        }
    }

    fn compose(&self, locator: &Locator) -> String {
        format!("{}{}", locator.hash_part, locator.sort_part)
    }

    fn expand(&self, prefix: &str) -> Option<Vec<Locator>> {
        if prefix.chars().count() < self.width {
            return None;
        }
        Some(vec![self.locate(prefix)])
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Everything the engine knows about one registered type.
#[derive(Clone)]
pub struct TypeDescriptor {
    type_name: &'static str,
    secondary: Option<ErasedAccessor>,
    global: Option<ErasedAccessor>,
    parallel: Option<(String, ErasedAccessor)>,
    locator: Option<Arc<dyn HashLocator>>,
}

impl TypeDescriptor {
    fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            secondary: None,
            global: None,
            parallel: None,
            locator: None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn locator(&self) -> Option<&Arc<dyn HashLocator>> {
        self.locator.as_ref()
    }

    pub fn is_hashed(&self) -> bool {
        self.locator.is_some()
    }

    /// Name of the declared parallel grouping key, if any.
    pub fn parallel_key(&self) -> Option<&str> {
        self.parallel.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }

    pub fn has_global(&self) -> bool {
        self.global.is_some()
    }

    fn index_values(&self, entity: &dyn Any) -> IndexValues {
        let tag = |value: String| format!("{}:{}", self.type_name, value);
        IndexValues {
            secondary: self.secondary.as_ref().and_then(|f| f(entity)).map(tag),
            global: self.global.as_ref().and_then(|f| f(entity)).map(tag),
            parallel_hash: self
                .parallel
                .as_ref()
                .and_then(|(_, f)| f(entity))
                .map(|v| parallel_hash(&v)),
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("type_name", &self.type_name)
            .field("secondary", &self.secondary.is_some())
            .field("global", &self.global.is_some())
            .field("parallel", &self.parallel_key())
            .field("hashed", &self.is_hashed())
            .finish()
    }
}

/// Static registry keyed by type tag. Built once, then shared read-only.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<&'static str, TypeDescriptor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`, returning a builder for its index declarations.
    /// Registering a type again resets its declarations.
    pub fn register<T: Entity>(&mut self) -> TypeRegistration<'_, T> {
        let descriptor = self
            .types
            .entry(T::TYPE)
            .and_modify(|d| *d = TypeDescriptor::new(T::TYPE))
            .or_insert_with(|| TypeDescriptor::new(T::TYPE));
        TypeRegistration {
            descriptor,
            _marker: PhantomData,
        }
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn descriptor(&self, type_name: &str) -> TesseraResult<&TypeDescriptor> {
        self.types.get(type_name).ok_or_else(|| {
            ValidationError::UnknownType {
                type_name: type_name.to_string(),
            }
            .into()
        })
    }

    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.types.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Compute the physical index values for `entity`.
    pub fn index_values<T: Entity>(&self, entity: &T) -> TesseraResult<IndexValues> {
        Ok(self.descriptor(T::TYPE)?.index_values(entity))
    }

    /// Build the untyped put request for `entity`.
    pub fn write_record<T: Entity>(&self, entity: &T) -> TesseraResult<WriteRecord> {
        let indexes = self.index_values(entity)?;
        let meta = entity.meta();
        Ok(WriteRecord {
            type_name: T::TYPE.to_string(),
            id: meta.id.clone(),
            item: serde_json::to_value(entity)?,
            revision: meta.revision,
            created_at: meta.created_at,
            links: meta.links().clone(),
            provenance: meta.provenance().cloned(),
            indexes,
        })
    }
}

/// Builder returned by [`TypeRegistry::register`].
pub struct TypeRegistration<'a, T> {
    descriptor: &'a mut TypeDescriptor,
    _marker: PhantomData<fn(&T)>,
}

impl<'a, T: Entity> TypeRegistration<'a, T> {
    /// Declare the per-tenant secondary index accessor.
    pub fn secondary<F>(self, accessor: F) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        self.descriptor.secondary = Some(erase(accessor));
        self
    }

    /// Declare the cross-tenant global index accessor.
    pub fn global<F>(self, accessor: F) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        self.descriptor.global = Some(erase(accessor));
        self
    }

    /// Declare the grouping key used by partitioned parallel scans.
    pub fn parallel<F>(self, name: impl Into<String>, accessor: F) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        self.descriptor.parallel = Some((name.into(), erase(accessor)));
        self
    }

    /// Spread this type over hashed partitions.
    pub fn hashed(self, locator: impl HashLocator + 'static) -> Self {
        self.descriptor.locator = Some(Arc::new(locator));
        self
    }
}
