// src/invocation/registry.rs

//! Method and constructor dispatch tables.
//!
//! The original source calls `proclet.run(&T::f, args)` with a literal
//! function pointer, which works because every node runs the same binary
//! and pointers are meaningful cluster-wide. Safe Rust cannot serialize a
//! function pointer and trust it on another process, so the same "same
//! binary everywhere" assumption is expressed instead as a stable numeric
//! `MethodId`/`CtorId` that every node registers against at startup (see
//! DESIGN NOTES, "Deep template inheritance in the source"). Call sites
//! that used to write `&T::f` instead write a small constant the type
//! defines once, e.g. `const INCR: MethodId = MethodId(1)`.

use crate::error::{NuError, NuResult};
use crate::rpc::wire::{archive_decode, archive_encode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct CtorId(pub u64);

type ErasedMethod = Arc<dyn Fn(&mut dyn Any, &[u8]) -> NuResult<Vec<u8>> + Send + Sync>;
type ErasedCtor = Arc<dyn Fn(&[u8]) -> NuResult<Box<dyn Any + Send>> + Send + Sync>;
type ErasedSnapshot = Arc<dyn Fn(&dyn Any) -> NuResult<Vec<u8>> + Send + Sync>;
type ErasedRestore = Arc<dyn Fn(&[u8]) -> NuResult<Box<dyn Any + Send>> + Send + Sync>;

#[derive(Default)]
pub struct MethodRegistry {
    methods: parking_lot::RwLock<HashMap<MethodId, ErasedMethod>>,
    ctors: parking_lot::RwLock<HashMap<CtorId, ErasedCtor>>,
    snapshots: parking_lot::RwLock<HashMap<CtorId, ErasedSnapshot>>,
    restores: parking_lot::RwLock<HashMap<CtorId, ErasedRestore>>,
}

static REGISTRY: OnceLock<MethodRegistry> = OnceLock::new();

fn registry() -> &'static MethodRegistry {
    REGISTRY.get_or_init(MethodRegistry::default)
}

/// Registers a closure callable through `MethodId` against a concrete
/// proclet type `T`. Call during process startup, before any node boots.
pub fn register_method<T, A, R, F>(id: MethodId, f: F)
where
    T: 'static,
    A: DeserializeOwned,
    R: Serialize,
    F: Fn(&mut T, A) -> NuResult<R> + Send + Sync + 'static,
{
    let erased: ErasedMethod = Arc::new(move |obj, bytes| {
        let obj = obj
            .downcast_mut::<T>()
            .ok_or_else(|| NuError::Internal("method/object type mismatch".into()))?;
        let args: A = archive_decode(bytes)?;
        let ret = f(obj, args)?;
        archive_encode(&ret)
    });
    registry().methods.write().insert(id, erased);
}

/// Registers a constructor callable through `CtorId`, producing the boxed,
/// type-erased proclet object `make_proclet` installs in the registry.
pub fn register_constructor<T, A, F>(id: CtorId, f: F)
where
    T: Send + 'static,
    A: DeserializeOwned,
    F: Fn(A) -> T + Send + Sync + 'static,
{
    let erased: ErasedCtor = Arc::new(move |bytes| {
        let args: A = archive_decode(bytes)?;
        let obj: Box<dyn Any + Send> = Box::new(f(args));
        Ok(obj)
    });
    registry().ctors.write().insert(id, erased);
}

pub fn invoke_method(id: MethodId, obj: &mut dyn Any, arg_bytes: &[u8]) -> NuResult<Vec<u8>> {
    let methods = registry().methods.read();
    let f = methods
        .get(&id)
        .ok_or_else(|| NuError::Internal(format!("unregistered method id {}", id.0)))?
        .clone();
    drop(methods);
    f(obj, arg_bytes)
}

pub fn construct(id: CtorId, arg_bytes: &[u8]) -> NuResult<Box<dyn Any + Send>> {
    let ctors = registry().ctors.read();
    let f = ctors
        .get(&id)
        .ok_or_else(|| NuError::Internal(format!("unregistered ctor id {}", id.0)))?
        .clone();
    drop(ctors);
    f(arg_bytes)
}

/// Registers the pair of hooks the migrator needs to snapshot and restore
/// a proclet's object across a migration stream: a type has exactly one
/// ctor, so the same `CtorId` keys both its constructor and its codec.
/// Types that are already plain `Serialize + DeserializeOwned` structs
/// (the common case) need nothing beyond this one call.
pub fn register_codec<T>(id: CtorId)
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let snapshot: ErasedSnapshot = Arc::new(|obj: &dyn Any| {
        let obj = obj
            .downcast_ref::<T>()
            .ok_or_else(|| NuError::Internal("snapshot/object type mismatch".into()))?;
        archive_encode(obj)
    });
    let restore: ErasedRestore = Arc::new(|bytes: &[u8]| {
        let obj: T = archive_decode(bytes)?;
        Ok(Box::new(obj) as Box<dyn Any + Send>)
    });
    registry().snapshots.write().insert(id, snapshot);
    registry().restores.write().insert(id, restore);
}

pub fn snapshot_object(id: CtorId, obj: &dyn Any) -> NuResult<Vec<u8>> {
    let snapshots = registry().snapshots.read();
    let f = snapshots
        .get(&id)
        .ok_or_else(|| NuError::Internal(format!("no codec registered for ctor id {}", id.0)))?
        .clone();
    drop(snapshots);
    f(obj)
}

pub fn restore_object(id: CtorId, bytes: &[u8]) -> NuResult<Box<dyn Any + Send>> {
    let restores = registry().restores.read();
    let f = restores
        .get(&id)
        .ok_or_else(|| NuError::Internal(format!("no codec registered for ctor id {}", id.0)))?
        .clone();
    drop(restores);
    f(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Counter(i64);

    #[test]
    fn register_and_invoke_roundtrip() {
        register_constructor::<Counter, i64, _>(CtorId(9001), Counter);
        register_method::<Counter, i64, i64, _>(CtorId(9001).0.into(), |c, delta| {
            c.0 += delta;
            Ok(c.0)
        });

        let args = archive_encode(&5i64).unwrap();
        let mut obj = construct(CtorId(9001), &args).unwrap();
        let result = invoke_method(MethodId(9001), obj.as_mut(), &archive_encode(&3i64).unwrap())
            .unwrap();
        let value: i64 = archive_decode(&result).unwrap();
        assert_eq!(value, 8);
    }
}

impl From<u64> for MethodId {
    fn from(v: u64) -> Self {
        MethodId(v)
    }
}
