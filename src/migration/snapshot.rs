// src/migration/snapshot.rs

//! The wire shape shipped between source and destination during step 3-4
//! of the migration protocol, and the capture routine that builds one from
//! a resident [`ProcletEntry`].

use crate::error::NuResult;
use crate::invocation::registry::{self, CtorId};
use crate::proclet::{ProcletEntry, ProcletId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Everything the destination needs to install a proclet as if it had been
/// constructed there directly.
#[derive(Debug, Serialize, Deserialize)]
pub struct MigrationStream {
    pub proclet_id: ProcletId,
    pub ctor: CtorId,
    pub object_bytes: Vec<u8>,
    pub capacity_bytes: usize,
    pub pinned: bool,
    pub ref_count: i64,
}

impl MigrationStream {
    pub fn encode(&self) -> NuResult<Vec<u8>> {
        crate::rpc::wire::archive_encode(self)
    }
}

/// Snapshots a resident proclet's object through the codec registry, plus
/// the header state the destination needs to reconstruct it faithfully.
pub fn capture(entry: &Arc<ProcletEntry>, id: ProcletId) -> NuResult<MigrationStream> {
    let object_bytes = {
        let obj = entry.object.lock();
        registry::snapshot_object(entry.ctor, obj.as_ref())?
    };
    Ok(MigrationStream {
        proclet_id: id,
        ctor: entry.ctor,
        object_bytes,
        capacity_bytes: entry.header.slab.capacity(),
        pinned: entry.header.is_pinned(),
        ref_count: entry.header.ref_count(),
    })
}
